pub mod cluster;
pub mod component;
pub mod config;
pub mod constants;
pub mod prepull;
pub mod telemetry;
pub mod version;
