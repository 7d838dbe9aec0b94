pub mod configfetch;
pub mod error;
pub mod health;
pub mod orchestrator;
pub mod policy;
pub mod postupgrade;
pub mod prepull;
pub mod prompt;
pub mod staticpod;
pub mod versions;
pub mod waiter;

pub use crate::error::{Error, Result};
pub use crate::orchestrator::{
    ApplyOptions, ApplyOutcome, PlanOptions, UpgradeOrchestrator, UpgradePlan,
};
