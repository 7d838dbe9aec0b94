use dialoguer::Confirm;
use snafu::{ensure, ResultExt};

/// Asks the operator a yes/no question.
pub trait Confirmer {
    /// Returns true only if the operator answered affirmatively.
    fn confirm(&mut self, question: &str) -> Result<bool>;
}

/// A `Confirmer` that asks on the controlling terminal. Anything but an explicit yes is a no.
#[derive(Clone, Debug, Default)]
pub struct TerminalPrompt;

impl TerminalPrompt {
    fn prompt_text(question: &str) -> String {
        format!("[upgrade/confirm] {}", question)
    }
}

impl Confirmer for TerminalPrompt {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        Confirm::new()
            .with_prompt(Self::prompt_text(question))
            .default(false)
            .interact()
            .context(prompt_error::IoSnafu)
    }
}

/// Asks `question` and fails with `UserDeclined` unless the operator agrees.
pub fn require_confirmation<C: Confirmer + ?Sized>(confirmer: &mut C, question: &str) -> Result<()> {
    let confirmed = confirmer.confirm(question)?;
    ensure!(confirmed, prompt_error::UserDeclinedSnafu);
    Ok(())
}

type Result<T> = std::result::Result<T, prompt_error::Error>;

pub mod prompt_error {
    use snafu::Snafu;

    #[derive(Debug, Snafu)]
    #[snafu(visibility(pub))]
    pub enum Error {
        #[snafu(display("Unable to prompt for confirmation: '{}'", source))]
        Io { source: dialoguer::Error },

        #[snafu(display("Won't proceed; the user didn't answer (Y|y) in order to continue"))]
        UserDeclined,
    }
}
