//! User-facing progress output and prompts.
//!
//! Build steps report progress through [`Ui`] rather than the log so the
//! operator sees a concise narrative on stdout while `tracing` output goes to
//! stderr.

use std::io::{self, BufRead, Write};

use tracing::warn;

/// Output sink and prompt used by the build steps.
pub trait Ui: Send + Sync {
    /// Headline progress message.
    fn say(&self, message: &str);

    /// Detail line, typically a status transition.
    fn message(&self, message: &str);

    /// Error surfaced to the operator.
    fn error(&self, message: &str);

    /// Prints `prompt` and reads one line of input.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the input cannot be read.
    fn ask(&self, prompt: &str) -> io::Result<String>;
}

/// [`Ui`] writing to stdout and reading from stdin.
#[derive(Clone, Copy, Debug, Default)]
pub struct ConsoleUi;

impl Ui for ConsoleUi {
    fn say(&self, message: &str) {
        writeln!(io::stdout(), "==> {message}").ok();
    }

    fn message(&self, message: &str) {
        writeln!(io::stdout(), "    {message}").ok();
    }

    fn error(&self, message: &str) {
        writeln!(io::stderr(), "error: {message}").ok();
    }

    fn ask(&self, prompt: &str) -> io::Result<String> {
        let mut stdout = io::stdout();
        write!(stdout, "{prompt} ")?;
        stdout.flush()?;
        let mut line = String::new();
        let read = io::stdin().lock().read_line(&mut line)?;
        if read == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "standard input closed",
            ));
        }
        Ok(line)
    }
}

/// Answer to the "object already exists" prompt.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Recreate {
    /// Delete the existing object and create it again.
    Recreate,
    /// Attempt creation anyway and let the conflict surface.
    Continue,
}

/// Asks whether an existing `kind` named `name` should be recreated.
///
/// Only the first character counts, in either case. An empty or unreadable
/// answer counts as [`Recreate::Continue`]; anything else re-prompts.
pub fn ask_for_recreation(ui: &dyn Ui, kind: &str, name: &str) -> Recreate {
    let prompt = format!(
        "{kind} {name} already exists. [r] recreate resource, [c] continue and let it fail:"
    );
    loop {
        match ui.ask(&prompt) {
            Ok(answer) => {
                let trimmed = answer.trim();
                match trimmed.chars().next().map(|first| first.to_ascii_lowercase()) {
                    Some('r') => return Recreate::Recreate,
                    Some('c') | None => return Recreate::Continue,
                    Some(_) => ui.message(&format!("unrecognised answer `{trimmed}`")),
                }
            }
            Err(err) => {
                warn!(error = %err, "prompt failed; continuing without recreation");
                return Recreate::Continue;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingUi;
    use rstest::rstest;

    #[rstest]
    #[case::recreate(&["r"], Recreate::Recreate)]
    #[case::continue_(&["c"], Recreate::Continue)]
    #[case::reprompt(&["x", " r\n"], Recreate::Recreate)]
    #[case::uppercase(&["R"], Recreate::Recreate)]
    #[case::first_character(&["recreate"], Recreate::Recreate)]
    #[case::continue_word(&["Continue"], Recreate::Continue)]
    #[case::empty(&["\n"], Recreate::Continue)]
    fn answers_select_recreation(#[case] answers: &[&str], #[case] expected: Recreate) {
        let ui = RecordingUi::with_answers(answers);
        assert_eq!(ask_for_recreation(&ui, "VirtualMachineExport", "img1"), expected);
        assert_eq!(ui.prompts().len(), answers.len());
    }

    #[rstest]
    fn exhausted_input_continues() {
        let ui = RecordingUi::default();
        assert_eq!(
            ask_for_recreation(&ui, "VirtualMachineExport", "img1"),
            Recreate::Continue
        );
    }
}
