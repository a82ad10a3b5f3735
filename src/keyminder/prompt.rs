//! Password prompt capability.
//!
//! The engine never reads from a terminal or opens a dialog itself. Flows
//! that need a password (opening an encrypted file, changing the password)
//! ask a [`PasswordPrompt`] supplied by the caller. Returning `None` means the
//! user cancelled.

use crate::error::Result;
use console::Term;
use std::collections::VecDeque;
use zeroize::Zeroizing;

pub type Password = Zeroizing<String>;

pub trait PasswordPrompt {
    /// Asks for one secret. `hint` is the file's password hint, if any.
    fn ask(&mut self, message: &str, hint: Option<&str>) -> Result<Option<Password>>;
}

/// Terminal prompt for headless use. Input is not echoed.
#[derive(Debug)]
pub struct ConsolePrompt {
    term: Term,
}

impl Default for ConsolePrompt {
    fn default() -> Self {
        Self {
            term: Term::stderr(),
        }
    }
}

impl ConsolePrompt {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PasswordPrompt for ConsolePrompt {
    fn ask(&mut self, message: &str, hint: Option<&str>) -> Result<Option<Password>> {
        if let Some(hint) = hint.filter(|h| !h.is_empty()) {
            self.term.write_line(&format!("Hint: {hint}"))?;
        }
        self.term.write_str(&format!("{message}: "))?;
        let line = Zeroizing::new(self.term.read_secure_line()?);
        if line.is_empty() {
            return Ok(None);
        }
        Ok(Some(line))
    }
}

/// Prompt that replays a fixed list of answers, for scripted callers.
/// `None` entries cancel; running out of answers cancels as well.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: VecDeque<Option<String>>,
    asked: Vec<String>,
}

impl ScriptedPrompt {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = Option<S>>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(|a| a.map(Into::into)).collect(),
            asked: Vec::new(),
        }
    }

    /// Messages shown so far, in order.
    pub fn asked(&self) -> &[String] {
        &self.asked
    }

    pub fn remaining(&self) -> usize {
        self.answers.len()
    }
}

impl PasswordPrompt for ScriptedPrompt {
    fn ask(&mut self, message: &str, _hint: Option<&str>) -> Result<Option<Password>> {
        self.asked.push(message.to_string());
        Ok(self.answers.pop_front().flatten().map(Zeroizing::new))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_prompt_replays_answers_then_cancels() {
        let mut prompt = ScriptedPrompt::new([Some("one"), None]);
        let first = prompt.ask("first", None).unwrap().map(|p| p.to_string());
        assert_eq!(first.as_deref(), Some("one"));
        assert!(prompt.ask("second", Some("hint")).unwrap().is_none());
        assert!(prompt.ask("third", None).unwrap().is_none());
        assert_eq!(prompt.asked(), ["first", "second", "third"]);
        assert_eq!(prompt.remaining(), 0);
    }
}
