/*
   R Environment Manager identity orchestration
   Copyright (C) R Environment Manager developers 2026

   This program is free software; you can redistribute it and/or modify
   it under the terms of the GNU General Public License as published by
   the Free Software Foundation; either version 3 of the License, or
   (at your option) any later version.

   This program is distributed in the hope that it will be useful,
   but WITHOUT ANY WARRANTY; without even the implied warranty of
   MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
   GNU General Public License for more details.

   You should have received a copy of the GNU General Public License
   along with this program.  If not, see <http://www.gnu.org/licenses/>.
*/
use crate::error::AuthError;
use rpassword::prompt_password;
use std::io::{self, BufRead, Write};
use zeroize::Zeroizing;

/// Operator interaction. Every soft gate and every missing parameter goes
/// through this trait so that automation and tests can answer instead of a
/// terminal.
pub trait Prompter {
    /// A yes/no question. Anything but an explicit yes is a no.
    fn confirm(&mut self, question: &str) -> Result<bool, AuthError>;
    /// Why the operator is overriding a failed check. Never empty.
    fn justify(&mut self, question: &str) -> Result<String, AuthError>;
    fn ask(&mut self, label: &str, default: Option<&str>) -> Result<String, AuthError>;
    fn password(&mut self, label: &str) -> Result<Zeroizing<String>, AuthError>;
}

fn input_error(e: &io::Error) -> AuthError {
    AuthError::Aborted {
        stage: "operator input".to_string(),
        reason: e.to_string(),
    }
}

#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl TerminalPrompter {
    fn read_line(&self, prompt: &str) -> Result<String, AuthError> {
        let mut stdout = io::stdout();
        write!(stdout, "{}", prompt).map_err(|e| input_error(&e))?;
        stdout.flush().map_err(|e| input_error(&e))?;
        let mut line = String::new();
        let n = io::stdin()
            .lock()
            .read_line(&mut line)
            .map_err(|e| input_error(&e))?;
        if n == 0 {
            return Err(input_error(&io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "end of input",
            )));
        }
        Ok(line.trim().to_string())
    }
}

impl Prompter for TerminalPrompter {
    fn confirm(&mut self, question: &str) -> Result<bool, AuthError> {
        let answer = self.read_line(&format!("{} [y/N]: ", question))?;
        Ok(matches!(answer.to_lowercase().as_str(), "y" | "yes"))
    }

    fn justify(&mut self, question: &str) -> Result<String, AuthError> {
        loop {
            let reason = self.read_line(&format!("{}: ", question))?;
            if !reason.is_empty() {
                return Ok(reason);
            }
            eprintln!("A reason is required to continue.");
        }
    }

    fn ask(&mut self, label: &str, default: Option<&str>) -> Result<String, AuthError> {
        loop {
            let answer = match default {
                Some(d) => self.read_line(&format!("{} [{}]: ", label, d))?,
                None => self.read_line(&format!("{}: ", label))?,
            };
            match (answer.is_empty(), default) {
                (false, _) => return Ok(answer),
                (true, Some(d)) => return Ok(d.to_string()),
                (true, None) => eprintln!("{} may not be empty.", label),
            }
        }
    }

    fn password(&mut self, label: &str) -> Result<Zeroizing<String>, AuthError> {
        prompt_password(format!("{}: ", label))
            .map(Zeroizing::new)
            .map_err(|e| input_error(&e))
    }
}

/// Answers for unattended runs. Soft gates pass only with the reason the
/// operator supplied up front; fields that were not configured cannot be
/// asked for.
pub struct AutomatedPrompter {
    reason: Option<String>,
    password: Option<Zeroizing<String>>,
}

impl AutomatedPrompter {
    pub fn new(reason: Option<String>, password: Option<Zeroizing<String>>) -> Self {
        AutomatedPrompter {
            reason: reason.filter(|r| !r.trim().is_empty()),
            password,
        }
    }
}

impl Prompter for AutomatedPrompter {
    fn confirm(&mut self, question: &str) -> Result<bool, AuthError> {
        let yes = self.reason.is_some();
        info!("{} -> {}", question, if yes { "yes" } else { "no" });
        Ok(yes)
    }

    fn justify(&mut self, question: &str) -> Result<String, AuthError> {
        self.reason.clone().ok_or_else(|| AuthError::Aborted {
            stage: question.to_string(),
            reason: "no override reason was supplied".to_string(),
        })
    }

    fn ask(&mut self, label: &str, default: Option<&str>) -> Result<String, AuthError> {
        match default {
            Some(d) => Ok(d.to_string()),
            None => Err(AuthError::Aborted {
                stage: label.to_string(),
                reason: "value is not configured and the run is non-interactive".to_string(),
            }),
        }
    }

    fn password(&mut self, label: &str) -> Result<Zeroizing<String>, AuthError> {
        self.password.clone().ok_or_else(|| AuthError::Aborted {
            stage: label.to_string(),
            reason: "no password was supplied on stdin".to_string(),
        })
    }
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;

    /// Replays queued answers and records every question asked.
    #[derive(Default)]
    pub(crate) struct ScriptedPrompter {
        pub(crate) confirms: VecDeque<bool>,
        pub(crate) reasons: VecDeque<String>,
        pub(crate) answers: VecDeque<String>,
        pub(crate) passwords: VecDeque<String>,
        pub(crate) asked: Vec<String>,
    }

    impl ScriptedPrompter {
        pub(crate) fn new() -> Self {
            ScriptedPrompter::default()
        }

        pub(crate) fn confirm_with(mut self, answer: bool) -> Self {
            self.confirms.push_back(answer);
            self
        }

        pub(crate) fn reason(mut self, reason: &str) -> Self {
            self.reasons.push_back(reason.to_string());
            self
        }

        pub(crate) fn answer(mut self, answer: &str) -> Self {
            self.answers.push_back(answer.to_string());
            self
        }

        fn exhausted(&self, what: &str) -> AuthError {
            AuthError::Aborted {
                stage: what.to_string(),
                reason: "script exhausted".to_string(),
            }
        }
    }

    impl Prompter for ScriptedPrompter {
        fn confirm(&mut self, question: &str) -> Result<bool, AuthError> {
            self.asked.push(question.to_string());
            self.confirms
                .pop_front()
                .ok_or_else(|| self.exhausted(question))
        }

        fn justify(&mut self, question: &str) -> Result<String, AuthError> {
            self.asked.push(question.to_string());
            self.reasons
                .pop_front()
                .ok_or_else(|| self.exhausted(question))
        }

        fn ask(&mut self, label: &str, default: Option<&str>) -> Result<String, AuthError> {
            self.asked.push(label.to_string());
            match self.answers.pop_front() {
                Some(a) if a.is_empty() => default
                    .map(str::to_string)
                    .ok_or_else(|| self.exhausted(label)),
                Some(a) => Ok(a),
                None => Err(self.exhausted(label)),
            }
        }

        fn password(&mut self, label: &str) -> Result<Zeroizing<String>, AuthError> {
            self.asked.push(label.to_string());
            self.passwords
                .pop_front()
                .map(Zeroizing::new)
                .ok_or_else(|| self.exhausted(label))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_automated_requires_reason() {
        let mut p = AutomatedPrompter::new(Some("  ".to_string()), None);
        assert!(!p.confirm("Continue?").unwrap());
        assert!(p.justify("Why").is_err());
        assert!(p.password("Password").is_err());

        let mut p = AutomatedPrompter::new(
            Some("DC clock drift tracked in CHG-1042".to_string()),
            Some(Zeroizing::new("pw".to_string())),
        );
        assert!(p.confirm("Continue?").unwrap());
        assert_eq!(p.justify("Why").unwrap(), "DC clock drift tracked in CHG-1042");
        assert_eq!(p.password("Password").unwrap().as_str(), "pw");
    }

    #[test]
    fn test_automated_uses_defaults_only() {
        let mut p = AutomatedPrompter::new(None, None);
        assert_eq!(p.ask("Domain", Some("example.com")).unwrap(), "example.com");
        let err = p.ask("Admin user", None).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::Aborted);
    }
}
