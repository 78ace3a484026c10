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
use std::fmt;
use std::io::{self, Write};
use std::process::{Command, Stdio};
use zeroize::Zeroizing;

/// A single external command invocation. Secrets are only ever supplied on
/// stdin, never as arguments, so they stay out of the process table.
#[derive(Clone)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<Zeroizing<String>>,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        CommandSpec {
            program: program.to_string(),
            args: vec![],
            env: vec![],
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }

    pub fn stdin_secret(mut self, secret: &Zeroizing<String>) -> Self {
        self.stdin = Some(secret.clone());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn has_stdin(&self) -> bool {
        self.stdin.is_some()
    }

    pub(crate) fn stdin(&self) -> Option<&Zeroizing<String>> {
        self.stdin.as_ref()
    }

    /// The program and its arguments as an operator would type them.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("env", &self.env)
            .field("stdin", &self.stdin.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn new(status: i32, stdout: &str, stderr: &str) -> Self {
        CommandOutput {
            status: Some(status),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn combined(&self) -> String {
        match (self.stdout.trim(), self.stderr.trim()) {
            ("", "") => String::new(),
            (out, "") => out.to_string(),
            ("", err) => err.to_string(),
            (out, err) => format!("{}\n{}", out, err),
        }
    }

    pub fn status_text(&self) -> String {
        match self.status {
            Some(code) => format!("exit status {}", code),
            None => "terminated by signal".to_string(),
        }
    }
}

/// Capability for running privileged host tools. The orchestration logic only
/// ever reaches the host through this trait.
pub trait CommandRunner {
    fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput>;
}

/// Runs commands on the local host and blocks until they exit.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
        debug!("Executing: {}", spec.command_line());
        let mut cmd = Command::new(spec.program());
        cmd.args(spec.get_args())
            .envs(spec.get_env().iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if spec.has_stdin() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        let mut child = cmd.spawn()?;
        if let Some(secret) = spec.stdin() {
            if let Some(mut pipe) = child.stdin.take() {
                let written = pipe
                    .write_all(secret.as_bytes())
                    .and_then(|_| pipe.write_all(b"\n"));
                match written {
                    Ok(()) => {}
                    // The child exited without reading; its output still matters.
                    Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                        debug!("{} closed stdin early", spec.program());
                    }
                    Err(e) => {
                        drop(pipe);
                        let _ = child.wait();
                        return Err(e);
                    }
                }
                // Dropping the pipe delivers EOF.
            }
        }
        let output = child.wait_with_output()?;
        let out = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        };
        if out.success() {
            debug!("Command succeeded: {}", spec.command_line());
        } else {
            debug!(
                "Command failed ({}): {}",
                out.status_text(),
                spec.command_line()
            );
        }
        Ok(out)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::cell::RefCell;
    use std::path::PathBuf;

    struct Stub {
        prefix: String,
        outputs: Vec<CommandOutput>,
        creates: Vec<(PathBuf, String)>,
        absent: bool,
    }

    /// Canned-response runner. Responses are matched on the longest
    /// registered command-line prefix; queued responses are consumed in order
    /// and the last one repeats. Unmatched commands exit 1.
    pub(crate) struct FakeRunner {
        stubs: RefCell<Vec<Stub>>,
        calls: RefCell<Vec<CommandSpec>>,
    }

    impl FakeRunner {
        pub(crate) fn new() -> Self {
            FakeRunner {
                stubs: RefCell::new(vec![]),
                calls: RefCell::new(vec![]),
            }
        }

        fn stub_mut<R>(&self, prefix: &str, f: impl FnOnce(&mut Stub) -> R) -> R {
            let mut stubs = self.stubs.borrow_mut();
            let idx = match stubs.iter().position(|s| s.prefix == prefix) {
                Some(idx) => idx,
                None => {
                    stubs.push(Stub {
                        prefix: prefix.to_string(),
                        outputs: vec![],
                        creates: vec![],
                        absent: false,
                    });
                    stubs.len() - 1
                }
            };
            f(&mut stubs[idx])
        }

        pub(crate) fn on(&self, prefix: &str, status: i32, stdout: &str) -> &Self {
            self.stub_mut(prefix, |s| {
                s.outputs.push(CommandOutput::new(status, stdout, ""))
            });
            self
        }

        pub(crate) fn on_err(&self, prefix: &str, status: i32, stderr: &str) -> &Self {
            self.stub_mut(prefix, |s| {
                s.outputs.push(CommandOutput::new(status, "", stderr))
            });
            self
        }

        /// Write `contents` to `path` whenever `prefix` runs.
        pub(crate) fn creates(&self, prefix: &str, path: PathBuf, contents: &str) -> &Self {
            self.stub_mut(prefix, |s| s.creates.push((path, contents.to_string())));
            self
        }

        /// Make `prefix` fail to spawn, as if the program were not installed.
        pub(crate) fn missing(&self, prefix: &str) -> &Self {
            self.stub_mut(prefix, |s| s.absent = true);
            self
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.borrow().iter().map(|c| c.command_line()).collect()
        }

        pub(crate) fn invoked(&self, prefix: &str) -> bool {
            self.calls
                .borrow()
                .iter()
                .any(|c| c.command_line().starts_with(prefix))
        }

        pub(crate) fn find(&self, prefix: &str) -> Option<CommandSpec> {
            self.calls
                .borrow()
                .iter()
                .find(|c| c.command_line().starts_with(prefix))
                .cloned()
        }
    }

    impl CommandRunner for FakeRunner {
        fn run(&self, spec: &CommandSpec) -> io::Result<CommandOutput> {
            self.calls.borrow_mut().push(spec.clone());
            let line = spec.command_line();
            let mut stubs = self.stubs.borrow_mut();
            let best = stubs
                .iter_mut()
                .filter(|s| line.starts_with(&s.prefix))
                .max_by_key(|s| s.prefix.len());
            match best {
                Some(stub) if stub.absent => Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{}: command not found", spec.program()),
                )),
                Some(stub) => {
                    for (path, contents) in &stub.creates {
                        if let Some(parent) = path.parent() {
                            std::fs::create_dir_all(parent)?;
                        }
                        std::fs::write(path, contents)?;
                    }
                    let out = if stub.outputs.len() > 1 {
                        stub.outputs.remove(0)
                    } else {
                        stub.outputs
                            .first()
                            .cloned()
                            .unwrap_or_else(|| CommandOutput::new(0, "", ""))
                    };
                    Ok(out)
                }
                None => Ok(CommandOutput::new(1, "", "not stubbed")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeRunner;
    use super::*;

    #[test]
    fn test_debug_redacts_stdin() {
        let secret = Zeroizing::new("hunter2".to_string());
        let spec = CommandSpec::new("kinit")
            .arg("admin@EXAMPLE.COM")
            .stdin_secret(&secret);
        let debug = format!("{:?}", spec);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("<redacted>"));
        assert_eq!(spec.command_line(), "kinit admin@EXAMPLE.COM");
    }

    #[test]
    fn test_fake_runner_prefers_longest_prefix() {
        let runner = FakeRunner::new();
        runner.on("systemctl", 3, "");
        runner.on("systemctl is-active --quiet sssd", 0, "");
        let out = runner
            .run(&CommandSpec::new("systemctl").args(["is-active", "--quiet", "sssd"]))
            .unwrap();
        assert!(out.success());
        let out = runner
            .run(&CommandSpec::new("systemctl").args(["is-active", "--quiet", "smbd"]))
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(runner.calls().len(), 2);
    }

    #[test]
    fn test_fake_runner_queue() {
        let runner = FakeRunner::new();
        runner.on("realm list", 0, "first").on("realm list", 0, "second");
        let spec = CommandSpec::new("realm").arg("list");
        assert_eq!(runner.run(&spec).unwrap().stdout, "first");
        assert_eq!(runner.run(&spec).unwrap().stdout, "second");
        assert_eq!(runner.run(&spec).unwrap().stdout, "second");
    }

    #[test]
    fn test_system_runner_feeds_stdin() {
        let secret = Zeroizing::new("s3cret".to_string());
        let out = SystemRunner
            .run(&CommandSpec::new("cat").stdin_secret(&secret))
            .unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "s3cret");
    }

    #[test]
    fn test_system_runner_keeps_output_when_stdin_is_ignored() {
        // Larger than a pipe buffer, so the write outlives the child.
        let secret = Zeroizing::new("x".repeat(1 << 20));
        let out = SystemRunner
            .run(
                &CommandSpec::new("sh")
                    .args(["-c", "echo 'realm not discovered' >&2; exit 3"])
                    .stdin_secret(&secret),
            )
            .unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stderr.trim(), "realm not discovered");
    }

    #[test]
    fn test_fake_runner_missing_program() {
        let runner = FakeRunner::new();
        runner.missing("kinit");
        let err = runner
            .run(&CommandSpec::new("kinit").arg("admin@EXAMPLE.COM"))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(runner.invoked("kinit"));
    }
}
