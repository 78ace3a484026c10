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
use crate::runner::{CommandOutput, CommandRunner, CommandSpec};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

/// One probe of host state captured for the operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub probe: String,
    pub output: String,
}

impl Diagnostic {
    pub fn new(probe: impl Into<String>, output: impl Into<String>) -> Self {
        Diagnostic {
            probe: probe.into(),
            output: output.into(),
        }
    }

    pub fn from_output(probe: impl Into<String>, out: &CommandOutput) -> Self {
        let body = out.combined();
        Diagnostic::new(
            probe,
            if body.is_empty() {
                format!("({})", out.status_text())
            } else {
                format!("({})\n{}", out.status_text(), body)
            },
        )
    }
}

/// The target host: a filesystem root plus the means to run tools on it.
/// Every absolute system path is resolved beneath `root`, which is `/` in
/// production and a staged tree in tests.
pub struct Host<'a> {
    root: PathBuf,
    runner: &'a dyn CommandRunner,
}

impl<'a> Host<'a> {
    pub fn new(root: impl Into<PathBuf>, runner: &'a dyn CommandRunner) -> Self {
        Host {
            root: root.into(),
            runner,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Reads a system file. A missing or unreadable file is "no data".
    pub fn read(&self, path: impl AsRef<Path>) -> Option<String> {
        let full = self.path(path);
        match fs::read_to_string(&full) {
            Ok(contents) => Some(contents),
            Err(e) => {
                trace!("Unable to read {}: {}", full.display(), e);
                None
            }
        }
    }

    pub fn is_file(&self, path: impl AsRef<Path>) -> bool {
        self.path(path).is_file()
    }

    pub fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, AuthError> {
        self.runner.run(spec).map_err(|e| AuthError::Command {
            program: spec.program().to_string(),
            source: e,
        })
    }

    /// Runs a read-only probe for diagnostics. Never fails: a probe that
    /// cannot run is itself a finding.
    pub fn probe(&self, spec: &CommandSpec) -> Diagnostic {
        match self.runner.run(spec) {
            Ok(out) => Diagnostic::from_output(spec.command_line(), &out),
            Err(e) => Diagnostic::new(spec.command_line(), format!("(failed to run: {})", e)),
        }
    }

    pub fn file_diagnostic(&self, path: &str) -> Diagnostic {
        Diagnostic::new(
            path,
            self.read(path)
                .unwrap_or_else(|| "(missing or unreadable)".to_string()),
        )
    }

    pub fn service_active(&self, name: &str) -> bool {
        let spec = CommandSpec::new("systemctl").args(["is-active", "--quiet", name]);
        match self.runner.run(&spec) {
            Ok(out) => out.success(),
            Err(e) => {
                debug!("Unable to query service {}: {}", name, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::fake::FakeRunner;
    use tempfile::TempDir;

    #[test]
    fn test_paths_resolve_under_root() {
        let runner = FakeRunner::new();
        let host = Host::new("/srv/stage", &runner);
        assert_eq!(
            host.path("/etc/krb5.conf"),
            PathBuf::from("/srv/stage/etc/krb5.conf")
        );
        assert_eq!(
            host.path("etc/krb5.conf"),
            PathBuf::from("/srv/stage/etc/krb5.conf")
        );
    }

    #[test]
    fn test_missing_file_is_no_data() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let host = Host::new(dir.path(), &runner);
        assert_eq!(host.read("/etc/sssd/sssd.conf"), None);
        assert!(!host.is_file("/etc/sssd/sssd.conf"));
        assert_eq!(
            host.file_diagnostic("/etc/sssd/sssd.conf").output,
            "(missing or unreadable)"
        );
    }

    #[test]
    fn test_service_active() {
        let runner = FakeRunner::new();
        runner.on("systemctl is-active --quiet winbind", 0, "");
        let host = Host::new("/", &runner);
        assert!(host.service_active("winbind"));
        assert!(!host.service_active("sssd"));
    }
}
