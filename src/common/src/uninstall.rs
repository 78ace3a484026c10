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
use crate::backend::{BackendKind, IdentityBackend, PAM_DETECTION_FILES};
use crate::constants::{NSSWITCH_CONF, PAM_DIR};
use crate::error::AuthError;
use crate::host::Host;
use crate::join::parse_realm_list;
use crate::ledger::{BackupLedger, RenderedConfig};
use crate::nsswitch::NsswitchConf;
use crate::pam::PamStack;
use crate::prompt::Prompter;
use crate::runner::CommandSpec;
use crate::state::BackendMarker;
use crate::synthesize::{deploy, DeployReport};
use serde::Serialize;

/// What removing a backend from this host involves. Building a plan only
/// reads the host.
#[derive(Debug, Clone)]
pub struct UninstallPlan {
    pub backend: BackendKind,
    pub daemon: &'static str,
    /// Realms `realm list` reports as configured.
    pub realms: Vec<String>,
    pub edits: Vec<RenderedConfig>,
    pub removals: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UninstallReport {
    pub left: Vec<String>,
    pub deployed: DeployReport,
    pub removed: Vec<String>,
    pub daemon_disabled: bool,
    pub marker_cleared: bool,
}

pub fn plan(host: &Host, backend: &dyn IdentityBackend, pam_service: &str) -> UninstallPlan {
    let realms = match host.run(&CommandSpec::new("realm").arg("list")) {
        Ok(out) if out.success() => parse_realm_list(&out.stdout)
            .into_iter()
            .filter(|r| r.is_configured())
            .map(|r| r.name)
            .collect(),
        Ok(_) | Err(_) => vec![],
    };

    let mut edits = vec![];
    if let Some(contents) = host.read(NSSWITCH_CONF) {
        let mut nss = NsswitchConf::parse(&contents);
        let mut changed = false;
        for db in backend.nss_databases() {
            changed |= nss.remove_source(db, backend.nss_token());
        }
        if changed {
            edits.push(RenderedConfig::new(NSSWITCH_CONF, nss.render(), 0o644));
        }
    }
    for file in PAM_DETECTION_FILES {
        if let Some(contents) = host.read(file) {
            let mut stack = PamStack::parse(&contents);
            if stack.remove_module(backend.pam_module()) {
                edits.push(RenderedConfig::new(file, stack.render(), 0o644));
            }
        }
    }

    let stanza = format!("{}/{}", PAM_DIR, pam_service);
    let removals = if host.is_file(&stanza) {
        vec![stanza]
    } else {
        vec![]
    };

    UninstallPlan {
        backend: backend.kind(),
        daemon: backend.identity_daemon(),
        realms,
        edits,
        removals,
    }
}

impl UninstallPlan {
    /// One line per change, for a dry run.
    pub fn describe(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .realms
            .iter()
            .map(|r| format!("leave realm {}", r))
            .collect();
        lines.extend(
            self.edits
                .iter()
                .map(|e| format!("remove {} entries from {}", self.backend, e.path)),
        );
        lines.extend(self.removals.iter().map(|r| format!("delete {}", r)));
        lines.push(format!("stop and disable {}", self.daemon));
        lines.push("clear the recorded backend".to_string());
        lines
    }

    /// Every file applying this plan may change.
    pub fn touched(&self) -> Vec<String> {
        self.edits
            .iter()
            .map(|e| e.path.clone())
            .chain(self.removals.iter().cloned())
            .collect()
    }

    pub fn apply(
        &self,
        ledger: &mut BackupLedger,
        prompter: &mut dyn Prompter,
        state_dir: &str,
    ) -> Result<UninstallReport, AuthError> {
        let host = ledger.host();
        let mut report = UninstallReport::default();

        for realm in &self.realms {
            if !prompter.confirm(&format!("Leave the {} realm?", realm))? {
                return Err(AuthError::Aborted {
                    stage: "uninstall".to_string(),
                    reason: format!("host remains joined to {}", realm),
                });
            }
            let out = host.run(&CommandSpec::new("realm").args(["leave", realm.as_str()]))?;
            if out.success() {
                report.left.push(realm.clone());
            } else {
                warn!("Unable to leave {}: {}", realm, out.combined());
            }
        }

        report.deployed = deploy(ledger, &self.edits)?;
        for path in &self.removals {
            if ledger.remove_with_backup(path)?.is_some() {
                report.removed.push(path.clone());
            }
        }

        let disable = CommandSpec::new("systemctl").args(["disable", "--now", self.daemon]);
        match host.run(&disable) {
            Ok(out) if out.success() => report.daemon_disabled = true,
            Ok(out) => warn!("Unable to disable {}: {}", self.daemon, out.combined()),
            Err(e) => warn!("{}", e),
        }

        report.marker_cleared = BackendMarker::clear(host, state_dir)?;
        info!("Removed the {} backend", self.backend);
        Ok(report)
    }
}
