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
//! The domain join state machine.
//!
//! `PREFLIGHT -> CLEANUP -> CREDENTIAL_CHECK -> JOINING -> POST_JOIN`, ending
//! in `SUCCEEDED` or `FAILED`. Pre-flight and credential failures are soft
//! gates the operator may override with a recorded justification. Only
//! idempotent probes are retried; the join itself never is.

use crate::backend::IdentityBackend;
use crate::config::VariablesFile;
use crate::constants::{
    DIAGNOSTICS_FILE, KRB5_CONF, KRB5_KEYTAB, NSSWITCH_CONF, PAM_DIR, REALMD_CACHE_DIR,
    REALMD_SERVICE, RESOLV_CONF,
};
use crate::error::{AuthError, FailureKind};
use crate::host::{Diagnostic, Host};
use crate::ledger::BackupLedger;
use crate::prompt::Prompter;
use crate::reconcile::{reconcile, JoinParameters};
use crate::runner::CommandSpec;
use crate::synthesize::{deploy, synthesize, DeployReport, SynthesisVars};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;
use zeroize::Zeroizing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JoinState {
    Preflight,
    Cleanup,
    CredentialCheck,
    Joining,
    PostJoin,
    Succeeded,
    Failed,
}

impl fmt::Display for JoinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            JoinState::Preflight => "PREFLIGHT",
            JoinState::Cleanup => "CLEANUP",
            JoinState::CredentialCheck => "CREDENTIAL_CHECK",
            JoinState::Joining => "JOINING",
            JoinState::PostJoin => "POST_JOIN",
            JoinState::Succeeded => "SUCCEEDED",
            JoinState::Failed => "FAILED",
        })
    }
}

#[derive(Debug, Clone)]
pub struct JoinOptions {
    pub max_clock_skew: f64,
    /// Attempts for each DNS lookup and service check.
    pub retries: u32,
    pub retry_delay: Duration,
    pub journal_lines: u32,
}

impl JoinOptions {
    pub fn from_vars(vars: &VariablesFile) -> Self {
        JoinOptions {
            max_clock_skew: vars.get_max_clock_skew(),
            retries: vars.get_dns_retries(),
            retry_delay: Duration::from_secs(2),
            journal_lines: vars.get_journal_lines(),
        }
    }
}

/// A soft gate the operator chose to pass, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperatorOverride {
    pub stage: JoinState,
    pub condition: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinFailure {
    pub stage: JoinState,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JoinResult {
    pub succeeded: bool,
    pub keytab_present: bool,
    /// Probe outputs in the order they were taken.
    pub diagnostics: Vec<Diagnostic>,
    pub transitions: Vec<JoinState>,
    pub overrides: Vec<OperatorOverride>,
    pub failure: Option<JoinFailure>,
    pub deployed: Option<DeployReport>,
    /// Where the ledger kept this result, if it did.
    pub retained: Option<PathBuf>,
}

impl JoinResult {
    pub fn final_state(&self) -> Option<JoinState> {
        self.transitions.last().copied()
    }
}

/// One block of `realm list` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealmRecord {
    pub name: String,
    pub realm_name: String,
    pub configured: String,
}

impl RealmRecord {
    pub fn is_configured(&self) -> bool {
        !self.configured.is_empty() && self.configured != "no"
    }

    /// Discovery metadata written without a working membership.
    pub fn is_corrupted(&self) -> bool {
        self.is_configured() && self.realm_name.is_empty()
    }
}

pub fn parse_realm_list(output: &str) -> Vec<RealmRecord> {
    let mut records: Vec<RealmRecord> = vec![];
    for line in output.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if !line.starts_with(char::is_whitespace) {
            records.push(RealmRecord {
                name: line.trim().to_string(),
                ..Default::default()
            });
            continue;
        }
        let (key, value) = match line.split_once(':') {
            Some(kv) => kv,
            None => continue,
        };
        if let Some(record) = records.last_mut() {
            match key.trim() {
                "realm-name" => record.realm_name = value.trim().to_string(),
                "configured" => record.configured = value.trim().to_string(),
                _ => {}
            }
        }
    }
    records
}

/// Offset from `chronyc tracking`'s "System time" line, in seconds.
fn parse_chrony_offset(output: &str) -> Option<f64> {
    output
        .lines()
        .find(|l| l.trim_start().starts_with("System time"))
        .and_then(|l| l.split_once(':'))
        .and_then(|(_, v)| v.split_whitespace().next())
        .and_then(|n| n.parse::<f64>().ok())
        .map(f64::abs)
}

/// What a keytab looked like at one moment. A join must leave a different
/// one behind: a leftover keytab proves nothing.
type KeytabState = (Option<SystemTime>, Zeroizing<Vec<u8>>);

fn keytab_state(path: &Path) -> Option<KeytabState> {
    let contents = fs::read(path).ok()?;
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok();
    Some((modified, Zeroizing::new(contents)))
}

type StageResult = Result<(), AuthError>;

pub struct JoinOrchestrator {
    backend: &'static dyn IdentityBackend,
    params: JoinParameters,
    synth: SynthesisVars,
    password: Zeroizing<String>,
    options: JoinOptions,
}

impl JoinOrchestrator {
    pub fn new(
        backend: &'static dyn IdentityBackend,
        params: JoinParameters,
        synth: SynthesisVars,
        password: Zeroizing<String>,
        options: JoinOptions,
    ) -> Self {
        JoinOrchestrator {
            backend,
            params,
            synth,
            password,
            options,
        }
    }

    pub fn params(&self) -> &JoinParameters {
        &self.params
    }

    /// Drives the join to a terminal state. Failures never escape as
    /// errors: they end in `FAILED` with a diagnostic bundle, which is also
    /// kept in the ledger.
    pub fn run(&mut self, ledger: &mut BackupLedger, prompter: &mut dyn Prompter) -> JoinResult {
        let host = ledger.host();
        let mut result = JoinResult::default();
        let mut stage = JoinState::Preflight;

        if let Err(e) = self.drive(host, ledger, prompter, &mut result, &mut stage) {
            error!("{} failed: {}", stage, e);
            result.failure = Some(JoinFailure {
                stage,
                kind: e.kind(),
                message: e.to_string(),
            });
            self.collect_diagnostics(host, &mut result);
            result.transitions.push(JoinState::Failed);
        } else {
            result.succeeded = true;
            result.transitions.push(JoinState::Succeeded);
            info!("Joined {} using {}", self.params.domain_lower, self.backend.kind());
        }

        if result.failure.is_some() || !result.overrides.is_empty() {
            match ledger.retain_json(DIAGNOSTICS_FILE, &result) {
                Ok(path) => result.retained = Some(path),
                Err(e) => error!("Unable to retain the join record: {}", e),
            }
        }
        result
    }

    fn enter(&self, state: JoinState, stage: &mut JoinState, result: &mut JoinResult) {
        info!("Join stage: {}", state);
        *stage = state;
        result.transitions.push(state);
    }

    fn drive(
        &mut self,
        host: &Host,
        ledger: &mut BackupLedger,
        prompter: &mut dyn Prompter,
        result: &mut JoinResult,
        stage: &mut JoinState,
    ) -> StageResult {
        self.enter(JoinState::Preflight, stage, result);
        self.preflight(host, prompter, result)?;

        self.enter(JoinState::Cleanup, stage, result);
        self.cleanup(host, prompter)?;

        self.enter(JoinState::CredentialCheck, stage, result);
        self.credential_check(host, prompter, result)?;

        self.enter(JoinState::Joining, stage, result);
        self.join(host, result)?;

        self.enter(JoinState::PostJoin, stage, result);
        self.post_join(host, ledger, result)
    }

    /// Asks the operator whether to continue past `err`. Passing requires a
    /// justification, which is logged and recorded.
    fn soft_gate(
        &self,
        err: &AuthError,
        stage: JoinState,
        prompter: &mut dyn Prompter,
        result: &mut JoinResult,
    ) -> StageResult {
        warn!("{}", err);
        if !prompter.confirm(&format!("{}. Continue anyway?", err))? {
            return Err(AuthError::Aborted {
                stage: stage.to_string(),
                reason: err.to_string(),
            });
        }
        let reason = prompter.justify("Reason for overriding this check")?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(AuthError::Aborted {
                stage: stage.to_string(),
                reason: "an override requires a justification".to_string(),
            });
        }
        warn!(%stage, %reason, "Operator override: {}", err);
        result.overrides.push(OperatorOverride {
            stage,
            condition: err.to_string(),
            reason: reason.to_string(),
            at: Utc::now(),
        });
        Ok(())
    }

    fn with_retries<F>(&self, mut attempt: F) -> bool
    where
        F: FnMut() -> bool,
    {
        for n in 1..=self.options.retries.max(1) {
            if attempt() {
                return true;
            }
            if n < self.options.retries {
                debug!("Attempt {} failed; retrying", n);
                sleep(self.options.retry_delay);
            }
        }
        false
    }

    fn clock_issue(&self, host: &Host) -> Option<String> {
        let ntp = CommandSpec::new("timedatectl").args([
            "show",
            "--property=NTPSynchronized",
            "--value",
        ]);
        match host.run(&ntp) {
            Ok(out) if out.success() && out.stdout.trim() == "yes" => {}
            Ok(out) => {
                return Some(format!(
                    "system clock is not NTP synchronized ({})",
                    out.combined()
                ))
            }
            Err(e) => return Some(e.to_string()),
        }

        let tracking = CommandSpec::new("chronyc").arg("tracking");
        match host.run(&tracking) {
            Ok(out) if out.success() => match parse_chrony_offset(&out.stdout) {
                Some(offset) if offset > self.options.max_clock_skew => Some(format!(
                    "clock offset {:.3}s exceeds the {:.0}s tolerance",
                    offset, self.options.max_clock_skew
                )),
                Some(offset) => {
                    debug!("Clock offset {:.6}s", offset);
                    None
                }
                None => {
                    debug!("chronyc reported no offset");
                    None
                }
            },
            Ok(_) | Err(_) => {
                debug!("chronyc unavailable; relying on timedatectl");
                None
            }
        }
    }

    fn srv_spec(&self, service: &str) -> CommandSpec {
        CommandSpec::new("host").args([
            "-t".to_string(),
            "SRV".to_string(),
            format!("{}.{}", service, self.params.domain_lower),
        ])
    }

    fn srv_discoverable(&self, host: &Host, service: &str) -> bool {
        let spec = self.srv_spec(service);
        self.with_retries(|| match host.run(&spec) {
            Ok(out) => out.success() && out.stdout.contains("has SRV record"),
            Err(e) => {
                debug!("{}", e);
                false
            }
        })
    }

    fn preflight(
        &self,
        host: &Host,
        prompter: &mut dyn Prompter,
        result: &mut JoinResult,
    ) -> StageResult {
        let mut issues = vec![];
        if let Some(issue) = self.clock_issue(host) {
            issues.push(issue);
        }
        for service in ["_ldap._tcp", "_kerberos._tcp"] {
            if !self.srv_discoverable(host, service) {
                issues.push(format!(
                    "no {} SRV records for {}",
                    service, self.params.domain_lower
                ));
            }
        }
        if issues.is_empty() {
            return Ok(());
        }

        result.diagnostics.push(host.file_diagnostic(RESOLV_CONF));
        for service in ["_ldap._tcp", "_kerberos._tcp"] {
            result.diagnostics.push(host.probe(&self.srv_spec(service)));
        }
        self.soft_gate(
            &AuthError::PreflightSoft(issues.join("; ")),
            JoinState::Preflight,
            prompter,
            result,
        )
    }

    fn realm_list(&self, host: &Host) -> Vec<RealmRecord> {
        match host.run(&CommandSpec::new("realm").arg("list")) {
            Ok(out) if out.success() => parse_realm_list(&out.stdout),
            Ok(out) => {
                debug!("realm list: {}", out.combined());
                vec![]
            }
            Err(e) => {
                warn!("{}", e);
                vec![]
            }
        }
    }

    fn clear_realmd_cache(&self, host: &Host) -> StageResult {
        let cache = host.path(REALMD_CACHE_DIR);
        let entries = match fs::read_dir(&cache) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries {
            let path = entry
                .map_err(|e| AuthError::JoinFailed(format!("unable to read realmd cache: {}", e)))?
                .path();
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            removed.map_err(|e| {
                AuthError::JoinFailed(format!("unable to remove {}: {}", path.display(), e))
            })?;
        }
        info!("Cleared realmd cache {}", cache.display());
        Ok(())
    }

    /// Safe with no prior join: an empty realm list is nothing to clean.
    fn cleanup(&self, host: &Host, prompter: &mut dyn Prompter) -> StageResult {
        let mut records = self.realm_list(host);
        if records.iter().any(RealmRecord::is_corrupted) {
            warn!("Found a configured realm with no realm name; resetting realmd");
            self.clear_realmd_cache(host)?;
            let restart = CommandSpec::new("systemctl").args(["restart", REALMD_SERVICE]);
            let out = host.run(&restart)?;
            if !out.success() {
                return Err(AuthError::JoinFailed(format!(
                    "unable to restart {}: {}",
                    REALMD_SERVICE,
                    out.combined()
                )));
            }
            let clean = self.with_retries(|| {
                records = self.realm_list(host);
                !records.iter().any(RealmRecord::is_corrupted)
            });
            if !clean {
                return Err(AuthError::JoinFailed(
                    "realm record is still corrupted after resetting realmd".to_string(),
                ));
            }
        }

        for record in records.iter().filter(|r| r.is_configured()) {
            if !prompter.confirm(&format!(
                "This host is already joined to {}. Leave it and join again?",
                record.name
            ))? {
                return Err(AuthError::Aborted {
                    stage: JoinState::Cleanup.to_string(),
                    reason: format!("host remains joined to {}", record.name),
                });
            }
            let out = host.run(&CommandSpec::new("realm").args(["leave", record.name.as_str()]))?;
            if out.success() {
                info!("Left realm {}", record.name);
            } else {
                warn!("Unable to leave {}: {}", record.name, out.combined());
            }
        }
        Ok(())
    }

    fn credential_check(
        &self,
        host: &Host,
        prompter: &mut dyn Prompter,
        result: &mut JoinResult,
    ) -> StageResult {
        let principal = self.params.principal();
        let ccache_dir = TempDir::new().map_err(|e| AuthError::Command {
            program: "kinit".to_string(),
            source: e,
        })?;
        let ccache = format!("FILE:{}", ccache_dir.path().join("ccache").display());

        let kinit = CommandSpec::new("kinit")
            .arg(principal.as_str())
            .env("KRB5CCNAME", ccache.as_str())
            .stdin_secret(&self.password);
        let out = match host.run(&kinit) {
            Ok(out) => out,
            Err(e) => {
                result
                    .diagnostics
                    .push(Diagnostic::new(kinit.command_line(), format!("(failed to run: {})", e)));
                return self.soft_gate(
                    &AuthError::CredentialInvalid {
                        principal,
                        reason: e.to_string(),
                    },
                    JoinState::CredentialCheck,
                    prompter,
                    result,
                );
            }
        };
        if out.success() {
            info!("Credentials for {} accepted", principal);
            let kdestroy = CommandSpec::new("kdestroy").env("KRB5CCNAME", ccache.as_str());
            if let Err(e) = host.run(&kdestroy) {
                debug!("{}", e);
            }
            return Ok(());
        }

        result.diagnostics.push(Diagnostic::from_output("kinit", &out));
        self.soft_gate(
            &AuthError::CredentialInvalid {
                principal,
                reason: out.combined(),
            },
            JoinState::CredentialCheck,
            prompter,
            result,
        )
    }

    fn join(&self, host: &Host, result: &mut JoinResult) -> StageResult {
        let mut spec = CommandSpec::new("realm").args([
            "join".to_string(),
            "--verbose".to_string(),
            format!("--user={}", self.params.admin_user()),
            format!("--membership-software={}", self.params.membership_software),
            format!("--client-software={}", self.params.client_software),
            format!("--os-name={}", self.params.os_name),
        ]);
        if let Some(ou) = &self.params.computer_ou {
            spec = spec.arg(format!("--computer-ou={}", ou));
        }
        let spec = spec
            .arg(self.params.domain_lower.as_str())
            .stdin_secret(&self.password);

        let keytab = host.path(KRB5_KEYTAB);
        let before = keytab_state(&keytab);
        if before.is_some() {
            debug!("{} exists before the join", KRB5_KEYTAB);
        }
        let out = host.run(&spec)?;
        let after = keytab_state(&keytab);
        result.keytab_present = after.is_some() && after != before;
        match (out.success(), result.keytab_present) {
            (true, true) => Ok(()),
            (true, false) => Err(AuthError::JoinFailed(format!(
                "join reported success but {} was not {}",
                KRB5_KEYTAB,
                if after.is_some() { "updated" } else { "created" }
            ))),
            (false, _) => {
                result.diagnostics.push(Diagnostic::from_output("realm join", &out));
                Err(AuthError::JoinFailed(out.combined()))
            }
        }
    }

    fn post_join(
        &mut self,
        host: &Host,
        ledger: &mut BackupLedger,
        result: &mut JoinResult,
    ) -> StageResult {
        let harvested = reconcile(host, self.backend.kind());
        self.synth.adopt_join_values(&harvested);
        let configs = synthesize(self.backend, host, &self.synth)?;
        let report = deploy(ledger, &configs)?;
        let activated = self.activate(host);
        if activated.is_err() {
            for failure in report.rollback(ledger) {
                error!("{}", failure);
            }
        }
        result.deployed = Some(report);
        activated
    }

    /// Makes the identity daemon pick up freshly deployed configuration.
    fn activate(&self, host: &Host) -> StageResult {
        let flush = self.backend.cache_flush();
        match host.run(&flush) {
            Ok(out) if out.success() => debug!("Flushed identity caches"),
            Ok(out) => warn!("{} failed: {}", flush.command_line(), out.combined()),
            Err(e) => warn!("{}", e),
        }

        let daemon = self.backend.identity_daemon();
        let out = host.run(&CommandSpec::new("systemctl").args(["restart", daemon]))?;
        if !out.success() {
            return Err(AuthError::JoinFailed(format!(
                "unable to restart {}: {}",
                daemon,
                out.combined()
            )));
        }
        if !self.with_retries(|| host.service_active(daemon)) {
            return Err(AuthError::JoinFailed(format!(
                "{} is not active after restart",
                daemon
            )));
        }
        Ok(())
    }

    /// Service status, recent journal, LDAP and DNS reachability, resolver
    /// configuration and the current config files.
    fn collect_diagnostics(&self, host: &Host, result: &mut JoinResult) {
        let daemon = self.backend.identity_daemon();
        let domain = &self.params.domain_lower;
        let probes = [
            CommandSpec::new("systemctl").args(["status", "--no-pager", daemon]),
            CommandSpec::new("journalctl").args([
                "-u".to_string(),
                daemon.to_string(),
                "-n".to_string(),
                self.options.journal_lines.to_string(),
                "--no-pager".to_string(),
            ]),
            CommandSpec::new("ldapsearch").args([
                "-x".to_string(),
                "-LLL".to_string(),
                "-H".to_string(),
                format!("ldap://{}", domain),
                "-s".to_string(),
                "base".to_string(),
                "-b".to_string(),
                String::new(),
                "defaultNamingContext".to_string(),
            ]),
            self.srv_spec("_ldap._tcp"),
            self.srv_spec("_kerberos._tcp"),
            CommandSpec::new("realm").arg("list"),
        ];
        for probe in &probes {
            result.diagnostics.push(host.probe(probe));
        }
        let service_stanza = format!("{}/{}", PAM_DIR, self.synth.pam_service);
        for file in [
            RESOLV_CONF,
            self.backend.config_file(),
            KRB5_CONF,
            NSSWITCH_CONF,
            service_stanza.as_str(),
        ] {
            result.diagnostics.push(host.file_diagnostic(file));
        }
    }
}
