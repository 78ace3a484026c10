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
#![deny(warnings)]
#![warn(unused_extern_crates)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unreachable)]
#![deny(clippy::needless_pass_by_value)]
#![deny(clippy::trivially_copy_pass_by_ref)]

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use renv_auth_common::backend::{select_backend, IdentityBackend};
use renv_auth_common::config::VariablesFile;
use renv_auth_common::constants::{DEFAULT_BACKUP_RETENTION, DEFAULT_VARS_PATH, SNAPSHOT_TARGETS};
use renv_auth_common::detect::{detect, detect_report};
use renv_auth_common::host::Host;
use renv_auth_common::join::{JoinOptions, JoinOrchestrator, JoinResult};
use renv_auth_common::ledger::{latest_record, list_records, prune_sessions, BackupLedger};
use renv_auth_common::prompt::{AutomatedPrompter, Prompter, TerminalPrompter};
use renv_auth_common::reconcile::{reconcile, PartialJoinParameters};
use renv_auth_common::runner::SystemRunner;
use renv_auth_common::state::BackendMarker;
use renv_auth_common::synthesize::{deploy, synthesize, SynthesisVars};
use renv_auth_common::uninstall;
use renv_auth_common::{AuthError, BackendKind, FailureKind};
use std::io::{self, BufRead};
use std::path::Path;
use std::process::ExitCode;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

include!("./opt/tool.rs");

const EXIT_FAILED: u8 = 1;
const EXIT_CONFIG_MISSING: u8 = 2;
const EXIT_ABORTED: u8 = 3;
const EXIT_INCOMPLETE: u8 = 4;

fn exit_code(kind: FailureKind) -> ExitCode {
    ExitCode::from(match kind {
        FailureKind::ConfigMissing => EXIT_CONFIG_MISSING,
        FailureKind::Aborted => EXIT_ABORTED,
        FailureKind::ReconciliationIncomplete => EXIT_INCOMPLETE,
        _ => EXIT_FAILED,
    })
}

/// An explicit `--vars` must exist. Without one the default file is used
/// when present, and otherwise every value comes from detection or the
/// operator.
fn load_vars(path: Option<&Path>) -> Result<VariablesFile, AuthError> {
    match path {
        Some(path) => VariablesFile::load(path),
        None if Path::new(DEFAULT_VARS_PATH).is_file() => {
            VariablesFile::load(Path::new(DEFAULT_VARS_PATH))
        }
        None => {
            debug!("No variables file; relying on detection and prompts");
            Ok(VariablesFile::empty())
        }
    }
}

fn require_root(root: &Path) -> Result<()> {
    if root == Path::new("/") && unsafe { libc::geteuid() } != 0 {
        return Err(anyhow!("This command must be run as root."));
    }
    Ok(())
}

fn read_stdin_password() -> Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read the password from stdin")?;
    let password = Zeroizing::new(line.trim_end_matches(['\r', '\n']).to_string());
    if password.is_empty() {
        return Err(anyhow!("No password was supplied on stdin"));
    }
    Ok(password)
}

fn prompter_for(
    unattended: &NonInteractiveOpt,
    password: Option<Zeroizing<String>>,
) -> Result<Box<dyn Prompter>> {
    if !unattended.assume_yes {
        return Ok(Box::new(TerminalPrompter));
    }
    match &unattended.override_reason {
        Some(reason) if !reason.trim().is_empty() => Ok(Box::new(AutomatedPrompter::new(
            Some(reason.clone()),
            password,
        ))),
        _ => Err(anyhow!("--override-reason may not be empty")),
    }
}

/// Settles the backend for this run: `--backend`, then `AUTH_BACKEND`, then
/// detection when enabled, then the marker from a previous run.
fn settle_backend(
    host: &Host,
    opt: &BackendOpt,
    vars: &VariablesFile,
) -> Result<Option<BackendKind>> {
    let explicit = match &opt.backend {
        Some(name) => Some(name.parse::<BackendKind>().map_err(|e| anyhow!(e))?),
        None => vars.get_backend(),
    };
    let detected = if opt.auto_detect {
        Some(detect(host))
    } else {
        None
    };
    let marker = BackendMarker::read(host, &vars.get_state_dir()).map(|m| m.backend);
    Ok(select_backend(explicit, detected, marker))
}

fn backend_for(kind: Option<BackendKind>) -> Result<&'static dyn IdentityBackend> {
    match kind.and_then(BackendKind::backend) {
        Some(backend) => {
            info!("Using the {} identity backend", backend.kind());
            Ok(backend)
        }
        None => Err(AuthError::ReconciliationIncomplete {
            fields: vec!["AUTH_BACKEND"],
        }
        .into()),
    }
}

fn print_bundle(result: &JoinResult) {
    if let Some(failure) = &result.failure {
        eprintln!("Join failed during {}: {}", failure.stage, failure.message);
    }
    for diag in &result.diagnostics {
        eprintln!("==== {} ====", diag.probe);
        eprintln!("{}", diag.output);
    }
    if let Some(path) = &result.retained {
        eprintln!("Diagnostics retained in {}", path.display());
    }
}

/// Keeps a fatal error in the ledger session and says where.
fn retain_failure(
    ledger: &BackupLedger,
    operation: &str,
    err: AuthError,
    files: &[String],
) -> anyhow::Error {
    match ledger.retain_failure(operation, &err, files) {
        Ok(path) => eprintln!("Failure record retained in {}", path.display()),
        Err(e) => error!("Unable to retain the failure record: {}", e),
    }
    err.into()
}

fn run_detect(common: &CommonOpt, json: bool) -> Result<ExitCode> {
    let runner = SystemRunner;
    let host = Host::new(&common.root, &runner);
    let report = detect_report(&host);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report.backend);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_join(
    common: &CommonOpt,
    backend: &BackendOpt,
    unattended: &NonInteractiveOpt,
    password_stdin: bool,
) -> Result<ExitCode> {
    require_root(&common.root)?;
    let vars = load_vars(common.vars.as_deref())?;
    let stdin_password = if password_stdin {
        Some(read_stdin_password()?)
    } else {
        None
    };
    let mut prompter = prompter_for(unattended, stdin_password)?;
    let runner = SystemRunner;
    let host = Host::new(&common.root, &runner);

    let interactive = !unattended.assume_yes;
    let kind = match settle_backend(&host, backend, &vars)? {
        Some(kind) => Some(kind),
        None if interactive => Some(
            prompter
                .ask("Identity backend (sssd or samba)", Some("sssd"))?
                .parse::<BackendKind>()
                .map_err(|e| anyhow!(e))?,
        ),
        None => None,
    };
    let backend = backend_for(kind)?;

    let harvested = reconcile(&host, backend.kind());
    let mut partial = PartialJoinParameters::from_operator(&vars);
    partial.merge_harvested(&harvested);
    if interactive {
        partial.prompt_missing(prompter.as_mut())?;
    }
    let params = partial.finish(&host, backend)?;
    let synth = SynthesisVars::assemble(
        backend,
        &params.domain_lower,
        &params.domain_upper,
        &harvested,
        &vars,
    )?;
    let password = prompter.password(&format!("Password for {}", params.principal()))?;

    let mut ledger = BackupLedger::open_session(&host, &vars.get_backup_dir())?;
    let mut orchestrator = JoinOrchestrator::new(
        backend,
        params,
        synth,
        password,
        JoinOptions::from_vars(&vars),
    );
    let result = orchestrator.run(&mut ledger, prompter.as_mut());
    match &result.failure {
        None => {
            BackendMarker::new(backend.kind()).write(&host, &vars.get_state_dir())?;
            if let Some(deployed) = &result.deployed {
                for path in &deployed.written {
                    println!("wrote {}", path);
                }
            }
            for ovr in &result.overrides {
                warn!("{} was overridden: {}", ovr.stage, ovr.reason);
            }
            println!(
                "Joined {} with {}",
                orchestrator.params().domain_lower,
                backend.kind()
            );
            Ok(ExitCode::SUCCESS)
        }
        Some(failure) => {
            print_bundle(&result);
            Ok(exit_code(failure.kind))
        }
    }
}

fn run_synthesize(common: &CommonOpt, backend: &BackendOpt, really: bool) -> Result<ExitCode> {
    if really {
        require_root(&common.root)?;
    }
    let vars = load_vars(common.vars.as_deref())?;
    let runner = SystemRunner;
    let host = Host::new(&common.root, &runner);
    let backend = backend_for(settle_backend(&host, backend, &vars)?)?;

    let harvested = reconcile(&host, backend.kind());
    let mut partial = PartialJoinParameters::from_operator(&vars);
    partial.merge_harvested(&harvested);
    let missing = partial.missing();
    let (domain_lower, domain_upper) = match (&partial.domain_lower, &partial.domain_upper) {
        (Some(lower), Some(upper)) => (lower.clone(), upper.clone()),
        _ => return Err(AuthError::ReconciliationIncomplete { fields: missing }.into()),
    };
    let synth = SynthesisVars::assemble(backend, &domain_lower, &domain_upper, &harvested, &vars)?;
    let configs = synthesize(backend, &host, &synth)?;

    if !really {
        for config in &configs {
            println!("==> {} (mode {:o})", config.path, config.mode);
            println!("{}", config.contents);
        }
        println!("Dry run; pass --really to write these files.");
        return Ok(ExitCode::SUCCESS);
    }

    let mut ledger = BackupLedger::open_session(&host, &vars.get_backup_dir())?;
    let touched: Vec<String> = configs.iter().map(|c| c.path.clone()).collect();
    let report = deploy(&mut ledger, &configs)
        .map_err(|e| retain_failure(&ledger, "synthesize", e, &touched))?;
    BackendMarker::new(backend.kind())
        .write(&host, &vars.get_state_dir())
        .map_err(|e| retain_failure(&ledger, "synthesize", e, &touched))?;
    for path in &report.written {
        println!("wrote {}", path);
    }
    for path in &report.unchanged {
        println!("unchanged {}", path);
    }
    Ok(ExitCode::SUCCESS)
}

fn run_uninstall(
    common: &CommonOpt,
    backend: &BackendOpt,
    unattended: &NonInteractiveOpt,
    really: bool,
) -> Result<ExitCode> {
    if really {
        require_root(&common.root)?;
    }
    let vars = load_vars(common.vars.as_deref())?;
    let mut prompter = prompter_for(unattended, None)?;
    let runner = SystemRunner;
    let host = Host::new(&common.root, &runner);
    let opt = BackendOpt {
        auto_detect: backend.auto_detect || backend.backend.is_none(),
        backend: backend.backend.clone(),
    };
    let backend = backend_for(settle_backend(&host, &opt, &vars)?)?;

    let plan = uninstall::plan(&host, backend, &vars.get_pam_service());
    if !really {
        for line in plan.describe() {
            println!("would {}", line);
        }
        println!("Dry run; pass --really to apply.");
        return Ok(ExitCode::SUCCESS);
    }
    let mut ledger = BackupLedger::open_session(&host, &vars.get_backup_dir())?;
    let report = plan
        .apply(&mut ledger, prompter.as_mut(), &vars.get_state_dir())
        .map_err(|e| retain_failure(&ledger, "uninstall", e, &plan.touched()))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(ExitCode::SUCCESS)
}

fn run_backup(common: &CommonOpt) -> Result<ExitCode> {
    require_root(&common.root)?;
    let vars = load_vars(common.vars.as_deref())?;
    let runner = SystemRunner;
    let host = Host::new(&common.root, &runner);
    let base = vars.get_backup_dir();
    let mut ledger = BackupLedger::open_session(&host, &base)?;
    let copied = ledger.snapshot(SNAPSHOT_TARGETS)?;
    if copied == 0 {
        warn!("Backup finished but no files were found to copy");
    }
    prune_sessions(&host.path(&base), DEFAULT_BACKUP_RETENTION)?;
    println!("{}", ledger.session_dir().display());
    Ok(ExitCode::SUCCESS)
}

fn run_restore(
    common: &CommonOpt,
    list: bool,
    path: Option<&str>,
    session: Option<&str>,
) -> Result<ExitCode> {
    let vars = load_vars(common.vars.as_deref())?;
    let runner = SystemRunner;
    let host = Host::new(&common.root, &runner);
    let base = vars.get_backup_dir();
    let resolved: PathBuf = host.path(&base);

    if list {
        for record in list_records(&resolved)? {
            println!(
                "{}\t{}\t{}\t{}",
                record.session,
                record.timestamp.to_rfc3339(),
                record.original_path,
                record.backup_path.display()
            );
        }
        return Ok(ExitCode::SUCCESS);
    }

    let records = match (path, session) {
        (Some(path), None) => match latest_record(&resolved, path)? {
            Some(record) => vec![record],
            None => return Err(anyhow!("No backup of {} was found", path)),
        },
        (None, Some(session)) => {
            let records: Vec<_> = list_records(&resolved)?
                .into_iter()
                .filter(|r| r.session == session)
                .collect();
            if records.is_empty() {
                return Err(anyhow!("Backup session {} has no records", session));
            }
            records
        }
        _ => return Err(anyhow!("Specify one of --list, --path or --session")),
    };

    require_root(&common.root)?;
    let mut ledger = BackupLedger::open_session(&host, &base)?;
    for record in &records {
        ledger.restore(record)?;
        println!("restored {}", record.original_path);
    }
    Ok(ExitCode::SUCCESS)
}

fn main() -> ExitCode {
    let opt = RenvAuthParser::parse();

    let debug = match &opt.commands {
        RenvAuthOpt::Detect { common, .. }
        | RenvAuthOpt::Join { common, .. }
        | RenvAuthOpt::Synthesize { common, .. }
        | RenvAuthOpt::Uninstall { common, .. }
        | RenvAuthOpt::Backup { common }
        | RenvAuthOpt::Restore { common, .. } => common.debug,
        RenvAuthOpt::Version { debug } => *debug,
    };

    if debug {
        std::env::set_var("RUST_LOG", "debug");
    }
    tracing_subscriber::fmt::init();

    let outcome = match &opt.commands {
        RenvAuthOpt::Detect { common, json } => run_detect(common, *json),
        RenvAuthOpt::Join {
            common,
            backend,
            unattended,
            password_stdin,
        } => run_join(common, backend, unattended, *password_stdin),
        RenvAuthOpt::Synthesize {
            common,
            backend,
            really,
        } => run_synthesize(common, backend, *really),
        RenvAuthOpt::Uninstall {
            common,
            backend,
            unattended,
            really,
        } => run_uninstall(common, backend, unattended, *really),
        RenvAuthOpt::Backup { common } => run_backup(common),
        RenvAuthOpt::Restore {
            common,
            list,
            path,
            session,
        } => run_restore(common, *list, path.as_deref(), session.as_deref()),
        RenvAuthOpt::Version { debug: _ } => {
            println!("renv-auth {}", env!("CARGO_PKG_VERSION"));
            Ok(ExitCode::SUCCESS)
        }
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            match e.downcast_ref::<AuthError>() {
                Some(auth) => exit_code(auth.kind()),
                None => ExitCode::from(EXIT_FAILED),
            }
        }
    }
}
