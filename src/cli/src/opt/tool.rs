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
use clap::{Args, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct CommonOpt {
    #[clap(short, long)]
    pub debug: bool,
    /// Variables file. Defaults to /etc/r_env_manager/auth.vars.conf when
    /// that file exists.
    #[clap(long = "vars", env = "RENV_AUTH_VARS")]
    pub vars: Option<PathBuf>,
    /// Operate on a staged root instead of this host.
    #[clap(long, hide = true, default_value = "/")]
    pub root: PathBuf,
}

#[derive(Debug, Args)]
pub struct BackendOpt {
    /// Detect the active backend from services, config files, nsswitch and PAM.
    #[clap(long = "auto-detect")]
    pub auto_detect: bool,
    /// Use this backend (sssd or samba) regardless of detection.
    #[clap(long)]
    pub backend: Option<String>,
}

#[derive(Debug, Args)]
pub struct NonInteractiveOpt {
    /// Answer yes to every confirmation. Soft check failures are overridden
    /// with --override-reason as the recorded justification.
    #[clap(short = 'y', long = "assume-yes", requires = "override_reason")]
    pub assume_yes: bool,
    #[clap(long = "override-reason")]
    pub override_reason: Option<String>,
}

#[derive(Debug, Subcommand)]
#[clap(about = "R Environment Manager identity backend tool")]
pub enum RenvAuthOpt {
    /// Report which identity backend (SSSD, SAMBA or NONE) is active on this host.
    Detect {
        #[clap(flatten)]
        common: CommonOpt,
        /// Print the full detection report as JSON.
        #[clap(long)]
        json: bool,
    },
    /// Join this host to an Active Directory domain and deploy the backend
    /// configuration.
    Join {
        #[clap(flatten)]
        common: CommonOpt,
        #[clap(flatten)]
        backend: BackendOpt,
        #[clap(flatten)]
        unattended: NonInteractiveOpt,
        /// Read the administrator password from the first line of stdin.
        #[clap(long = "password-stdin", requires = "assume_yes")]
        password_stdin: bool,
    },
    /// Render the backend configuration files. Nothing is written unless
    /// --really is given.
    Synthesize {
        #[clap(flatten)]
        common: CommonOpt,
        #[clap(flatten)]
        backend: BackendOpt,
        #[clap(long)]
        really: bool,
    },
    /// Remove the identity backend's NSS, PAM and realm configuration. Only
    /// reports what would change unless --really is given.
    Uninstall {
        #[clap(flatten)]
        common: CommonOpt,
        #[clap(flatten)]
        backend: BackendOpt,
        #[clap(flatten)]
        unattended: NonInteractiveOpt,
        #[clap(long)]
        really: bool,
    },
    /// Copy the critical system configuration into a new backup session.
    Backup {
        #[clap(flatten)]
        common: CommonOpt,
    },
    /// Restore files from the backup ledger.
    Restore {
        #[clap(flatten)]
        common: CommonOpt,
        /// List every backup record.
        #[clap(long, conflicts_with_all = ["path", "session"])]
        list: bool,
        /// Restore the most recent backup of this path.
        #[clap(long, conflicts_with = "session")]
        path: Option<String>,
        /// Restore every file recorded in this session.
        #[clap(long)]
        session: Option<String>,
    },
    /// Show the version of this tool.
    Version {
        #[clap(short, long)]
        debug: bool,
    },
}

#[derive(Debug, clap::Parser)]
#[clap(about = "R Environment Manager identity backend tool")]
pub struct RenvAuthParser {
    #[clap(subcommand)]
    pub commands: RenvAuthOpt,
}
