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
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

/// Coarse classification of an [`AuthError`]. This is what the CLI maps to
/// exit codes and what gets persisted with a failure record in the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    DetectionAmbiguous,
    ConfigMissing,
    ReconciliationIncomplete,
    PreflightSoft,
    CredentialInvalid,
    JoinFailed,
    SynthesisWriteFailed,
    Aborted,
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::DetectionAmbiguous => "detection ambiguous",
            FailureKind::ConfigMissing => "configuration missing",
            FailureKind::ReconciliationIncomplete => "reconciliation incomplete",
            FailureKind::PreflightSoft => "pre-flight check failed",
            FailureKind::CredentialInvalid => "credentials rejected",
            FailureKind::JoinFailed => "join failed",
            FailureKind::SynthesisWriteFailed => "configuration write failed",
            FailureKind::Aborted => "aborted by operator",
            FailureKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// Conflicting detection evidence. Resolved by signal priority and only
    /// ever reported, never returned from detection itself.
    #[error("conflicting backend signals: {0}")]
    DetectionAmbiguous(String),
    #[error("configuration file {} is missing", .0.display())]
    ConfigMissing(PathBuf),
    #[error("configuration file {} could not be parsed: {reason}", path.display())]
    ConfigInvalid { path: PathBuf, reason: String },
    #[error("required parameters are still empty: {}", fields.join(", "))]
    ReconciliationIncomplete { fields: Vec<&'static str> },
    #[error("pre-flight checks failed: {0}")]
    PreflightSoft(String),
    #[error("credential check for {principal} failed: {reason}")]
    CredentialInvalid { principal: String, reason: String },
    #[error("domain join failed: {0}")]
    JoinFailed(String),
    #[error("failed to write {}: {source}", path.display())]
    SynthesisWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to render {template}: {reason}")]
    Template { template: String, reason: String },
    #[error("backup ledger failure at {}: {source}", path.display())]
    Ledger {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to execute {program}: {source}")]
    Command {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("aborted by operator during {stage}: {reason}")]
    Aborted { stage: String, reason: String },
}

impl AuthError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AuthError::DetectionAmbiguous(_) => FailureKind::DetectionAmbiguous,
            AuthError::ConfigMissing(_) | AuthError::ConfigInvalid { .. } => {
                FailureKind::ConfigMissing
            }
            AuthError::ReconciliationIncomplete { .. } => FailureKind::ReconciliationIncomplete,
            AuthError::PreflightSoft(_) => FailureKind::PreflightSoft,
            AuthError::CredentialInvalid { .. } => FailureKind::CredentialInvalid,
            AuthError::JoinFailed(_) => FailureKind::JoinFailed,
            AuthError::SynthesisWriteFailed { .. } => FailureKind::SynthesisWriteFailed,
            AuthError::Aborted { .. } => FailureKind::Aborted,
            AuthError::Template { .. } | AuthError::Ledger { .. } | AuthError::Command { .. } => {
                FailureKind::Internal
            }
        }
    }

    /// Soft conditions may be overridden by the operator; everything else
    /// aborts the current stage.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            AuthError::DetectionAmbiguous(_)
                | AuthError::PreflightSoft(_)
                | AuthError::CredentialInvalid { .. }
        )
    }

    pub(crate) fn ledger(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AuthError::Ledger {
            path: path.into(),
            source,
        }
    }
}
