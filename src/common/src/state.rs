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
use crate::backend::BackendKind;
use crate::constants::BACKEND_MARKER_FILE;
use crate::error::AuthError;
use crate::host::Host;
use crate::ledger::atomic_write;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::PathBuf;

/// The backend a previous run settled on, so later runs need not ask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendMarker {
    pub backend: BackendKind,
    pub recorded_at: DateTime<Utc>,
}

fn marker_path(host: &Host, state_dir: &str) -> PathBuf {
    host.path(state_dir).join(BACKEND_MARKER_FILE)
}

impl BackendMarker {
    pub fn new(backend: BackendKind) -> Self {
        BackendMarker {
            backend,
            recorded_at: Utc::now(),
        }
    }

    /// A missing or unreadable marker is treated as absent.
    pub fn read(host: &Host, state_dir: &str) -> Option<BackendMarker> {
        let path = marker_path(host, state_dir);
        let contents = fs::read_to_string(&path).ok()?;
        match serde_json::from_str::<BackendMarker>(&contents) {
            Ok(marker) => Some(marker),
            Err(e) => {
                warn!("Ignoring corrupt backend marker {}: {}", path.display(), e);
                None
            }
        }
    }

    pub fn write(&self, host: &Host, state_dir: &str) -> Result<(), AuthError> {
        let path = marker_path(host, state_dir);
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| AuthError::ledger(&path, io::Error::other(e)))?;
        atomic_write(&path, &body, 0o644).map_err(|e| AuthError::ledger(&path, e))?;
        debug!("Recorded backend {} in {}", self.backend, path.display());
        Ok(())
    }

    pub fn clear(host: &Host, state_dir: &str) -> Result<bool, AuthError> {
        let path = marker_path(host, state_dir);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AuthError::ledger(&path, e)),
        }
    }
}
