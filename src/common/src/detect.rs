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
use crate::backend::{BackendKind, IdentityBackend};
use crate::host::Host;
use serde::Serialize;
use std::fmt;

/// Evidence of an identity backend, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionSignal {
    ActiveService,
    ConfigFilePresence,
    NsswitchEntry,
    PamModuleReference,
}

impl DetectionSignal {
    pub const PRIORITY: [DetectionSignal; 4] = [
        DetectionSignal::ActiveService,
        DetectionSignal::ConfigFilePresence,
        DetectionSignal::NsswitchEntry,
        DetectionSignal::PamModuleReference,
    ];
}

impl fmt::Display for DetectionSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DetectionSignal::ActiveService => "active service",
            DetectionSignal::ConfigFilePresence => "config file",
            DetectionSignal::NsswitchEntry => "nsswitch entry",
            DetectionSignal::PamModuleReference => "PAM module reference",
        })
    }
}

/// What one signal showed for each backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SignalObservation {
    pub signal: DetectionSignal,
    pub sssd: bool,
    pub samba: bool,
}

impl SignalObservation {
    /// The backend this signal votes for. SSSD is checked first.
    pub fn guess(self) -> BackendKind {
        if self.sssd {
            BackendKind::Sssd
        } else if self.samba {
            BackendKind::Samba
        } else {
            BackendKind::None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectionReport {
    pub backend: BackendKind,
    pub is_domain_joined: bool,
    /// Signals disagreed. Resolved by priority order and never fatal.
    pub ambiguous: bool,
    pub observations: Vec<SignalObservation>,
}

/// Resolves observations to a backend: the highest-priority signal with a
/// guess wins. Also reports whether any signals disagreed.
pub fn classify(observations: &[SignalObservation]) -> (BackendKind, bool) {
    let mut ordered = observations.to_vec();
    ordered.sort_by_key(|o| {
        DetectionSignal::PRIORITY
            .iter()
            .position(|s| *s == o.signal)
            .unwrap_or(usize::MAX)
    });

    let backend = ordered
        .iter()
        .map(|o| o.guess())
        .find(|g| *g != BackendKind::None)
        .unwrap_or(BackendKind::None);

    let sssd_seen = ordered.iter().any(|o| o.sssd);
    let samba_seen = ordered.iter().any(|o| o.samba);
    (backend, sssd_seen && samba_seen)
}

/// Observes every signal on the host. Only reads files and queries service
/// state, so it is safe to call from a dry run.
pub fn observe(host: &Host) -> Vec<SignalObservation> {
    let sssd = BackendKind::Sssd.backend();
    let samba = BackendKind::Samba.backend();
    let shows = |b: Option<&'static dyn IdentityBackend>, signal: DetectionSignal| {
        b.map(|b| b.shows(host, signal)).unwrap_or(false)
    };
    DetectionSignal::PRIORITY
        .iter()
        .map(|signal| {
            let obs = SignalObservation {
                signal: *signal,
                sssd: shows(sssd, *signal),
                samba: shows(samba, *signal),
            };
            trace!(?obs, "Detection signal");
            obs
        })
        .collect()
}

pub fn detect_report(host: &Host) -> DetectionReport {
    let observations = observe(host);
    let (backend, ambiguous) = classify(&observations);
    if ambiguous {
        let conflict = crate::error::AuthError::DetectionAmbiguous(
            observations
                .iter()
                .filter(|o| o.guess() != BackendKind::None)
                .map(|o| format!("{} -> {}", o.signal, o.guess()))
                .collect::<Vec<_>>()
                .join(", "),
        );
        warn!("{}; using {}", conflict, backend);
    }
    debug!("Detected identity backend: {}", backend);
    DetectionReport {
        backend,
        is_domain_joined: backend != BackendKind::None,
        ambiguous,
        observations,
    }
}

pub fn detect(host: &Host) -> BackendKind {
    detect_report(host).backend
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{NSSWITCH_CONF, PAM_COMMON_AUTH, SMB_CONF, SSSD_CONF};
    use crate::runner::fake::FakeRunner;
    use std::fs;
    use tempfile::TempDir;

    fn observation(signal: DetectionSignal, kind: BackendKind) -> SignalObservation {
        SignalObservation {
            signal,
            sssd: kind == BackendKind::Sssd,
            samba: kind == BackendKind::Samba,
        }
    }

    #[test]
    fn test_classify_exhaustive() {
        let kinds = [BackendKind::None, BackendKind::Sssd, BackendKind::Samba];
        for a in kinds {
            for b in kinds {
                for c in kinds {
                    for d in kinds {
                        let guesses = [a, b, c, d];
                        let observations: Vec<_> = DetectionSignal::PRIORITY
                            .iter()
                            .zip(guesses)
                            .map(|(s, k)| observation(*s, k))
                            .collect();
                        let expected = guesses
                            .iter()
                            .copied()
                            .find(|k| *k != BackendKind::None)
                            .unwrap_or(BackendKind::None);
                        let conflicting = guesses.contains(&BackendKind::Sssd)
                            && guesses.contains(&BackendKind::Samba);
                        assert_eq!(
                            classify(&observations),
                            (expected, conflicting),
                            "{:?}",
                            guesses
                        );

                        // Order of the input slice does not matter.
                        let mut reversed = observations.clone();
                        reversed.reverse();
                        assert_eq!(classify(&reversed).0, expected);
                    }
                }
            }
        }
    }

    #[test]
    fn test_sssd_wins_within_a_tier() {
        let obs = [SignalObservation {
            signal: DetectionSignal::ConfigFilePresence,
            sssd: true,
            samba: true,
        }];
        assert_eq!(classify(&obs), (BackendKind::Sssd, true));
    }

    fn stage(dir: &TempDir, path: &str, contents: &str) {
        let full = dir.path().join(path.trim_start_matches('/'));
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, contents).unwrap();
    }

    #[test]
    fn test_active_service_overrides_leftover_files() {
        let dir = TempDir::new().unwrap();
        stage(&dir, SSSD_CONF, "[sssd]\ndomains = old.example.com\n");
        stage(&dir, SMB_CONF, "[global]\nrealm = EXAMPLE.COM\n");
        let runner = FakeRunner::new();
        runner.on("systemctl is-active --quiet winbind", 0, "");
        let host = Host::new(dir.path(), &runner);

        let report = detect_report(&host);
        assert_eq!(report.backend, BackendKind::Samba);
        assert!(report.ambiguous);
        assert!(report.is_domain_joined);
        // Detection never mutates the host.
        assert!(runner
            .calls()
            .iter()
            .all(|c| c.starts_with("systemctl is-active")));
    }

    #[test]
    fn test_weak_signals() {
        let dir = TempDir::new().unwrap();
        stage(
            &dir,
            NSSWITCH_CONF,
            "passwd: files winbind\ngroup: files winbind\n",
        );
        stage(
            &dir,
            PAM_COMMON_AUTH,
            "auth [success=2 default=ignore] pam_sss.so\n",
        );
        let runner = FakeRunner::new();
        let host = Host::new(dir.path(), &runner);
        assert_eq!(detect(&host), BackendKind::Samba);

        fs::remove_file(dir.path().join("etc/nsswitch.conf")).unwrap();
        assert_eq!(detect(&host), BackendKind::Sssd);
    }

    #[test]
    fn test_nothing_detected() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let host = Host::new(dir.path(), &runner);
        let report = detect_report(&host);
        assert_eq!(report.backend, BackendKind::None);
        assert!(!report.is_domain_joined);
        assert!(!report.ambiguous);
        assert_eq!(report.observations.len(), 4);
    }
}
