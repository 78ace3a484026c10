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
use crate::constants::{
    DEFAULT_SAMBA_HOME_TEMPLATE, DEFAULT_SSSD_HOME_TEMPLATE, NSSWITCH_CONF, PAM_COMMON_ACCOUNT,
    PAM_COMMON_AUTH, PAM_COMMON_PASSWORD, PAM_COMMON_SESSION, PAM_PASSWORD_AUTH, PAM_SYSTEM_AUTH,
    SAMBA_DEFAULTS_PATH, SMB_CONF, SSSD_CONF, SSSD_DEFAULTS_PATH,
};
use crate::detect::DetectionSignal;
use crate::error::AuthError;
use crate::host::Host;
use crate::ledger::RenderedConfig;
use crate::nsswitch::NsswitchConf;
use crate::pam::{PamStack, Placement};
use crate::reconcile::{reconcile_samba, reconcile_sssd, ReconciledVars};
use crate::runner::CommandSpec;
use crate::synthesize::{synthesize_samba, synthesize_sssd, SynthesisVars};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BackendKind {
    Sssd,
    Samba,
    None,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Sssd => "SSSD",
            BackendKind::Samba => "SAMBA",
            BackendKind::None => "NONE",
        })
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sssd" => Ok(BackendKind::Sssd),
            "samba" | "winbind" => Ok(BackendKind::Samba),
            "none" | "" => Ok(BackendKind::None),
            other => Err(format!("Unrecognized identity backend '{}'", other)),
        }
    }
}

impl BackendKind {
    /// The implementation behind this kind; `None` has no implementation.
    pub fn backend(self) -> Option<&'static dyn IdentityBackend> {
        match self {
            BackendKind::Sssd => Some(&SssdBackend),
            BackendKind::Samba => Some(&SambaBackend),
            BackendKind::None => None,
        }
    }
}

/// Shared PAM stacks consulted for module references.
pub(crate) const PAM_DETECTION_FILES: &[&str] = &[
    PAM_COMMON_AUTH,
    PAM_COMMON_ACCOUNT,
    PAM_COMMON_SESSION,
    PAM_COMMON_PASSWORD,
    PAM_SYSTEM_AUTH,
    PAM_PASSWORD_AUTH,
];

/// A rule the backend needs in one of the shared PAM stacks.
#[derive(Debug, Clone, Copy)]
pub struct PamInsertion {
    pub file: &'static str,
    pub rule: &'static str,
    pub placement: Placement,
}

const MKHOMEDIR_RULE: &str = "session required pam_mkhomedir.so skel=/etc/skel umask=0077";

/// Behaviour that differs between identity backends. Selected once per run
/// from a [`BackendKind`] and threaded through every stage.
pub trait IdentityBackend: Sync {
    fn kind(&self) -> BackendKind;
    /// Services whose activity identifies this backend.
    fn services(&self) -> &'static [&'static str];
    /// The daemon that resolves identities once joined.
    fn identity_daemon(&self) -> &'static str;
    fn config_file(&self) -> &'static str;
    fn defaults_file(&self) -> &'static str;
    fn nss_token(&self) -> &'static str;
    fn nss_databases(&self) -> &'static [&'static str];
    fn pam_module(&self) -> &'static str;
    fn pam_rules(&self) -> &'static [PamInsertion];
    fn membership_software(&self) -> &'static str;
    fn client_software(&self) -> &'static str;
    fn default_home_template(&self) -> &'static str;
    fn cache_flush(&self) -> CommandSpec;

    fn reconcile(&self, host: &Host) -> ReconciledVars;
    fn synthesize(&self, host: &Host, vars: &SynthesisVars)
        -> Result<Vec<RenderedConfig>, AuthError>;

    /// Whether `signal` points at this backend. Read-only.
    fn shows(&self, host: &Host, signal: DetectionSignal) -> bool {
        match signal {
            DetectionSignal::ActiveService => {
                self.services().iter().any(|s| host.service_active(s))
            }
            DetectionSignal::ConfigFilePresence => host.is_file(self.config_file()),
            DetectionSignal::NsswitchEntry => match host.read(NSSWITCH_CONF) {
                Some(contents) => {
                    let nss = NsswitchConf::parse(&contents);
                    ["passwd", "group"]
                        .iter()
                        .any(|db| nss.has_source(db, self.nss_token()))
                }
                None => false,
            },
            DetectionSignal::PamModuleReference => PAM_DETECTION_FILES
                .iter()
                .filter_map(|f| host.read(f))
                .any(|contents| PamStack::parse(&contents).references(self.pam_module())),
        }
    }
}

pub struct SssdBackend;

const SSSD_PAM_RULES: &[PamInsertion] = &[
    PamInsertion {
        file: PAM_COMMON_AUTH,
        rule: "auth sufficient pam_sss.so forward_pass",
        placement: Placement::Before("pam_unix.so"),
    },
    PamInsertion {
        file: PAM_COMMON_ACCOUNT,
        rule: "account sufficient pam_sss.so",
        placement: Placement::Before("pam_unix.so"),
    },
    PamInsertion {
        file: PAM_COMMON_SESSION,
        rule: MKHOMEDIR_RULE,
        placement: Placement::After("pam_unix.so"),
    },
    PamInsertion {
        file: PAM_COMMON_SESSION,
        rule: "session optional pam_sss.so",
        placement: Placement::End,
    },
    PamInsertion {
        file: PAM_COMMON_PASSWORD,
        rule: "password sufficient pam_sss.so use_authtok",
        placement: Placement::Before("pam_unix.so"),
    },
];

impl IdentityBackend for SssdBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sssd
    }

    fn services(&self) -> &'static [&'static str] {
        &["sssd"]
    }

    fn identity_daemon(&self) -> &'static str {
        "sssd"
    }

    fn config_file(&self) -> &'static str {
        SSSD_CONF
    }

    fn defaults_file(&self) -> &'static str {
        SSSD_DEFAULTS_PATH
    }

    fn nss_token(&self) -> &'static str {
        "sss"
    }

    fn nss_databases(&self) -> &'static [&'static str] {
        &["passwd", "group", "shadow", "netgroup"]
    }

    fn pam_module(&self) -> &'static str {
        "pam_sss.so"
    }

    fn pam_rules(&self) -> &'static [PamInsertion] {
        SSSD_PAM_RULES
    }

    fn membership_software(&self) -> &'static str {
        "adcli"
    }

    fn client_software(&self) -> &'static str {
        "sssd"
    }

    fn default_home_template(&self) -> &'static str {
        DEFAULT_SSSD_HOME_TEMPLATE
    }

    fn cache_flush(&self) -> CommandSpec {
        CommandSpec::new("sss_cache").arg("-E")
    }

    fn reconcile(&self, host: &Host) -> ReconciledVars {
        reconcile_sssd(host)
    }

    fn synthesize(
        &self,
        host: &Host,
        vars: &SynthesisVars,
    ) -> Result<Vec<RenderedConfig>, AuthError> {
        synthesize_sssd(self, host, vars)
    }
}

pub struct SambaBackend;

const SAMBA_PAM_RULES: &[PamInsertion] = &[
    PamInsertion {
        file: PAM_COMMON_AUTH,
        rule: "auth sufficient pam_winbind.so krb5_auth krb5_ccache_type=FILE cached_login try_first_pass",
        placement: Placement::Before("pam_unix.so"),
    },
    PamInsertion {
        file: PAM_COMMON_ACCOUNT,
        rule: "account sufficient pam_winbind.so",
        placement: Placement::Before("pam_unix.so"),
    },
    PamInsertion {
        file: PAM_COMMON_SESSION,
        rule: MKHOMEDIR_RULE,
        placement: Placement::After("pam_unix.so"),
    },
    PamInsertion {
        file: PAM_COMMON_SESSION,
        rule: "session optional pam_winbind.so",
        placement: Placement::End,
    },
    PamInsertion {
        file: PAM_COMMON_PASSWORD,
        rule: "password sufficient pam_winbind.so use_authtok try_first_pass",
        placement: Placement::Before("pam_unix.so"),
    },
];

impl IdentityBackend for SambaBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Samba
    }

    fn services(&self) -> &'static [&'static str] {
        &["winbind", "smbd"]
    }

    fn identity_daemon(&self) -> &'static str {
        "winbind"
    }

    fn config_file(&self) -> &'static str {
        SMB_CONF
    }

    fn defaults_file(&self) -> &'static str {
        SAMBA_DEFAULTS_PATH
    }

    fn nss_token(&self) -> &'static str {
        "winbind"
    }

    fn nss_databases(&self) -> &'static [&'static str] {
        &["passwd", "group"]
    }

    fn pam_module(&self) -> &'static str {
        "pam_winbind.so"
    }

    fn pam_rules(&self) -> &'static [PamInsertion] {
        SAMBA_PAM_RULES
    }

    fn membership_software(&self) -> &'static str {
        "samba"
    }

    fn client_software(&self) -> &'static str {
        "winbind"
    }

    fn default_home_template(&self) -> &'static str {
        DEFAULT_SAMBA_HOME_TEMPLATE
    }

    fn cache_flush(&self) -> CommandSpec {
        CommandSpec::new("net").args(["cache", "flush"])
    }

    fn reconcile(&self, host: &Host) -> ReconciledVars {
        reconcile_samba(host)
    }

    fn synthesize(
        &self,
        host: &Host,
        vars: &SynthesisVars,
    ) -> Result<Vec<RenderedConfig>, AuthError> {
        synthesize_samba(self, host, vars)
    }
}

/// Picks the backend for this run: an explicit operator choice wins, then
/// what detection found on the host, then the marker a previous run left.
pub fn select_backend(
    explicit: Option<BackendKind>,
    detected: Option<BackendKind>,
    marker: Option<BackendKind>,
) -> Option<BackendKind> {
    let usable = |k: &BackendKind| *k != BackendKind::None;
    if let (Some(explicit), Some(detected)) = (explicit, detected) {
        if usable(&explicit) && usable(&detected) && explicit != detected {
            warn!(
                "Declared backend {} overrides detected backend {}",
                explicit, detected
            );
        }
    }
    explicit
        .filter(usable)
        .or_else(|| detected.filter(usable))
        .or_else(|| marker.filter(usable))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        assert_eq!("winbind".parse::<BackendKind>(), Ok(BackendKind::Samba));
        assert_eq!(" SSSD ".parse::<BackendKind>(), Ok(BackendKind::Sssd));
        assert!("kanidm".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Samba.to_string(), "SAMBA");
        assert_eq!(
            serde_json::to_string(&BackendKind::None).unwrap(),
            "\"NONE\""
        );
    }

    #[test]
    fn test_backend_lookup() {
        assert!(BackendKind::None.backend().is_none());
        let sssd = BackendKind::Sssd.backend().unwrap();
        assert_eq!(sssd.kind(), BackendKind::Sssd);
        assert_eq!(sssd.membership_software(), "adcli");
        let samba = BackendKind::Samba.backend().unwrap();
        assert_eq!(samba.client_software(), "winbind");
        assert_eq!(samba.cache_flush().command_line(), "net cache flush");
    }

    #[test]
    fn test_pam_rules_parse() {
        for kind in [BackendKind::Sssd, BackendKind::Samba] {
            let backend = kind.backend().unwrap();
            for insertion in backend.pam_rules() {
                assert!(crate::pam::PamRule::parse(insertion.rule).is_some());
            }
        }
    }

    #[test]
    fn test_select_backend_precedence() {
        use BackendKind::{Samba, Sssd};
        assert_eq!(
            select_backend(Some(Samba), Some(Sssd), Some(Sssd)),
            Some(Samba)
        );
        assert_eq!(select_backend(None, Some(Sssd), Some(Samba)), Some(Sssd));
        assert_eq!(
            select_backend(Some(BackendKind::None), Some(BackendKind::None), Some(Samba)),
            Some(Samba)
        );
        assert_eq!(select_backend(None, None, None), None);
    }
}
