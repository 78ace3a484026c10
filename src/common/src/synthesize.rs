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
use crate::config::VariablesFile;
use crate::constants::{
    DEFAULT_IDMAP_RANGE_HIGH, DEFAULT_IDMAP_RANGE_LOW, DEFAULT_VARS_PATH,
    IDMAP_FALLBACK_RANGE_HIGH, IDMAP_FALLBACK_RANGE_LOW, KRB5_CONF, NETBIOS_NAME_MAX, NSSWITCH_CONF, PAM_DIR, PAM_WINBIND_CONF, SMB_CONF, SSSD_CONF,
};
use crate::error::AuthError;
use crate::host::Host;
use crate::krb5::{RealmEntry, RealmTable};
use crate::ledger::{BackupLedger, RenderedConfig, WriteOutcome};
use crate::nsswitch::NsswitchConf;
use crate::pam::{PamRule, PamStack};
use crate::reconcile::ReconciledVars;
use crate::template::{
    render, KRB5_CONF_TEMPLATE, PAM_SERVICE_TEMPLATE, PAM_WINBIND_CONF_TEMPLATE,
    SMB_CONF_TEMPLATE, SSSD_CONF_TEMPLATE,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Everything the templates are rendered from, after all sources have been
/// merged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SynthesisVars {
    pub domain_lower: String,
    pub domain_upper: String,
    pub workgroup: String,
    pub home_template: String,
    pub allowed_groups: Vec<String>,
    pub idmap_range_low: u32,
    pub idmap_range_high: u32,
    pub realms: RealmTable,
    pub pam_service: String,
}

/// NetBIOS names are at most 15 characters; the first DNS label is the
/// conventional default.
fn default_workgroup(domain: &str) -> String {
    domain
        .split('.')
        .next()
        .unwrap_or(domain)
        .to_uppercase()
        .chars()
        .take(NETBIOS_NAME_MAX)
        .collect()
}

fn realm_table(domain_lower: &str, vars: &VariablesFile) -> RealmTable {
    let mut realms = RealmTable::new();
    realms.add(RealmEntry::primary(domain_lower));
    for entry in vars.get_krb5_realms() {
        realms.add(entry);
    }
    realms
}

impl SynthesisVars {
    /// Merges operator variables, harvested values and backend defaults, in
    /// that order of precedence.
    pub fn assemble(
        backend: &dyn IdentityBackend,
        domain_lower: &str,
        domain_upper: &str,
        harvested: &ReconciledVars,
        vars: &VariablesFile,
    ) -> Result<Self, AuthError> {
        let invalid = |reason: String| AuthError::ConfigInvalid {
            path: vars
                .filename()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(DEFAULT_VARS_PATH)),
            reason,
        };

        let workgroup = vars
            .get_workgroup()
            .or_else(|| harvested.workgroup.clone())
            .unwrap_or_else(|| default_workgroup(domain_lower));
        if workgroup.len() > NETBIOS_NAME_MAX {
            return Err(invalid(format!(
                "WORKGROUP {} is longer than {} characters",
                workgroup, NETBIOS_NAME_MAX
            )));
        }

        let idmap_range_low = vars
            .get_idmap_range_low()
            .or(harvested.idmap_range_low)
            .unwrap_or(DEFAULT_IDMAP_RANGE_LOW);
        let idmap_range_high = vars
            .get_idmap_range_high()
            .unwrap_or(DEFAULT_IDMAP_RANGE_HIGH);
        if idmap_range_low >= idmap_range_high {
            return Err(invalid(format!(
                "ID mapping range {}-{} is empty",
                idmap_range_low, idmap_range_high
            )));
        }
        if backend.kind() == BackendKind::Samba && idmap_range_low <= IDMAP_FALLBACK_RANGE_HIGH {
            return Err(invalid(format!(
                "ID mapping range {}-{} overlaps the default range {}-{}",
                idmap_range_low,
                idmap_range_high,
                IDMAP_FALLBACK_RANGE_LOW,
                IDMAP_FALLBACK_RANGE_HIGH
            )));
        }

        let allowed_groups = match vars.get_allowed_groups() {
            groups if !groups.is_empty() => groups,
            _ => harvested.allowed_groups.clone(),
        };

        Ok(SynthesisVars {
            domain_lower: domain_lower.to_lowercase(),
            domain_upper: domain_upper.to_uppercase(),
            workgroup,
            home_template: vars
                .get_home_template()
                .or_else(|| harvested.home_template.clone())
                .unwrap_or_else(|| backend.default_home_template().to_string()),
            allowed_groups,
            idmap_range_low,
            idmap_range_high,
            realms: realm_table(domain_lower, vars),
            pam_service: vars.get_pam_service(),
        })
    }

    /// After a join the directory's own realm and workgroup are
    /// authoritative.
    pub fn adopt_join_values(&mut self, harvested: &ReconciledVars) {
        if let Some(realm) = &harvested.realm {
            if *realm != self.domain_upper {
                info!("Join reported realm {}; replacing {}", realm, self.domain_upper);
                self.domain_upper = realm.clone();
            }
        }
        if let Some(workgroup) = &harvested.workgroup {
            if *workgroup != self.workgroup {
                info!(
                    "Join reported workgroup {}; replacing {}",
                    workgroup, self.workgroup
                );
                self.workgroup = workgroup.clone();
            }
        }
    }

    fn template_values(&self, backend: &dyn IdentityBackend) -> BTreeMap<&'static str, String> {
        let access_rules = if self.allowed_groups.is_empty() {
            "access_provider = ad".to_string()
        } else {
            format!(
                "access_provider = simple\nsimple_allow_groups = {}",
                self.allowed_groups.join(", ")
            )
        };
        let require_membership = if self.allowed_groups.is_empty() {
            String::new()
        } else {
            format!("require_membership_of = {}", self.allowed_groups.join(","))
        };
        BTreeMap::from([
            ("DOMAIN_LOWER", self.domain_lower.clone()),
            ("DOMAIN_UPPER", self.domain_upper.clone()),
            ("WORKGROUP", self.workgroup.clone()),
            ("HOME_TEMPLATE", self.home_template.clone()),
            ("IDMAP_RANGE_LOW", self.idmap_range_low.to_string()),
            ("IDMAP_RANGE_HIGH", self.idmap_range_high.to_string()),
            (
                "IDMAP_FALLBACK_RANGE",
                format!("{}-{}", IDMAP_FALLBACK_RANGE_LOW, IDMAP_FALLBACK_RANGE_HIGH),
            ),
            ("ACCESS_RULES", access_rules),
            ("REQUIRE_MEMBERSHIP", require_membership),
            ("REALMS", self.realms.render_realms()),
            ("DOMAIN_REALM", self.realms.render_domain_realm()),
            ("BACKEND", backend.kind().to_string()),
        ])
    }
}

fn pam_service_path(service: &str) -> String {
    format!("{}/{}", PAM_DIR, service)
}

/// Files every backend needs: the Kerberos realm map, NSS database lines,
/// the shared PAM stacks and the service stanza. The other backend's NSS
/// tokens and PAM modules are stripped, since only one may be active.
fn shared_files(
    backend: &dyn IdentityBackend,
    host: &Host,
    vars: &SynthesisVars,
    values: &BTreeMap<&'static str, String>,
) -> Result<Vec<RenderedConfig>, AuthError> {
    let others: Vec<&'static dyn IdentityBackend> = [BackendKind::Sssd, BackendKind::Samba]
        .into_iter()
        .filter(|k| *k != backend.kind())
        .filter_map(BackendKind::backend)
        .collect();

    let mut configs = vec![RenderedConfig::new(
        KRB5_CONF,
        render("krb5.conf", KRB5_CONF_TEMPLATE, values)?,
        0o644,
    )];

    let mut nss = NsswitchConf::parse(&host.read(NSSWITCH_CONF).unwrap_or_default());
    for other in &others {
        for db in other.nss_databases() {
            nss.remove_source(db, other.nss_token());
        }
    }
    for db in backend.nss_databases() {
        nss.add_source(db, backend.nss_token());
    }
    configs.push(RenderedConfig::new(NSSWITCH_CONF, nss.render(), 0o644));

    let mut stacks: BTreeMap<&'static str, PamStack> = BTreeMap::new();
    for insertion in backend.pam_rules() {
        if !stacks.contains_key(insertion.file) {
            match host.read(insertion.file) {
                Some(contents) => {
                    let mut stack = PamStack::parse(&contents);
                    for other in &others {
                        stack.remove_module(other.pam_module());
                    }
                    stacks.insert(insertion.file, stack);
                }
                None => {
                    debug!("{} does not exist; not wiring it", insertion.file);
                    continue;
                }
            }
        }
        let rule = PamRule::parse(insertion.rule).ok_or_else(|| AuthError::Template {
            template: insertion.file.to_string(),
            reason: format!("malformed PAM rule '{}'", insertion.rule),
        })?;
        if let Some(stack) = stacks.get_mut(insertion.file) {
            stack.insert(rule, insertion.placement);
        }
    }
    if stacks.is_empty() {
        warn!("No shared PAM stacks found; only the service stanza will be written");
    }
    for (file, stack) in stacks {
        configs.push(RenderedConfig::new(file, stack.render(), 0o644));
    }

    configs.push(RenderedConfig::new(
        &pam_service_path(&vars.pam_service),
        render("PAM service", PAM_SERVICE_TEMPLATE, values)?,
        0o644,
    ));
    Ok(configs)
}

pub fn synthesize_sssd(
    backend: &dyn IdentityBackend,
    host: &Host,
    vars: &SynthesisVars,
) -> Result<Vec<RenderedConfig>, AuthError> {
    let values = vars.template_values(backend);
    let mut configs = vec![RenderedConfig::new(
        SSSD_CONF,
        render("sssd.conf", SSSD_CONF_TEMPLATE, &values)?,
        0o600,
    )];
    configs.extend(shared_files(backend, host, vars, &values)?);
    Ok(configs)
}

pub fn synthesize_samba(
    backend: &dyn IdentityBackend,
    host: &Host,
    vars: &SynthesisVars,
) -> Result<Vec<RenderedConfig>, AuthError> {
    let values = vars.template_values(backend);
    let mut configs = vec![
        RenderedConfig::new(
            SMB_CONF,
            render("smb.conf", SMB_CONF_TEMPLATE, &values)?,
            0o644,
        ),
        RenderedConfig::new(
            PAM_WINBIND_CONF,
            render("pam_winbind.conf", PAM_WINBIND_CONF_TEMPLATE, &values)?,
            0o644,
        ),
    ];
    configs.extend(shared_files(backend, host, vars, &values)?);
    Ok(configs)
}

/// Renders every file `backend` needs. Nothing is written.
pub fn synthesize(
    backend: &dyn IdentityBackend,
    host: &Host,
    vars: &SynthesisVars,
) -> Result<Vec<RenderedConfig>, AuthError> {
    let configs = backend.synthesize(host, vars)?;
    debug!(
        "Rendered {} files for the {} backend",
        configs.len(),
        backend.kind()
    );
    Ok(configs)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeployReport {
    pub written: Vec<String>,
    pub unchanged: Vec<String>,
    /// What each written file replaced, for rolling the stage back.
    #[serde(skip)]
    pub changes: Vec<(String, WriteOutcome)>,
}

impl DeployReport {
    /// Returns every file this deployment wrote to its earlier state.
    pub fn rollback(&self, ledger: &mut BackupLedger) -> Vec<AuthError> {
        if self.changes.is_empty() {
            return vec![];
        }
        warn!("Rolling back {} files written by this stage", self.changes.len());
        ledger.rollback(&self.changes)
    }
}

/// Writes every config through the ledger. If any write fails, the files
/// this call already changed are rolled back before the error is returned.
pub fn deploy(
    ledger: &mut BackupLedger,
    configs: &[RenderedConfig],
) -> Result<DeployReport, AuthError> {
    let mut report = DeployReport::default();
    for config in configs {
        match ledger.write_with_backup(config) {
            Ok(WriteOutcome::Unchanged) => report.unchanged.push(config.path.clone()),
            Ok(outcome) => {
                report.written.push(config.path.clone());
                report.changes.push((config.path.clone(), outcome));
            }
            Err(e) => {
                for failure in report.rollback(ledger) {
                    error!("{}", failure);
                }
                return Err(e);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{PAM_COMMON_AUTH, PAM_COMMON_SESSION};
    use crate::runner::fake::FakeRunner;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    const NSSWITCH: &str = "passwd:         files systemd sss\ngroup:          files systemd\nshadow:         files\nhosts:          files dns\n";
    const COMMON_AUTH: &str = "auth\t[success=1 default=ignore]\tpam_unix.so nullok\nauth\trequisite\tpam_deny.so\nauth\trequired\tpam_permit.so\n";
    const COMMON_SESSION: &str = "session\t[default=1]\tpam_permit.so\nsession\trequired\tpam_unix.so\n";

    fn stage(dir: &TempDir, path: &str, contents: &str) {
        let full = dir.path().join(path.trim_start_matches('/'));
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, contents).unwrap();
    }

    fn staged_host(dir: &TempDir) {
        stage(dir, NSSWITCH_CONF, NSSWITCH);
        stage(dir, PAM_COMMON_AUTH, COMMON_AUTH);
        stage(dir, PAM_COMMON_SESSION, COMMON_SESSION);
    }

    fn vars_for(kind: BackendKind, text: &str) -> SynthesisVars {
        let vars = VariablesFile::parse(text).unwrap();
        SynthesisVars::assemble(
            kind.backend().unwrap(),
            "research.example.com",
            "RESEARCH.EXAMPLE.COM",
            &ReconciledVars::default(),
            &vars,
        )
        .unwrap()
    }

    fn find<'c>(configs: &'c [RenderedConfig], path: &str) -> &'c RenderedConfig {
        configs.iter().find(|c| c.path == path).unwrap()
    }

    #[test]
    fn test_assemble_precedence() {
        let harvested = ReconciledVars {
            workgroup: Some("HARVEST".to_string()),
            home_template: Some("/home/%U".to_string()),
            idmap_range_low: Some(30000),
            ..Default::default()
        };
        let vars = VariablesFile::parse("HOME_TEMPLATE=/data/home/%U\n").unwrap();
        let backend = BackendKind::Samba.backend().unwrap();
        let synth =
            SynthesisVars::assemble(backend, "lab.example.com", "LAB.EXAMPLE.COM", &harvested, &vars)
                .unwrap();
        assert_eq!(synth.workgroup, "HARVEST");
        assert_eq!(synth.home_template, "/data/home/%U");
        assert_eq!(synth.idmap_range_low, 30000);
        assert_eq!(synth.pam_service, "rstudio");

        let synth = SynthesisVars::assemble(
            backend,
            "averyveryverylongdomainname.example.com",
            "AVERYVERYVERYLONGDOMAINNAME.EXAMPLE.COM",
            &ReconciledVars::default(),
            &VariablesFile::empty(),
        )
        .unwrap();
        assert_eq!(synth.workgroup, "AVERYVERYVERYLO");
        assert_eq!(synth.home_template, "/home/%U");

        let bad = VariablesFile::parse("IDMAP_RANGE_LOW=50000\nIDMAP_RANGE_HIGH=40000\n").unwrap();
        assert!(SynthesisVars::assemble(
            backend,
            "lab.example.com",
            "LAB.EXAMPLE.COM",
            &ReconciledVars::default(),
            &bad
        )
        .is_err());
    }

    #[test]
    fn test_samba_range_must_clear_default_range() {
        let low = VariablesFile::parse("IDMAP_RANGE_LOW=5000
").unwrap();
        let err = SynthesisVars::assemble(
            BackendKind::Samba.backend().unwrap(),
            "lab.example.com",
            "LAB.EXAMPLE.COM",
            &ReconciledVars::default(),
            &low,
        )
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::ConfigMissing);
        assert!(err.to_string().contains("3000-7999"));

        let edge = VariablesFile::parse("IDMAP_RANGE_LOW=8000
").unwrap();
        assert!(SynthesisVars::assemble(
            BackendKind::Samba.backend().unwrap(),
            "lab.example.com",
            "LAB.EXAMPLE.COM",
            &ReconciledVars::default(),
            &edge,
        )
        .is_ok());
        // SSSD has no fallback domain to collide with.
        assert!(SynthesisVars::assemble(
            BackendKind::Sssd.backend().unwrap(),
            "lab.example.com",
            "LAB.EXAMPLE.COM",
            &ReconciledVars::default(),
            &low,
        )
        .is_ok());
    }

    #[test]
    fn test_sssd_files() {
        let dir = TempDir::new().unwrap();
        staged_host(&dir);
        let runner = FakeRunner::new();
        let host = Host::new(dir.path(), &runner);
        let vars = vars_for(
            BackendKind::Sssd,
            "ALLOWED_GROUPS=rstudio-users,Domain Admins\nKRB5_REALMS=PARTNER.ORG:kdc.partner.org\n",
        );
        let configs = synthesize(BackendKind::Sssd.backend().unwrap(), &host, &vars).unwrap();

        let sssd = find(&configs, SSSD_CONF);
        assert_eq!(sssd.mode, 0o600);
        assert!(sssd.contents.contains("[domain/research.example.com]"));
        assert!(sssd.contents.contains("access_provider = simple"));
        assert!(sssd
            .contents
            .contains("simple_allow_groups = rstudio-users, Domain Admins"));
        assert!(!sssd.contents.contains("{{"));

        let krb5 = &find(&configs, KRB5_CONF).contents;
        assert!(krb5.contains("default_realm = RESEARCH.EXAMPLE.COM"));
        assert!(krb5.contains("PARTNER.ORG = {"));
        assert!(krb5.contains(".partner.org = PARTNER.ORG"));

        let nss = NsswitchConf::parse(&find(&configs, NSSWITCH_CONF).contents);
        assert_eq!(
            nss.sources("passwd").unwrap(),
            &["files".to_string(), "systemd".to_string(), "sss".to_string()]
        );
        assert!(nss.has_source("group", "sss"));
        assert!(nss.has_source("netgroup", "sss"));

        let auth = PamStack::parse(&find(&configs, PAM_COMMON_AUTH).contents);
        let modules: Vec<_> = auth.rules().map(|r| r.module.as_str()).collect();
        assert_eq!(modules, vec!["pam_sss.so", "pam_unix.so", "pam_deny.so", "pam_permit.so"]);

        let session = PamStack::parse(&find(&configs, PAM_COMMON_SESSION).contents);
        let modules: Vec<_> = session.rules().map(|r| r.module.as_str()).collect();
        assert_eq!(
            modules,
            vec!["pam_permit.so", "pam_unix.so", "pam_mkhomedir.so", "pam_sss.so"]
        );

        let stanza = find(&configs, "/etc/pam.d/rstudio");
        assert!(stanza.contents.contains("@include common-auth"));
        // Stacks that do not exist on the host are left alone.
        assert!(!configs.iter().any(|c| c.path.ends_with("common-account")));
    }

    #[test]
    fn test_samba_files_replace_sssd_wiring() {
        let dir = TempDir::new().unwrap();
        staged_host(&dir);
        stage(
            &dir,
            PAM_COMMON_AUTH,
            "auth\tsufficient\tpam_sss.so forward_pass\nauth\t[success=1 default=ignore]\tpam_unix.so nullok\n",
        );
        let runner = FakeRunner::new();
        let host = Host::new(dir.path(), &runner);
        let vars = vars_for(BackendKind::Samba, "ALLOWED_GROUPS=rstudio-users\n");
        let configs = synthesize(BackendKind::Samba.backend().unwrap(), &host, &vars).unwrap();

        let smb = &find(&configs, SMB_CONF).contents;
        assert!(smb.contains("workgroup = RESEARCH"));
        assert!(smb.contains("idmap config RESEARCH : range = 10000-999999"));
        assert!(smb.contains("idmap config * : range = 3000-7999"));
        assert!(find(&configs, PAM_WINBIND_CONF)
            .contents
            .contains("require_membership_of = rstudio-users"));

        let nss = NsswitchConf::parse(&find(&configs, NSSWITCH_CONF).contents);
        assert!(!nss.has_source("passwd", "sss"));
        assert!(nss.has_source("passwd", "winbind"));
        assert!(!nss.has_source("shadow", "winbind"));

        let auth = PamStack::parse(&find(&configs, PAM_COMMON_AUTH).contents);
        assert!(!auth.references("pam_sss.so"));
        assert!(auth.references("pam_winbind.so"));
    }

    #[test]
    fn test_deploy_is_idempotent() {
        let dir = TempDir::new().unwrap();
        staged_host(&dir);
        let runner = FakeRunner::new();
        let host = Host::new(dir.path(), &runner);
        let backend = BackendKind::Sssd.backend().unwrap();
        let vars = vars_for(BackendKind::Sssd, "");
        let mut ledger = BackupLedger::open_session(&host, Path::new("/var/backups")).unwrap();

        let first = deploy(&mut ledger, &synthesize(backend, &host, &vars).unwrap()).unwrap();
        assert!(first.written.contains(&SSSD_CONF.to_string()));
        assert!(first.unchanged.is_empty());

        let second = deploy(&mut ledger, &synthesize(backend, &host, &vars).unwrap()).unwrap();
        assert!(second.written.is_empty());
        assert_eq!(second.unchanged.len(), first.written.len());
    }

    #[test]
    fn test_failed_deploy_rolls_back() {
        let dir = TempDir::new().unwrap();
        staged_host(&dir);
        // A file where a directory is expected makes the second write fail.
        stage(&dir, "/etc/blocked", "");
        let runner = FakeRunner::new();
        let host = Host::new(dir.path(), &runner);
        let mut ledger = BackupLedger::open_session(&host, Path::new("/var/backups")).unwrap();

        let configs = vec![
            RenderedConfig::new(NSSWITCH_CONF, "passwd: files sss\n".to_string(), 0o644),
            RenderedConfig::new("/etc/sssd/sssd.conf", "[sssd]\n".to_string(), 0o600),
            RenderedConfig::new("/etc/blocked/krb5.conf", "x".to_string(), 0o644),
        ];
        let err = deploy(&mut ledger, &configs).unwrap_err();
        assert_eq!(err.kind(), crate::error::FailureKind::SynthesisWriteFailed);
        assert_eq!(
            fs::read_to_string(dir.path().join("etc/nsswitch.conf")).unwrap(),
            NSSWITCH
        );
        assert!(!host.is_file(SSSD_CONF));
    }
}
