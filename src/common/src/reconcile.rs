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
use crate::config::{new_ini, split_list, VariablesFile};
use crate::constants::{DEFAULT_OS_NAME, OS_RELEASE, SMB_CONF, SSSD_CONF};
use crate::error::AuthError;
use crate::host::Host;
use crate::prompt::Prompter;
use configparser::ini::Ini;
use os_release::OsRelease;
use serde::Serialize;

/// Identity variables harvested from a backend's configuration. Every field
/// is optional: a missing or unreadable file is simply no data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconciledVars {
    pub domain: Option<String>,
    pub realm: Option<String>,
    pub workgroup: Option<String>,
    pub home_template: Option<String>,
    pub allowed_groups: Vec<String>,
    pub idmap_range_low: Option<u32>,
}

fn fill<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(other);
    }
}

impl ReconciledVars {
    pub fn is_empty(&self) -> bool {
        *self == ReconciledVars::default()
    }

    /// First non-empty wins: only fields still empty are taken from `other`.
    pub fn fill_from(&mut self, other: &ReconciledVars) {
        fill(&mut self.domain, &other.domain);
        fill(&mut self.realm, &other.realm);
        fill(&mut self.workgroup, &other.workgroup);
        fill(&mut self.home_template, &other.home_template);
        fill(&mut self.idmap_range_low, &other.idmap_range_low);
        if self.allowed_groups.is_empty() {
            self.allowed_groups.clone_from(&other.allowed_groups);
        }
    }

    /// Values from a backend defaults file, which uses the variables format.
    pub fn from_defaults(vars: &VariablesFile) -> Self {
        ReconciledVars {
            domain: vars.get_domain_lower(),
            realm: vars.get_domain_upper(),
            workgroup: vars.get_workgroup(),
            home_template: vars.get_home_template(),
            allowed_groups: vars.get_allowed_groups(),
            idmap_range_low: vars.get_idmap_range_low(),
        }
    }
}

fn read_ini(contents: &str) -> Option<Ini> {
    let mut ini = new_ini();
    match ini.read(contents.to_string()) {
        Ok(_) => Some(ini),
        Err(e) => {
            debug!("Ignoring unparsable backend configuration: {}", e);
            None
        }
    }
}

fn value(ini: &Ini, section: &str, key: &str) -> Option<String> {
    ini.get(section, key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Harvests `sssd.conf`: the first configured domain section supplies the
/// domain, realm, home template, allowed groups and id range.
pub fn parse_sssd_conf(contents: &str) -> ReconciledVars {
    let ini = match read_ini(contents) {
        Some(ini) => ini,
        None => return ReconciledVars::default(),
    };

    let mut sections: Vec<String> = ini
        .sections()
        .into_iter()
        .filter(|s| s.starts_with("domain/"))
        .collect();
    sections.sort();
    let section = value(&ini, "sssd", "domains")
        .and_then(|d| split_list(&d).into_iter().next())
        .map(|d| format!("domain/{}", d.to_lowercase()))
        .filter(|s| sections.contains(s))
        .or_else(|| sections.into_iter().next());
    let section = match section {
        Some(s) => s,
        None => return ReconciledVars::default(),
    };

    let domain = value(&ini, &section, "ad_domain")
        .or_else(|| section.strip_prefix("domain/").map(str::to_string))
        .map(|d| d.to_lowercase());
    let realm = value(&ini, &section, "krb5_realm")
        .map(|r| r.to_uppercase())
        .or_else(|| domain.as_ref().map(|d| d.to_uppercase()));
    ReconciledVars {
        domain,
        realm,
        workgroup: None,
        home_template: value(&ini, &section, "fallback_homedir")
            .or_else(|| value(&ini, &section, "override_homedir")),
        allowed_groups: value(&ini, &section, "simple_allow_groups")
            .map(|g| split_list(&g))
            .unwrap_or_default(),
        idmap_range_low: value(&ini, &section, "ldap_idmap_range_min")
            .and_then(|v| v.parse().ok()),
    }
}

fn range_low(range: &str) -> Option<u32> {
    range.split('-').next().and_then(|l| l.trim().parse().ok())
}

/// Harvests the `[global]` section of `smb.conf`. The id range of the
/// workgroup's own idmap configuration is preferred over the `*` default.
pub fn parse_smb_conf(contents: &str) -> ReconciledVars {
    let ini = match read_ini(contents) {
        Some(ini) => ini,
        None => return ReconciledVars::default(),
    };

    let realm = value(&ini, "global", "realm").map(|r| r.to_uppercase());
    let workgroup = value(&ini, "global", "workgroup").map(|w| w.to_uppercase());

    let mut own_range = None;
    let mut default_range = None;
    if let Some(global) = ini.get_map_ref().get("global") {
        for (key, val) in global {
            let key = key.split_whitespace().collect::<Vec<_>>().join(" ");
            let idmap_domain = match key
                .strip_prefix("idmap config ")
                .and_then(|k| k.strip_suffix(" : range"))
            {
                Some(d) => d,
                None => continue,
            };
            let low = val.as_deref().and_then(range_low);
            if idmap_domain == "*" {
                default_range = low;
            } else if workgroup
                .as_ref()
                .map(|w| w.eq_ignore_ascii_case(idmap_domain))
                .unwrap_or(true)
            {
                own_range = low;
            }
        }
    }

    ReconciledVars {
        domain: realm.as_ref().map(|r| r.to_lowercase()),
        realm,
        workgroup,
        home_template: value(&ini, "global", "template homedir"),
        allowed_groups: vec![],
        idmap_range_low: own_range.or(default_range),
    }
}

fn layered(
    host: &Host,
    config_file: &str,
    parse: fn(&str) -> ReconciledVars,
    defaults_file: &str,
) -> ReconciledVars {
    let mut vars = host
        .read(config_file)
        .map(|c| parse(&c))
        .unwrap_or_default();
    if let Some(contents) = host.read(defaults_file) {
        match VariablesFile::parse(&contents) {
            Ok(defaults) => vars.fill_from(&ReconciledVars::from_defaults(&defaults)),
            Err(e) => debug!("Ignoring unparsable defaults file {}: {}", defaults_file, e),
        }
    }
    vars
}

pub fn reconcile_sssd(host: &Host) -> ReconciledVars {
    layered(
        host,
        SSSD_CONF,
        parse_sssd_conf,
        crate::constants::SSSD_DEFAULTS_PATH,
    )
}

pub fn reconcile_samba(host: &Host) -> ReconciledVars {
    layered(
        host,
        SMB_CONF,
        parse_smb_conf,
        crate::constants::SAMBA_DEFAULTS_PATH,
    )
}

/// Harvests variables for `kind`. `NONE` has nothing to harvest; the
/// caller collects parameters from the operator instead.
pub fn reconcile(host: &Host, kind: BackendKind) -> ReconciledVars {
    let vars = match kind.backend() {
        Some(backend) => backend.reconcile(host),
        None => ReconciledVars::default(),
    };
    debug!(?vars, "Reconciled {} variables", kind);
    vars
}

/// Everything `realm join` needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinParameters {
    pub domain_lower: String,
    pub domain_upper: String,
    pub admin_principal: String,
    pub computer_ou: Option<String>,
    pub os_name: String,
    pub membership_software: String,
    pub client_software: String,
}

impl JoinParameters {
    /// The admin user without any realm suffix, as `realm join --user` wants it.
    pub fn admin_user(&self) -> &str {
        match self.admin_principal.split_once('@') {
            Some((user, _)) => user,
            None => &self.admin_principal,
        }
    }

    /// The fully qualified principal for ticket acquisition.
    pub fn principal(&self) -> String {
        format!("{}@{}", self.admin_user(), self.domain_upper)
    }
}

/// Join parameters while they are still being collected. Sources are merged
/// in precedence order: operator, harvested, fallback defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialJoinParameters {
    pub domain_lower: Option<String>,
    pub domain_upper: Option<String>,
    pub admin_principal: Option<String>,
    pub computer_ou: Option<String>,
    pub os_name: Option<String>,
}

impl PartialJoinParameters {
    pub fn from_operator(vars: &VariablesFile) -> Self {
        PartialJoinParameters {
            domain_lower: vars.get_domain_lower(),
            domain_upper: vars.get_domain_upper(),
            admin_principal: vars.get_admin_principal(),
            computer_ou: vars.get_computer_ou(),
            os_name: vars.get_os_name(),
        }
    }

    pub fn merge_harvested(&mut self, harvested: &ReconciledVars) {
        fill(&mut self.domain_lower, &harvested.domain);
        fill(&mut self.domain_upper, &harvested.realm);
        self.derive_domain_forms();
    }

    // A single-realm host's domain and realm differ only in case.
    fn derive_domain_forms(&mut self) {
        if self.domain_upper.is_none() {
            self.domain_upper = self.domain_lower.as_ref().map(|d| d.to_uppercase());
        }
        if self.domain_lower.is_none() {
            self.domain_lower = self.domain_upper.as_ref().map(|d| d.to_lowercase());
        }
    }

    /// Variables-file names of the required fields that are still empty.
    pub fn missing(&self) -> Vec<&'static str> {
        let mut missing = vec![];
        if self.domain_lower.is_none() {
            missing.push("AD_DOMAIN_LOWER");
        }
        if self.domain_upper.is_none() {
            missing.push("AD_DOMAIN_UPPER");
        }
        if self.admin_principal.is_none() {
            missing.push("AD_ADMIN_USER");
        }
        missing
    }

    /// Asks the operator for whatever is still empty. On a host with no
    /// prior configuration this collects the whole parameter set.
    pub fn prompt_missing(&mut self, prompter: &mut dyn Prompter) -> Result<(), AuthError> {
        if self.missing().is_empty() {
            return Ok(());
        }
        if self.domain_lower.is_none() {
            let domain = prompter.ask("AD domain (e.g. example.com)", None)?;
            self.domain_lower = Some(domain.trim().to_lowercase());
        }
        if self.domain_upper.is_none() {
            let default = self.domain_lower.as_ref().map(|d| d.to_uppercase());
            let realm = prompter.ask("Kerberos realm", default.as_deref())?;
            self.domain_upper = Some(realm.trim().to_uppercase());
        }
        if self.admin_principal.is_none() {
            let admin = prompter.ask("Domain administrator", None)?;
            self.admin_principal = Some(admin.trim().to_string());
        }
        if self.computer_ou.is_none() {
            let ou = prompter.ask("Computer OU (empty for the default)", Some(""))?;
            self.computer_ou = Some(ou.trim().to_string()).filter(|o| !o.is_empty());
        }
        Ok(())
    }

    /// Applies the fallback defaults and checks that nothing required is
    /// still empty.
    pub fn finish(
        mut self,
        host: &Host,
        backend: &dyn IdentityBackend,
    ) -> Result<JoinParameters, AuthError> {
        self.derive_domain_forms();
        let missing = self.missing();
        let (domain_lower, domain_upper, admin_principal) =
            match (self.domain_lower, self.domain_upper, self.admin_principal) {
                (Some(l), Some(u), Some(a))
                    if !l.is_empty() && !u.is_empty() && !a.is_empty() =>
                {
                    (l, u, a)
                }
                _ => {
                    return Err(AuthError::ReconciliationIncomplete {
                        fields: if missing.is_empty() {
                            vec!["AD_DOMAIN_LOWER", "AD_ADMIN_USER"]
                        } else {
                            missing
                        },
                    })
                }
            };

        let os_name = self.os_name.unwrap_or_else(|| {
            match OsRelease::new_from(host.path(OS_RELEASE)) {
                Ok(release) if !release.name.is_empty() => release.name,
                Ok(_) => DEFAULT_OS_NAME.to_string(),
                Err(e) => {
                    debug!("Unable to read os-release: {}", e);
                    DEFAULT_OS_NAME.to_string()
                }
            }
        });

        Ok(JoinParameters {
            domain_lower,
            domain_upper,
            admin_principal,
            computer_ou: self.computer_ou,
            os_name,
            membership_software: backend.membership_software().to_string(),
            client_software: backend.client_software().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{SAMBA_DEFAULTS_PATH, SSSD_DEFAULTS_PATH};
    use crate::detect::detect;
    use crate::prompt::scripted::ScriptedPrompter;
    use crate::runner::fake::FakeRunner;
    use std::fs;
    use tempfile::TempDir;

    const SSSD: &str = "[sssd]
domains = corp.example.com
services = nss, pam

[domain/corp.example.com]
id_provider = ad
krb5_realm = CORP.EXAMPLE.COM
fallback_homedir = /home/%u@%d
access_provider = simple
simple_allow_groups = rstudio-users, Domain Admins
";

    const SMB: &str = "[global]
   workgroup = EXAMPLE
   realm = example.com
   template homedir = /home/%U
   idmap config * : range = 3000-7999
   idmap config EXAMPLE : range = 20000-999999
";

    fn stage(dir: &TempDir, path: &str, contents: &str) {
        let full = dir.path().join(path.trim_start_matches('/'));
        fs::create_dir_all(full.parent().unwrap()).unwrap();
        fs::write(full, contents).unwrap();
    }

    #[test]
    fn test_parse_sssd_conf() {
        let vars = parse_sssd_conf(SSSD);
        assert_eq!(vars.domain.as_deref(), Some("corp.example.com"));
        assert_eq!(vars.realm.as_deref(), Some("CORP.EXAMPLE.COM"));
        assert_eq!(vars.home_template.as_deref(), Some("/home/%u@%d"));
        assert_eq!(vars.allowed_groups, vec!["rstudio-users", "Domain Admins"]);
        assert_eq!(vars.idmap_range_low, None);
    }

    #[test]
    fn test_parse_smb_conf() {
        let vars = parse_smb_conf(SMB);
        assert_eq!(vars.realm.as_deref(), Some("EXAMPLE.COM"));
        assert_eq!(vars.domain.as_deref(), Some("example.com"));
        assert_eq!(vars.workgroup.as_deref(), Some("EXAMPLE"));
        assert_eq!(vars.home_template.as_deref(), Some("/home/%U"));
        assert_eq!(vars.idmap_range_low, Some(20000));

        let vars = parse_smb_conf("[global]\nidmap config * : range = 3000-7999\n");
        assert_eq!(vars.idmap_range_low, Some(3000));
        assert!(parse_smb_conf("").is_empty());
    }

    #[test]
    fn test_defaults_only_fill_empty_fields() {
        let dir = TempDir::new().unwrap();
        stage(&dir, SSSD_CONF, SSSD);
        stage(
            &dir,
            SSSD_DEFAULTS_PATH,
            "AD_DOMAIN_LOWER=other.example.com\nHOME_TEMPLATE=/srv/home/%u\nIDMAP_RANGE_LOW=50000\n",
        );
        let runner = FakeRunner::new();
        let host = Host::new(dir.path(), &runner);

        let first = reconcile(&host, BackendKind::Sssd);
        assert_eq!(first.domain.as_deref(), Some("corp.example.com"));
        assert_eq!(first.home_template.as_deref(), Some("/home/%u@%d"));
        assert_eq!(first.idmap_range_low, Some(50000));

        let second = reconcile(&host, BackendKind::Sssd);
        assert_eq!(first, second);

        let mut again = first.clone();
        again.fill_from(&first);
        assert_eq!(again, first);
    }

    #[test]
    fn test_missing_files_are_no_data() {
        let dir = TempDir::new().unwrap();
        stage(&dir, SAMBA_DEFAULTS_PATH, "WORKGROUP=corp\n");
        let runner = FakeRunner::new();
        let host = Host::new(dir.path(), &runner);
        let vars = reconcile(&host, BackendKind::Samba);
        assert_eq!(vars.workgroup.as_deref(), Some("CORP"));
        assert_eq!(vars.realm, None);
        assert!(reconcile(&host, BackendKind::None).is_empty());
    }

    #[test]
    fn test_active_winbind_yields_realm() {
        let dir = TempDir::new().unwrap();
        stage(&dir, SMB_CONF, SMB);
        stage(&dir, OS_RELEASE, "NAME=\"Ubuntu\"\nVERSION_ID=\"24.04\"\n");
        let runner = FakeRunner::new();
        runner.on("systemctl is-active --quiet winbind", 0, "");
        let host = Host::new(dir.path(), &runner);

        let kind = detect(&host);
        assert_eq!(kind, BackendKind::Samba);

        let vars = VariablesFile::parse("AD_ADMIN_USER=administrator\n").unwrap();
        let mut partial = PartialJoinParameters::from_operator(&vars);
        partial.merge_harvested(&reconcile(&host, kind));
        let params = partial
            .finish(&host, kind.backend().unwrap())
            .unwrap();
        assert_eq!(params.domain_upper, "EXAMPLE.COM");
        assert_eq!(params.domain_lower, "example.com");
        assert_eq!(params.principal(), "administrator@EXAMPLE.COM");
        assert_eq!(params.os_name, "Ubuntu");
        assert_eq!(params.membership_software, "samba");
        assert_eq!(params.client_software, "winbind");
    }

    #[test]
    fn test_operator_values_win() {
        let vars = VariablesFile::parse(
            "AD_DOMAIN_LOWER=lab.example.com\nAD_ADMIN_USER=joiner@LAB.EXAMPLE.COM\n",
        )
        .unwrap();
        let mut partial = PartialJoinParameters::from_operator(&vars);
        partial.merge_harvested(&parse_smb_conf(SMB));
        assert_eq!(partial.domain_lower.as_deref(), Some("lab.example.com"));
        assert_eq!(partial.domain_upper.as_deref(), Some("EXAMPLE.COM"));
    }

    #[test]
    fn test_nothing_found_prompts_for_everything() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let host = Host::new(dir.path(), &runner);
        assert_eq!(detect(&host), BackendKind::None);

        let mut partial = PartialJoinParameters::from_operator(&VariablesFile::empty());
        partial.merge_harvested(&reconcile(&host, BackendKind::None));
        assert_eq!(
            partial.missing(),
            vec!["AD_DOMAIN_LOWER", "AD_DOMAIN_UPPER", "AD_ADMIN_USER"]
        );

        let mut prompter = ScriptedPrompter::new()
            .answer("Example.com")
            .answer("")
            .answer("administrator")
            .answer("OU=Linux,DC=example,DC=com");
        partial.prompt_missing(&mut prompter).unwrap();
        assert_eq!(prompter.asked.len(), 4);
        assert!(partial.missing().is_empty());

        let params = partial
            .finish(&host, BackendKind::Sssd.backend().unwrap())
            .unwrap();
        assert_eq!(params.domain_lower, "example.com");
        assert_eq!(params.domain_upper, "EXAMPLE.COM");
        assert_eq!(params.computer_ou.as_deref(), Some("OU=Linux,DC=example,DC=com"));
        assert_eq!(params.os_name, DEFAULT_OS_NAME);
        assert_eq!(params.membership_software, "adcli");
    }

    #[test]
    fn test_incomplete_parameters_are_fatal() {
        let dir = TempDir::new().unwrap();
        let runner = FakeRunner::new();
        let host = Host::new(dir.path(), &runner);
        let vars = VariablesFile::parse("AD_DOMAIN_LOWER=example.com\n").unwrap();
        let err = PartialJoinParameters::from_operator(&vars)
            .finish(&host, BackendKind::Sssd.backend().unwrap())
            .unwrap_err();
        match err {
            AuthError::ReconciliationIncomplete { fields } => {
                assert_eq!(fields, vec!["AD_ADMIN_USER"])
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
