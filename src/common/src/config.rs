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
use crate::constants::{
    DEFAULT_BACKUP_DIR, DEFAULT_DNS_RETRIES, DEFAULT_JOURNAL_LINES, DEFAULT_MAX_CLOCK_SKEW_SECS,
    DEFAULT_PAM_SERVICE, DEFAULT_STATE_DIR,
};
use crate::error::AuthError;
use crate::krb5::RealmEntry;
use configparser::ini::Ini;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

// Shell-style variable files have no section header; configparser files
// such keys under its default section.
const SECTION: &str = "default";

/// configparser that splits on `=` only. smb.conf keys such as
/// `idmap config * : range` contain colons.
pub(crate) fn new_ini() -> Ini {
    let mut defaults = Ini::new().defaults();
    defaults.delimiters = vec!['='];
    Ini::new_from_defaults(defaults)
}

fn unquote(val: &str) -> &str {
    let val = val.trim();
    for q in ['"', '\''] {
        if val.len() >= 2 && val.starts_with(q) && val.ends_with(q) {
            return &val[1..val.len() - 1];
        }
    }
    val
}

pub(crate) fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// The operator's variables file: `KEY=value` lines, keys case insensitive.
#[derive(Clone)]
pub struct VariablesFile {
    config: Ini,
    filename: Option<PathBuf>,
}

impl VariablesFile {
    pub fn load(path: &Path) -> Result<VariablesFile, AuthError> {
        if !path.is_file() {
            return Err(AuthError::ConfigMissing(path.to_path_buf()));
        }
        let contents = std::fs::read_to_string(path).map_err(|e| AuthError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let mut vars = VariablesFile::parse(&contents).map_err(|reason| {
            AuthError::ConfigInvalid {
                path: path.to_path_buf(),
                reason,
            }
        })?;
        vars.filename = Some(path.to_path_buf());
        debug!("Loaded variables from {}", path.display());
        Ok(vars)
    }

    pub fn parse(contents: &str) -> Result<VariablesFile, String> {
        let mut config = new_ini();
        config.read(contents.to_string())?;
        Ok(VariablesFile {
            config,
            filename: None,
        })
    }

    pub fn empty() -> VariablesFile {
        VariablesFile {
            config: new_ini(),
            filename: None,
        }
    }

    pub fn filename(&self) -> Option<&Path> {
        self.filename.as_deref()
    }

    /// A trimmed, unquoted, non-empty value.
    pub fn get(&self, key: &str) -> Option<String> {
        self.config
            .get(SECTION, key)
            .map(|v| unquote(&v).to_string())
            .filter(|v| !v.is_empty())
    }

    fn get_parsed<T: FromStr>(&self, key: &str, default: T) -> T {
        match self.get(key) {
            Some(val) => match val.parse::<T>() {
                Ok(n) => n,
                Err(_) => {
                    error!("Failed parsing {} from variables: {}", key, val);
                    default
                }
            },
            None => default,
        }
    }

    pub fn get_domain_lower(&self) -> Option<String> {
        self.get("AD_DOMAIN_LOWER").map(|v| v.to_lowercase())
    }

    pub fn get_domain_upper(&self) -> Option<String> {
        self.get("AD_DOMAIN_UPPER").map(|v| v.to_uppercase())
    }

    pub fn get_admin_principal(&self) -> Option<String> {
        self.get("AD_ADMIN_USER")
    }

    pub fn get_computer_ou(&self) -> Option<String> {
        self.get("COMPUTER_OU")
    }

    pub fn get_os_name(&self) -> Option<String> {
        self.get("OS_NAME")
    }

    pub fn get_home_template(&self) -> Option<String> {
        self.get("HOME_TEMPLATE")
    }

    pub fn get_allowed_groups(&self) -> Vec<String> {
        match self.get("ALLOWED_GROUPS") {
            Some(val) => split_list(&val),
            None => vec![],
        }
    }

    pub fn get_workgroup(&self) -> Option<String> {
        self.get("WORKGROUP").map(|v| v.to_uppercase())
    }

    pub fn get_idmap_range_low(&self) -> Option<u32> {
        let val = self.get("IDMAP_RANGE_LOW")?;
        match val.parse::<u32>() {
            Ok(n) => Some(n),
            Err(_) => {
                error!("Failed parsing IDMAP_RANGE_LOW from variables: {}", val);
                None
            }
        }
    }

    pub fn get_idmap_range_high(&self) -> Option<u32> {
        let val = self.get("IDMAP_RANGE_HIGH")?;
        match val.parse::<u32>() {
            Ok(n) => Some(n),
            Err(_) => {
                error!("Failed parsing IDMAP_RANGE_HIGH from variables: {}", val);
                None
            }
        }
    }

    /// The explicit backend override, if the operator declared one.
    pub fn get_backend(&self) -> Option<BackendKind> {
        let val = self.get("AUTH_BACKEND")?;
        match val.parse::<BackendKind>() {
            Ok(BackendKind::None) => None,
            Ok(kind) => Some(kind),
            Err(e) => {
                error!("{}", e);
                None
            }
        }
    }

    pub fn get_krb5_realms(&self) -> Vec<RealmEntry> {
        match self.get("KRB5_REALMS") {
            Some(val) => split_list(&val)
                .iter()
                .filter_map(|spec| {
                    let entry = RealmEntry::parse(spec);
                    if entry.is_none() {
                        error!("Invalid KRB5_REALMS entry '{}'", spec);
                    }
                    entry
                })
                .collect(),
            None => vec![],
        }
    }

    pub fn get_backup_dir(&self) -> PathBuf {
        PathBuf::from(
            self.get("BACKUP_DIR")
                .unwrap_or_else(|| DEFAULT_BACKUP_DIR.to_string()),
        )
    }

    pub fn get_state_dir(&self) -> String {
        self.get("STATE_DIR")
            .unwrap_or_else(|| DEFAULT_STATE_DIR.to_string())
    }

    pub fn get_pam_service(&self) -> String {
        self.get("PAM_SERVICE")
            .unwrap_or_else(|| DEFAULT_PAM_SERVICE.to_string())
    }

    pub fn get_journal_lines(&self) -> u32 {
        self.get_parsed("JOURNAL_LINES", DEFAULT_JOURNAL_LINES)
    }

    pub fn get_dns_retries(&self) -> u32 {
        self.get_parsed("DNS_RETRIES", DEFAULT_DNS_RETRIES).max(1)
    }

    pub fn get_max_clock_skew(&self) -> f64 {
        self.get_parsed("MAX_CLOCK_SKEW_SECS", DEFAULT_MAX_CLOCK_SKEW_SECS)
    }
}

impl fmt::Debug for VariablesFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn vars(contents: &str) -> VariablesFile {
        VariablesFile::parse(contents).unwrap()
    }

    #[test]
    fn test_load_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = VariablesFile::load(&dir.path().join("auth.vars.conf")).unwrap_err();
        assert!(matches!(err, AuthError::ConfigMissing(_)));
    }

    #[test]
    fn test_load_records_filename() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("auth.vars.conf");
        std::fs::write(&path, "AD_DOMAIN_LOWER=example.com\n").unwrap();
        let v = VariablesFile::load(&path).unwrap();
        assert_eq!(v.filename(), Some(path.as_path()));
        assert_eq!(v.get_domain_lower(), Some("example.com".to_string()));
    }

    #[test]
    fn test_shell_quotes_and_case() {
        let v = vars(
            r#"
            # domain settings
            AD_DOMAIN_LOWER="Example.COM"
            AD_DOMAIN_UPPER='example.com'
            ad_admin_user = administrator
            COMPUTER_OU=""
            "#,
        );
        assert_eq!(v.get_domain_lower(), Some("example.com".to_string()));
        assert_eq!(v.get_domain_upper(), Some("EXAMPLE.COM".to_string()));
        assert_eq!(v.get_admin_principal(), Some("administrator".to_string()));
        assert_eq!(v.get_computer_ou(), None);
    }

    #[test]
    fn test_computer_ou_with_equals() {
        let v = vars("COMPUTER_OU=\"OU=Linux,OU=Servers,DC=example,DC=com\"\n");
        assert_eq!(
            v.get_computer_ou(),
            Some("OU=Linux,OU=Servers,DC=example,DC=com".to_string())
        );
    }

    #[test]
    fn test_allowed_groups() {
        let v = vars("ALLOWED_GROUPS=rstudio-users, research ,,admins\n");
        assert_eq!(
            v.get_allowed_groups(),
            vec!["rstudio-users", "research", "admins"]
        );
        assert!(vars("").get_allowed_groups().is_empty());
    }

    #[test]
    fn test_numeric_defaults() {
        let v = vars("JOURNAL_LINES=abc\nDNS_RETRIES=0\nIDMAP_RANGE_LOW=20000\n");
        assert_eq!(v.get_journal_lines(), DEFAULT_JOURNAL_LINES);
        assert_eq!(v.get_dns_retries(), 1);
        assert_eq!(v.get_idmap_range_low(), Some(20000));
        assert_eq!(v.get_idmap_range_high(), None);
        assert_eq!(v.get_max_clock_skew(), DEFAULT_MAX_CLOCK_SKEW_SECS);
    }

    #[test]
    fn test_backend_override() {
        assert_eq!(vars("AUTH_BACKEND=samba\n").get_backend(), Some(BackendKind::Samba));
        assert_eq!(vars("AUTH_BACKEND=SSSD\n").get_backend(), Some(BackendKind::Sssd));
        assert_eq!(vars("AUTH_BACKEND=ldap\n").get_backend(), None);
        assert_eq!(vars("AUTH_BACKEND=none\n").get_backend(), None);
    }

    #[test]
    fn test_krb5_realms() {
        let v = vars("KRB5_REALMS=PARTNER.ORG:kdc.partner.org, bogus\n");
        let realms = v.get_krb5_realms();
        assert_eq!(realms.len(), 1);
        assert_eq!(realms[0].realm, "PARTNER.ORG");
    }

    #[test]
    fn test_paths_default() {
        let v = vars("");
        assert_eq!(v.get_backup_dir(), PathBuf::from(DEFAULT_BACKUP_DIR));
        assert_eq!(v.get_state_dir(), DEFAULT_STATE_DIR);
        assert_eq!(v.get_pam_service(), DEFAULT_PAM_SERVICE);
    }
}
