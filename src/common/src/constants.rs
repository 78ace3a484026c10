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
pub const DEFAULT_VARS_PATH: &str = "/etc/r_env_manager/auth.vars.conf";
pub const SSSD_DEFAULTS_PATH: &str = "/etc/r_env_manager/sssd.defaults.conf";
pub const SAMBA_DEFAULTS_PATH: &str = "/etc/r_env_manager/samba.defaults.conf";
pub const DEFAULT_BACKUP_DIR: &str = "/var/backups/r_env_manager";
pub const DEFAULT_STATE_DIR: &str = "/var/lib/r_env_manager";
pub const BACKEND_MARKER_FILE: &str = "auth_backend";
pub const LEDGER_INDEX_FILE: &str = "ledger.jsonl";
pub const DIAGNOSTICS_FILE: &str = "diagnostics.json";
pub const BACKUP_SESSION_PREFIX: &str = "backup_";
pub const DEFAULT_BACKUP_RETENTION: usize = 5;

pub const SSSD_CONF: &str = "/etc/sssd/sssd.conf";
pub const SMB_CONF: &str = "/etc/samba/smb.conf";
pub const KRB5_CONF: &str = "/etc/krb5.conf";
pub const KRB5_KEYTAB: &str = "/etc/krb5.keytab";
pub const NSSWITCH_CONF: &str = "/etc/nsswitch.conf";
pub const RESOLV_CONF: &str = "/etc/resolv.conf";
pub const PAM_WINBIND_CONF: &str = "/etc/security/pam_winbind.conf";
pub const PAM_DIR: &str = "/etc/pam.d";
pub const PAM_COMMON_AUTH: &str = "/etc/pam.d/common-auth";
pub const PAM_COMMON_ACCOUNT: &str = "/etc/pam.d/common-account";
pub const PAM_COMMON_SESSION: &str = "/etc/pam.d/common-session";
pub const PAM_COMMON_PASSWORD: &str = "/etc/pam.d/common-password";
// Red Hat style stacks, only consulted during detection.
pub const PAM_SYSTEM_AUTH: &str = "/etc/pam.d/system-auth";
pub const PAM_PASSWORD_AUTH: &str = "/etc/pam.d/password-auth";
pub const OS_RELEASE: &str = "/etc/os-release";
pub const REALMD_CACHE_DIR: &str = "/var/lib/realmd";
pub const REALMD_SERVICE: &str = "realmd";

pub const DEFAULT_PAM_SERVICE: &str = "rstudio";
pub const DEFAULT_SSSD_HOME_TEMPLATE: &str = "/home/%u@%d";
pub const DEFAULT_SAMBA_HOME_TEMPLATE: &str = "/home/%U";
pub const DEFAULT_IDMAP_RANGE_LOW: u32 = 10000;
pub const DEFAULT_IDMAP_RANGE_HIGH: u32 = 999999;
/// winbind's `*` domain; the domain range must sit above it.
pub const IDMAP_FALLBACK_RANGE_LOW: u32 = 3000;
pub const IDMAP_FALLBACK_RANGE_HIGH: u32 = 7999;
pub const DEFAULT_OS_NAME: &str = "Linux";
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: f64 = 300.0;
pub const DEFAULT_DNS_RETRIES: u32 = 3;
pub const DEFAULT_JOURNAL_LINES: u32 = 50;
pub const NETBIOS_NAME_MAX: usize = 15;

// Paths captured by a full snapshot backup.
pub const SNAPSHOT_TARGETS: &[&str] = &[
    "/etc/nginx/sites-available",
    "/etc/nginx/nginx.conf",
    "/etc/rstudio/rserver.conf",
    "/etc/rstudio/rsession.conf",
    "/etc/R/Rprofile.site",
    "/etc/sssd/sssd.conf",
    "/etc/samba/smb.conf",
    "/etc/krb5.conf",
    "/etc/nsswitch.conf",
    "/etc/pam.d",
];
