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
use crate::error::AuthError;
use regex::{Captures, Regex};
use std::collections::{BTreeMap, BTreeSet};

pub const SSSD_CONF_TEMPLATE: &str = include_str!("../templates/sssd.conf.template");
pub const SMB_CONF_TEMPLATE: &str = include_str!("../templates/smb.conf.template");
pub const KRB5_CONF_TEMPLATE: &str = include_str!("../templates/krb5.conf.template");
pub const PAM_WINBIND_CONF_TEMPLATE: &str = include_str!("../templates/pam_winbind.conf.template");
pub const PAM_SERVICE_TEMPLATE: &str = include_str!("../templates/pam_service.template");

lazy_static! {
    static ref PLACEHOLDER_RE: Result<Regex, regex::Error> =
        Regex::new(r"\{\{\s*([A-Z0-9_]+)\s*\}\}");
}

fn placeholder_re(name: &str) -> Result<&'static Regex, AuthError> {
    PLACEHOLDER_RE.as_ref().map_err(|e| AuthError::Template {
        template: name.to_string(),
        reason: e.to_string(),
    })
}

/// Names of every `{{NAME}}` placeholder in `text`.
pub fn placeholders(text: &str) -> BTreeSet<String> {
    match PLACEHOLDER_RE.as_ref() {
        Ok(re) => re
            .captures_iter(text)
            .map(|caps| caps[1].to_string())
            .collect(),
        Err(_) => BTreeSet::new(),
    }
}

/// Substitutes `{{NAME}}` placeholders. Every placeholder must have a value;
/// the error names all of the missing ones at once. Values are inserted
/// verbatim and are not themselves expanded.
pub fn render(
    name: &str,
    text: &str,
    values: &BTreeMap<&str, String>,
) -> Result<String, AuthError> {
    let re = placeholder_re(name)?;
    let mut missing = BTreeSet::new();
    let rendered = re.replace_all(text, |caps: &Captures| match values.get(&caps[1]) {
        Some(value) => value.clone(),
        None => {
            missing.insert(caps[1].to_string());
            caps[0].to_string()
        }
    });
    if !missing.is_empty() {
        return Err(AuthError::Template {
            template: name.to_string(),
            reason: format!(
                "no value for {}",
                missing.into_iter().collect::<Vec<String>>().join(", ")
            ),
        });
    }
    Ok(rendered.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(pairs: &[(&'static str, &str)]) -> BTreeMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_render_substitutes_all() {
        let out = render(
            "t",
            "realm = {{DOMAIN_UPPER}}\nad_domain = {{ DOMAIN_LOWER }}\n",
            &values(&[("DOMAIN_UPPER", "EXAMPLE.COM"), ("DOMAIN_LOWER", "example.com")]),
        )
        .unwrap();
        assert_eq!(out, "realm = EXAMPLE.COM\nad_domain = example.com\n");
    }

    #[test]
    fn test_render_reports_every_missing_key() {
        let err = render("sssd.conf", "{{A}} {{B}} {{A}}", &values(&[])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to render sssd.conf: no value for A, B"
        );
    }

    #[test]
    fn test_pattern_is_compiled_once() {
        let first = placeholder_re("a").unwrap();
        let second = placeholder_re("b").unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_values_are_not_reexpanded() {
        let out = render("t", "{{A}}", &values(&[("A", "{{B}}")])).unwrap();
        assert_eq!(out, "{{B}}");
    }

    #[test]
    fn test_bundled_templates_placeholders() {
        assert!(placeholders(SSSD_CONF_TEMPLATE).contains("ACCESS_RULES"));
        assert!(placeholders(SMB_CONF_TEMPLATE).contains("WORKGROUP"));
        assert_eq!(
            placeholders(KRB5_CONF_TEMPLATE),
            ["DOMAIN_REALM", "DOMAIN_UPPER", "REALMS"]
                .iter()
                .map(|s| s.to_string())
                .collect()
        );
        assert!(placeholders(PAM_SERVICE_TEMPLATE).contains("BACKEND"));
    }
}
