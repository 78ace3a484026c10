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

/// One `[realms]` stanza plus its `[domain_realm]` mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RealmEntry {
    pub realm: String,
    pub kdc: String,
    pub admin_server: String,
    pub domain: String,
}

impl RealmEntry {
    pub fn new(realm: &str, kdc: &str, admin_server: &str) -> Self {
        RealmEntry {
            realm: realm.to_uppercase(),
            kdc: kdc.to_string(),
            admin_server: admin_server.to_string(),
            domain: realm.to_lowercase(),
        }
    }

    /// The realm a joined host belongs to. The domain controllers are found
    /// through DNS, so the realm name doubles as KDC and admin server.
    pub fn primary(domain_lower: &str) -> Self {
        RealmEntry::new(domain_lower, domain_lower, domain_lower)
    }

    /// Parses `REALM:kdc[:admin_server]`. The admin server defaults to the
    /// KDC; anything after the second colon (e.g. a port) stays with it.
    pub fn parse(spec: &str) -> Option<Self> {
        let mut parts = spec.trim().splitn(3, ':');
        let realm = parts.next().map(str::trim).filter(|s| !s.is_empty())?;
        let kdc = parts.next().map(str::trim).filter(|s| !s.is_empty())?;
        let admin = parts
            .next()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(kdc);
        Some(RealmEntry::new(realm, kdc, admin))
    }
}

/// Static table of realms written to `krb5.conf`. Entries are added in
/// order and a realm already present is never replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RealmTable {
    entries: Vec<RealmEntry>,
}

impl RealmTable {
    pub fn new() -> Self {
        RealmTable::default()
    }

    pub fn add(&mut self, entry: RealmEntry) -> bool {
        if self.entries.iter().any(|e| e.realm == entry.realm) {
            debug!("Realm {} already in table; skipping", entry.realm);
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn entries(&self) -> &[RealmEntry] {
        &self.entries
    }

    pub fn render_realms(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            out.push_str(&format!(
                "    {} = {{\n        kdc = {}\n        admin_server = {}\n    }}\n",
                e.realm, e.kdc, e.admin_server
            ));
        }
        out
    }

    pub fn render_domain_realm(&self) -> String {
        let mut out = String::new();
        for e in &self.entries {
            out.push_str(&format!("    .{} = {}\n", e.domain, e.realm));
            out.push_str(&format!("    {} = {}\n", e.domain, e.realm));
        }
        out
    }
}
