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
//! Line grammar for PAM stack files under `/etc/pam.d`.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PamRule {
    pub kind: String,
    pub control: String,
    pub module: String,
    pub args: Vec<String>,
}

impl PamRule {
    /// Parses `type control module [args...]`. Bracketed controls such as
    /// `[success=1 default=ignore]` may contain spaces. `@include` lines
    /// and comments are not rules.
    pub fn parse(line: &str) -> Option<PamRule> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('@') {
            return None;
        }
        let (kind, rest) = trimmed.split_once(char::is_whitespace)?;
        let rest = rest.trim_start();
        let (control, rest) = if rest.starts_with('[') {
            let end = rest.find(']')?;
            (&rest[..=end], &rest[end + 1..])
        } else {
            rest.split_once(char::is_whitespace).unwrap_or((rest, ""))
        };
        let mut fields = rest.split_whitespace();
        let module = fields.next()?;
        Some(PamRule {
            kind: kind.trim_start_matches('-').to_string(),
            control: control.to_string(),
            module: module.to_string(),
            args: fields.map(str::to_string).collect(),
        })
    }

    pub fn render(&self) -> String {
        let mut line = format!("{}\t{}\t{}", self.kind, self.control, self.module);
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Module match on the file name, so `pam_sss.so` also matches a rule
    /// naming `/lib/security/pam_sss.so`.
    pub fn uses(&self, module: &str) -> bool {
        self.module == module || self.module.rsplit('/').next() == Some(module)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PamLine {
    Rule { rule: PamRule, raw: String },
    Other(String),
}

/// Where a new rule goes relative to existing rules.
#[derive(Debug, Clone, Copy)]
pub enum Placement {
    /// Before the first rule of the same type using this module, otherwise
    /// at the end of the file.
    Before(&'static str),
    /// After the last rule of the same type using this module, otherwise at
    /// the end of the file.
    After(&'static str),
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PamStack {
    lines: Vec<PamLine>,
}

impl PamStack {
    pub fn parse(contents: &str) -> Self {
        PamStack {
            lines: contents
                .lines()
                .map(|line| match PamRule::parse(line) {
                    Some(rule) => PamLine::Rule {
                        rule,
                        raw: line.to_string(),
                    },
                    None => PamLine::Other(line.to_string()),
                })
                .collect(),
        }
    }

    pub fn rules(&self) -> impl Iterator<Item = &PamRule> {
        self.lines.iter().filter_map(|l| match l {
            PamLine::Rule { rule, .. } => Some(rule),
            PamLine::Other(_) => None,
        })
    }

    pub fn references(&self, module: &str) -> bool {
        self.rules().any(|r| r.uses(module))
    }

    fn has(&self, kind: &str, module: &str) -> bool {
        self.rules().any(|r| r.kind == kind && r.uses(module))
    }

    /// Inserts `rule` unless a rule of the same type already uses its module.
    /// Returns whether the stack changed.
    pub fn insert(&mut self, rule: PamRule, placement: Placement) -> bool {
        if self.has(&rule.kind, &rule.module) {
            debug!("{} {} already present; skipping", rule.kind, rule.module);
            return false;
        }
        let same_kind_using = |line: &PamLine, module: &str| match line {
            PamLine::Rule { rule: r, .. } => r.kind == rule.kind && r.uses(module),
            PamLine::Other(_) => false,
        };
        let index = match placement {
            Placement::Before(anchor) => self
                .lines
                .iter()
                .position(|l| same_kind_using(l, anchor)),
            Placement::After(anchor) => self
                .lines
                .iter()
                .rposition(|l| same_kind_using(l, anchor))
                .map(|i| i + 1),
            Placement::End => None,
        }
        .unwrap_or(self.lines.len());
        let raw = rule.render();
        self.lines.insert(index, PamLine::Rule { rule, raw });
        true
    }

    pub fn remove_module(&mut self, module: &str) -> bool {
        let before = self.lines.len();
        self.lines.retain(|l| match l {
            PamLine::Rule { rule, .. } => !rule.uses(module),
            PamLine::Other(_) => true,
        });
        before != self.lines.len()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                PamLine::Rule { raw, .. } => out.push_str(raw),
                PamLine::Other(text) => out.push_str(text),
            }
            out.push('\n');
        }
        out
    }
}
