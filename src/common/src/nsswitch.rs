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
//! Line grammar for `nsswitch.conf`.
//!
//! Lines that are not touched render exactly as they were read, so an
//! augmentation that changes nothing produces byte-identical output.

#[derive(Debug, Clone, PartialEq, Eq)]
enum NssLine {
    Database {
        name: String,
        sources: Vec<String>,
        comment: Option<String>,
        raw: Option<String>,
    },
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NsswitchConf {
    lines: Vec<NssLine>,
    trailing_newline: bool,
}

fn parse_line(line: &str) -> NssLine {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return NssLine::Other(line.to_string());
    }
    let (body, comment) = match line.find('#') {
        Some(idx) => (&line[..idx], Some(line[idx..].to_string())),
        None => (line, None),
    };
    match body.split_once(':') {
        Some((name, rest)) if !name.trim().is_empty() && !name.trim().contains(' ') => {
            NssLine::Database {
                name: name.trim().to_string(),
                sources: rest.split_whitespace().map(str::to_string).collect(),
                comment,
                raw: Some(line.to_string()),
            }
        }
        _ => NssLine::Other(line.to_string()),
    }
}

impl NsswitchConf {
    pub fn parse(contents: &str) -> Self {
        NsswitchConf {
            lines: contents.lines().map(parse_line).collect(),
            trailing_newline: contents.is_empty() || contents.ends_with('\n'),
        }
    }

    pub fn sources(&self, database: &str) -> Option<&[String]> {
        self.lines.iter().find_map(|l| match l {
            NssLine::Database { name, sources, .. } if name == database => {
                Some(sources.as_slice())
            }
            _ => None,
        })
    }

    pub fn has_source(&self, database: &str, token: &str) -> bool {
        self.sources(database)
            .map(|s| s.iter().any(|t| t == token))
            .unwrap_or(false)
    }

    /// Appends `token` to the database's sources if it is not already
    /// listed. Other sources keep their order. A database without a line
    /// gets a new `files <token>` line. Returns whether anything changed.
    pub fn add_source(&mut self, database: &str, token: &str) -> bool {
        for line in self.lines.iter_mut() {
            if let NssLine::Database {
                name, sources, raw, ..
            } = line
            {
                if name != database {
                    continue;
                }
                if sources.iter().any(|t| t == token) {
                    return false;
                }
                sources.push(token.to_string());
                *raw = None;
                return true;
            }
        }
        self.lines.push(NssLine::Database {
            name: database.to_string(),
            sources: vec!["files".to_string(), token.to_string()],
            comment: None,
            raw: None,
        });
        true
    }

    /// Drops every occurrence of `token` from the database's sources.
    pub fn remove_source(&mut self, database: &str, token: &str) -> bool {
        let mut changed = false;
        for line in self.lines.iter_mut() {
            if let NssLine::Database {
                name, sources, raw, ..
            } = line
            {
                if name == database && sources.iter().any(|t| t == token) {
                    sources.retain(|t| t != token);
                    *raw = None;
                    changed = true;
                }
            }
        }
        changed
    }

    pub fn render(&self) -> String {
        let mut out = self
            .lines
            .iter()
            .map(|line| match line {
                NssLine::Other(text) => text.clone(),
                NssLine::Database { raw: Some(raw), .. } => raw.clone(),
                NssLine::Database {
                    name,
                    sources,
                    comment,
                    raw: None,
                } => {
                    let label = format!("{}:", name);
                    let mut rendered = format!("{:<15} {}", label, sources.join(" "));
                    if let Some(comment) = comment {
                        rendered.push(' ');
                        rendered.push_str(comment);
                    }
                    rendered
                }
            })
            .collect::<Vec<String>>()
            .join("\n");
        if self.trailing_newline && !out.is_empty() {
            out.push('\n');
        }
        out
    }
}
