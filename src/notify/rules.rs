//! Rule filters.

use regex::Regex;
use thiserror::Error;

use super::Alert;
use crate::db::{EventKind, NotificationRule};

#[derive(Error, Debug, Clone, PartialEq)]
#[error("invalid pattern {pattern:?}: {reason}")]
pub struct PatternError {
    pub pattern: String,
    pub reason: String,
}

/// Shell-style glob: `*` matches any run of characters, `?` exactly one,
/// `[...]` a character class (`[!...]` negated).
#[derive(Debug, Clone)]
pub struct Glob(Regex);

impl Glob {
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let err = |reason: &str| PatternError {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        let mut re = String::with_capacity(pattern.len() * 2 + 2);
        re.push('^');
        let mut chars = pattern.chars().peekable();
        while let Some(c) = chars.next() {
            match c {
                '*' => re.push_str(".*"),
                '?' => re.push('.'),
                '[' => {
                    let mut class = String::new();
                    if matches!(chars.peek(), Some('!') | Some('^')) {
                        chars.next();
                        class.push('^');
                    }
                    let mut closed = false;
                    let mut first = true;
                    while let Some(c) = chars.next() {
                        match c {
                            ']' if !first => {
                                closed = true;
                                break;
                            }
                            '\\' => {
                                let escaped = chars.next().ok_or_else(|| err("trailing escape in class"))?;
                                class.push_str(&regex::escape(&escaped.to_string()));
                            }
                            '-' => class.push('-'),
                            c => class.push_str(&regex::escape(&c.to_string())),
                        }
                        first = false;
                    }
                    if !closed {
                        return Err(err("unterminated character class"));
                    }
                    re.push('[');
                    re.push_str(&class);
                    re.push(']');
                }
                '\\' => {
                    let escaped = chars.next().ok_or_else(|| err("trailing escape"))?;
                    re.push_str(&regex::escape(&escaped.to_string()));
                }
                c => re.push_str(&regex::escape(&c.to_string())),
            }
        }
        re.push('$');

        Regex::new(&re).map(Glob).map_err(|e| err(&e.to_string()))
    }

    pub fn matches(&self, s: &str) -> bool {
        self.0.is_match(s)
    }
}

/// A rule with its patterns compiled.
pub struct CompiledRule<'a> {
    pub rule: &'a NotificationRule,
    container: Option<Glob>,
    image: Option<Glob>,
}

impl<'a> CompiledRule<'a> {
    pub fn compile(rule: &'a NotificationRule) -> Result<Self, PatternError> {
        Ok(Self {
            rule,
            container: compile_opt(rule.container_pattern.as_deref())?,
            image: compile_opt(rule.image_pattern.as_deref())?,
        })
    }

    pub fn wants(&self, kind: EventKind) -> bool {
        self.rule.event_types.contains(&kind)
    }

    /// Host, container and image filters. Unset filters match everything.
    pub fn matches(&self, alert: &Alert) -> bool {
        if let Some(host_id) = self.rule.host_id {
            if host_id != alert.host_id {
                return false;
            }
        }
        if let Some(glob) = &self.container {
            if !glob.matches(&alert.container_name) {
                return false;
            }
        }
        if let Some(glob) = &self.image {
            if !glob.matches(&alert.image) {
                return false;
            }
        }
        true
    }
}

fn compile_opt(pattern: Option<&str>) -> Result<Option<Glob>, PatternError> {
    match pattern {
        Some(p) if !p.is_empty() => Glob::new(p).map(Some),
        _ => Ok(None),
    }
}
