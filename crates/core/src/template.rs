//! E-mail templates.
//!
//! A template file holds the subject on its first non-empty line; the rest
//! is the body. Placeholders are `$name` or `${name}`, where names may
//! contain dots (`${source.asn}`). `$$` is a literal dollar sign.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Values available for substitution, keyed by placeholder name.
pub type Substitutions = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum TemplateError {
    #[error("Invalid template name {name:?}: it would be outside of the template directory {dir:?}")]
    OutsideTemplateDir { name: String, dir: PathBuf },

    #[error("Cannot read template {name:?}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Template {0:?} has no subject line")]
    NoSubject(String),

    #[error("No substitution for placeholder ${{{0}}}")]
    MissingKey(String),

    #[error("Invalid placeholder at byte {0}")]
    InvalidPlaceholder(usize),
}

/// A parsed subject/body template pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    subject: String,
    body: String,
}

impl Template {
    pub fn from_strings(subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            body: body.into(),
        }
    }

    /// Parse the template file format. Leading and trailing white space of
    /// the body is removed and a single newline appended.
    pub fn parse(name: &str, text: &str) -> Result<Self, TemplateError> {
        let mut lines = text.split_inclusive('\n');
        let subject = lines
            .by_ref()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .ok_or_else(|| TemplateError::NoSubject(name.to_string()))?;
        let rest: String = lines.collect();
        Ok(Self::from_strings(subject, format!("{}\n", rest.trim())))
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Fill in subject and body. Every placeholder must have a value.
    pub fn substitute(&self, values: &Substitutions) -> Result<(String, String), TemplateError> {
        Ok((
            substitute(&self.subject, values)?,
            substitute(&self.body, values)?,
        ))
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

/// Length in bytes of the identifier at the start of `s`, if any.
fn ident_len(s: &str) -> Option<usize> {
    let mut chars = s.char_indices();
    match chars.next() {
        Some((_, c)) if is_ident_start(c) => {}
        _ => return None,
    }
    Some(
        chars
            .find(|(_, c)| !is_ident_char(*c))
            .map_or(s.len(), |(i, _)| i),
    )
}

fn substitute(text: &str, values: &Substitutions) -> Result<String, TemplateError> {
    let lookup = |key: &str| {
        values
            .get(key)
            .ok_or_else(|| TemplateError::MissingKey(key.to_string()))
    };

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let offset = text.len() - rest.len() + pos;
        let after = &rest[pos + 1..];

        if let Some(tail) = after.strip_prefix('$') {
            out.push('$');
            rest = tail;
        } else if let Some(braced) = after.strip_prefix('{') {
            let len = ident_len(braced).ok_or(TemplateError::InvalidPlaceholder(offset))?;
            if !braced[len..].starts_with('}') {
                return Err(TemplateError::InvalidPlaceholder(offset));
            }
            out.push_str(lookup(&braced[..len])?);
            rest = &braced[len + 1..];
        } else {
            let len = ident_len(after).ok_or(TemplateError::InvalidPlaceholder(offset))?;
            out.push_str(lookup(&after[..len])?);
            rest = &after[len..];
        }
    }
    out.push_str(rest);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Template directory
// ---------------------------------------------------------------------------

/// Reads templates from a base directory. Names are resolved relative to
/// that directory and may not escape it.
#[derive(Debug, Clone)]
pub struct TemplateStore {
    dir: PathBuf,
}

impl TemplateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Absolute path of the named template. The check is lexical; symlinks
    /// inside the directory are followed when the file is opened.
    pub fn full_path(&self, name: &str) -> Result<PathBuf, TemplateError> {
        let outside = || TemplateError::OutsideTemplateDir {
            name: name.to_string(),
            dir: self.dir.clone(),
        };
        let base = normalize(&std::path::absolute(&self.dir).map_err(|_| outside())?);
        let full = normalize(&base.join(name));
        if full == base || !full.starts_with(&base) {
            return Err(outside());
        }
        Ok(full)
    }

    pub async fn read(&self, name: &str) -> Result<Template, TemplateError> {
        let path = self.full_path(name)?;
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| TemplateError::Io {
                name: name.to_string(),
                source,
            })?;
        Template::parse(name, &text)
    }
}

/// Resolve `.` and `..` components without touching the file system.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
