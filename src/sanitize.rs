//! Label and annotation name sanitization.
//!
//! Alertmanager only accepts label and annotation names matching
//! `^[a-zA-Z_][a-zA-Z0-9_]*$`. Alerts produced elsewhere may carry arbitrary
//! names, so every name is rewritten before it leaves the process:
//!
//! - whitespace is removed (not replaced)
//! - other ASCII characters that are not allowed become `_`
//! - non-ASCII characters become the hex value of their code point
//! - a result starting with a digit gets a leading `_`
//!
//! When two names sanitize to the same text, the later one (in sorted order
//! of the original names) gets `_` plus the first 3 bytes of the MD5 of its
//! original name appended.

use serde::ser::{Serialize, SerializeMap, Serializer};
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use thiserror::Error;
use tracing::warn;

/// Reasons a single name cannot be sanitized
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SanitizeError {
    #[error("label name cannot be empty")]
    Empty,
    #[error("label name only contains whitespace")]
    OnlyWhitespace,
}

/// A single sanitized name/value pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Label {
    pub name: String,
    pub value: String,
}

/// Ordered set of labels with unique, valid names
///
/// Serializes as a JSON object in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Labels(Vec<Label>);

impl Labels {
    /// Value of the label called `name`, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.name == name)
            .map(|l| l.value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Labels {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for label in &self.0 {
            map.serialize_entry(&label.name, &label.value)?;
        }
        map.end()
    }
}

/// Whether `name` matches `^[a-zA-Z_][a-zA-Z0-9_]*$`
pub fn is_valid_label_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .char_indices()
            .all(|(i, c)| is_allowed_at(i, c))
}

fn is_allowed_at(index: usize, c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_' || (c.is_ascii_digit() && index > 0)
}

/// Rewrite a single name so it matches the Alertmanager grammar
///
/// Valid names are returned unchanged.
pub fn sanitize_label_name(name: &str) -> Result<String, SanitizeError> {
    if name.is_empty() {
        return Err(SanitizeError::Empty);
    }

    if is_valid_label_name(name) {
        return Ok(name.to_string());
    }

    warn!(label_name = %name, "Alert contains label/annotation name with invalid characters");

    // Whitespace is dropped instead of replaced so names that were only
    // ever "fixed" by removing spaces keep their old form.
    let stripped: String = name.chars().filter(|c| !c.is_whitespace()).collect();

    let mut sanitized = String::with_capacity(stripped.len());
    for (i, c) in stripped.char_indices() {
        if is_allowed_at(i, c) {
            sanitized.push(c);
        } else if c.is_ascii() {
            sanitized.push('_');
        } else {
            let _ = write!(sanitized, "{:x}", u32::from(c));
        }
    }

    if sanitized.is_empty() {
        return Err(SanitizeError::OnlyWhitespace);
    }

    // A hex escape in first position can start with a digit.
    if sanitized.starts_with(|c: char| c.is_ascii_digit()) {
        sanitized.insert(0, '_');
    }

    Ok(sanitized)
}

/// Sanitize every name of a label or annotation mapping
///
/// Names are processed in sorted order so collision suffixes are assigned
/// deterministically. Entries whose name cannot be sanitized are skipped.
pub fn sanitize_label_set(labels: &HashMap<String, String>) -> Labels {
    let mut names: Vec<&String> = labels.keys().collect();
    names.sort();

    let mut seen = HashSet::with_capacity(names.len());
    let mut sanitized = Vec::with_capacity(names.len());

    for name in names {
        let mut candidate = match sanitize_label_name(name) {
            Ok(candidate) => candidate,
            Err(err) => {
                warn!(
                    label_name = %name,
                    error = %err,
                    "Alert contains a label/annotation name that failed to sanitize, skipping"
                );
                continue;
            }
        };

        if seen.contains(&candidate) {
            candidate.push('_');
            candidate.push_str(&collision_suffix(name));
            warn!(
                label_name = %name,
                new_name = %candidate,
                "Alert contains duplicate label/annotation name after sanitization, appending unique suffix"
            );
        }

        seen.insert(candidate.clone());
        sanitized.push(Label {
            name: candidate,
            value: labels[name].clone(),
        });
    }

    Labels(sanitized)
}

/// Six hex characters from the MD5 of the original name
fn collision_suffix(original: &str) -> String {
    let digest = md5::compute(original.as_bytes());
    format!("{:02x}{:02x}{:02x}", digest[0], digest[1], digest[2])
}
