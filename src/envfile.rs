//! The conditional attribute source.
//!
//! Deployments often derive part of a resource's input (typically a
//! container's environment) from a local `KEY=VALUE` file that may or may
//! not exist. The loaded set is ordinary literal data computed at
//! declaration time; it participates in no graph edge.

use std::collections::BTreeMap;
use std::fs;

use camino::Utf8Path;

/// Loads a `KEY=VALUE` attribute file.
///
/// Entries with an empty value are dropped, so consumers only ever see
/// attributes that are actually set. A missing or unreadable file yields an
/// empty set, never an error. Only emptiness is filtered: values like `"0"`
/// or `"false"` pass through.
pub fn load(path: impl AsRef<Utf8Path>) -> BTreeMap<String, String> {
    match fs::read_to_string(path.as_ref()) {
        Ok(content) => parse(&content),
        Err(_) => BTreeMap::new(),
    }
}

fn parse(content: &str) -> BTreeMap<String, String> {
    let mut attributes = BTreeMap::new();

    for line in content.lines() {
        let line = line.trim();

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        let key = key.trim();
        let value = unquote(value.trim());

        if key.is_empty() || value.is_empty() {
            continue;
        }

        attributes.insert(key.to_string(), value.to_string());
    }

    attributes
}

fn unquote(value: &str) -> &str {
    let quoted = (value.starts_with('"') && value.ends_with('"'))
        || (value.starts_with('\'') && value.ends_with('\''));

    if quoted && value.len() >= 2 {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
