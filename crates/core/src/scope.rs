#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub fn normalize_path(raw: &str) -> String {
    let mut path = raw.trim().replace('\\', "/");
    while let Some(rest) = path.strip_prefix("./") {
        path = rest.to_string();
    }
    path
}

/// Absolute paths and paths with a `..` segment can name files outside the
/// repository, so no scope entry covers them.
fn escapes_root(path: &str) -> bool {
    if path.starts_with('/') {
        return true;
    }
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        return true;
    }
    path.split('/').any(|segment| segment == "..")
}

/// Files a validator is allowed to touch.
///
/// Entries ending in `/` authorize everything beneath that directory.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuthorizedScope {
    paths: BTreeSet<String>,
}

impl AuthorizedScope {
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let paths = paths
            .into_iter()
            .map(|p| normalize_path(p.as_ref()))
            .filter(|p| !p.is_empty())
            .collect();
        Self { paths }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    pub fn covers(&self, raw: &str) -> bool {
        let path = normalize_path(raw);
        if path.is_empty() || escapes_root(&path) {
            return false;
        }
        if self.paths.contains(&path) {
            return true;
        }
        self.paths
            .iter()
            .filter(|entry| entry.ends_with('/'))
            .any(|dir| path.starts_with(dir.as_str()))
    }

    /// Paths from `files` the scope does not cover, normalized and deduped.
    pub fn violations<'a, I>(&self, files: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        files
            .into_iter()
            .filter(|file| !self.covers(file))
            .map(|file| normalize_path(file))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}
