use crate::error::{FatError, Result};

/// One step of an absolute path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Component<'a> {
    pub name: &'a str,
    /// No further components follow.
    pub last: bool,
    /// A separator follows, so the caller expects a directory here.
    pub wants_directory: bool,
}

/// Tokenizer over an absolute, `/`-separated path.
///
/// Each resolution owns its cursor, so nested or repeated lookups never
/// share position state. Empty components (`//`) are skipped.
#[derive(Debug, Clone)]
pub struct PathCursor<'a> {
    path: &'a str,
    rest: &'a str,
}

impl<'a> PathCursor<'a> {
    pub fn new(path: &'a str) -> Result<Self> {
        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| FatError::PathNotFound(path.to_string()))?;
        Ok(Self { path, rest })
    }

    /// The full path this cursor walks, for error messages.
    pub fn path(&self) -> &'a str {
        self.path
    }

    pub fn is_done(&self) -> bool {
        self.rest.trim_start_matches('/').is_empty()
    }
}

impl<'a> Iterator for PathCursor<'a> {
    type Item = Component<'a>;

    fn next(&mut self) -> Option<Component<'a>> {
        let rest = self.rest.trim_start_matches('/');
        if rest.is_empty() {
            self.rest = rest;
            return None;
        }
        let (name, tail, separated) = match rest.split_once('/') {
            Some((name, tail)) => (name, tail, true),
            None => (rest, "", false),
        };
        self.rest = tail;
        let last = tail.trim_start_matches('/').is_empty();
        Some(Component {
            name,
            last,
            wants_directory: separated,
        })
    }
}
