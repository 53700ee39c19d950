//! Canonical path strings and the overlap rule used for conflict detection.

use std::collections::HashMap;
use std::path::MAIN_SEPARATOR;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

/// Whether two canonical absolute paths overlap: they are equal, or one is
/// an ancestor directory of the other.
///
/// ```rust
/// use workplan::paths::overlaps;
///
/// assert!(overlaps("/a/b", "/a/b/c"));
/// assert!(!overlaps("/a/b", "/a/bc"));
/// ```
pub fn overlaps(first: &str, second: &str) -> bool {
    overlapped_path(first, second).is_some()
}

/// Returns the shorter of the two paths when they overlap.
pub fn overlapped_path<'a>(first: &'a str, second: &'a str) -> Option<&'a str> {
    if first == second {
        return Some(first);
    }
    if first.len() == second.len() {
        return None;
    }

    let (shorter, longer) = if first.len() > second.len() {
        (second, first)
    } else {
        (first, second)
    };

    let overlapping = longer.starts_with(shorter)
        && longer[shorter.len()..].starts_with(MAIN_SEPARATOR);

    overlapping.then_some(shorter)
}

/// Whether any path of the first set overlaps any path of the second.
pub fn any_overlap<'a, A, B>(first: A, second: B) -> bool
where
    A: IntoIterator<Item = &'a String>,
    B: IntoIterator<Item = &'a String> + Clone,
{
    first
        .into_iter()
        .any(|a| second.clone().into_iter().any(|b| overlaps(a, b)))
}

/// Turns declared paths into canonical absolute strings.
///
/// Relative paths are resolved against `base`. `.` and `..` are folded
/// lexically, then the longest existing ancestor is resolved through the file
/// system so symlinked directories compare equal to their targets. Paths that
/// don't exist yet (outputs usually don't) keep their normalized tail.
///
/// Results are cached per raw path, so repeated queries for the same declared
/// file never touch the file system twice.
#[derive(Debug)]
pub struct Canonicalizer {
    base: Utf8PathBuf,
    cache: HashMap<Utf8PathBuf, String>,
}

impl Canonicalizer {
    pub fn new(base: impl Into<Utf8PathBuf>) -> Self {
        Self {
            base: base.into(),
            cache: HashMap::new(),
        }
    }

    /// Uses the process working directory as the base.
    pub fn from_current_dir() -> std::io::Result<Self> {
        let cwd = std::env::current_dir()?;
        let cwd = Utf8PathBuf::from_path_buf(cwd).map_err(|path| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("working directory is not UTF-8: {}", path.display()),
            )
        })?;

        Ok(Self::new(cwd))
    }

    pub fn canonicalize(&mut self, path: &Utf8Path) -> std::io::Result<String> {
        if let Some(cached) = self.cache.get(path) {
            return Ok(cached.clone());
        }

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base.join(path)
        };

        let canonical = resolve_existing_prefix(&normalize(&absolute))?;
        let canonical = canonical.into_string();

        self.cache.insert(path.to_path_buf(), canonical.clone());
        Ok(canonical)
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

fn normalize(path: &Utf8Path) -> Utf8PathBuf {
    let mut out = Utf8PathBuf::new();

    for component in path.components() {
        match component {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_str()),
        }
    }

    out
}

fn resolve_existing_prefix(path: &Utf8Path) -> std::io::Result<Utf8PathBuf> {
    let mut existing = path;
    let mut missing = Vec::new();

    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name);
                existing = parent;
            }
            _ => return Ok(path.to_path_buf()),
        }
    }

    let resolved = existing.canonicalize_utf8()?;
    Ok(missing
        .into_iter()
        .rev()
        .fold(resolved, |acc, name| acc.join(name)))
}
