//! Pathname hygiene.
//!
//! Jail directories come from untrusted command lines, so every path is
//! normalized through [`clean_filename`] before any privileged use: only a
//! conservative character set is accepted, `.` components are dropped,
//! `..` is rejected outright, and duplicate or trailing slashes are
//! collapsed. The result is an absolute path that can be walked
//! component-by-component without re-parsing.

use std::io;

use crate::error::JailError;

const MAX_PATH: usize = 1024;

/// Normalize a filename, returning `None` if it contains anything a jail
/// path is not allowed to contain.
pub fn clean_filename(name: &str) -> Option<String> {
    if name.is_empty() || name.len() >= MAX_PATH || name.starts_with('~') {
        return None;
    }
    let b = name.as_bytes();
    let ok = b.iter().all(|&c| {
        matches!(c, b'/' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'A'..=b'Z' | b'a'..=b'z')
    });
    if !ok {
        return None;
    }

    let mut out: Vec<u8> = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        let c = b[i];
        out.push(c);
        let prev_slash = i > 0 && b[i - 1] == b'/';
        if c == b'.' && matches!(b.get(i + 1), Some(b'/') | None) && prev_slash {
            // "/./" or trailing "/." collapses away
            out.pop();
            i += 1;
        } else if c == b'.'
            && b.get(i + 1) == Some(&b'.')
            && matches!(b.get(i + 2), Some(b'/') | None)
            && (i == 0 || prev_slash)
        {
            return None;
        }
        while i < b.len() && b[i] == b'/' && b.get(i + 1) == Some(&b'/') {
            i += 1;
        }
        i += 1;
    }
    while out.len() > 1 && out.last() == Some(&b'/') {
        out.pop();
    }
    // the byte filter above guarantees valid UTF-8
    Some(String::from_utf8(out).expect("ascii"))
}

/// Make a path absolute against the current working directory.
pub fn absolute(dir: &str) -> io::Result<String> {
    if dir.starts_with('/') {
        return Ok(dir.to_string());
    }
    let cwd = std::env::current_dir()?;
    let mut buf = cwd.to_string_lossy().into_owned();
    while buf.len() > 1 && buf.ends_with('/') {
        buf.pop();
    }
    buf.push('/');
    buf.push_str(dir);
    Ok(buf)
}

pub fn endslash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

pub fn noendslash(path: &str) -> &str {
    let mut end = path.len();
    while end > 1 && path.as_bytes()[end - 1] == b'/' {
        end -= 1;
    }
    &path[..end]
}

/// The parent directory of `path`, trailing slash included.
/// `parent_dir("/a/b")` and `parent_dir("/a/b/")` are both `"/a/"`.
pub fn parent_dir(path: &str) -> &str {
    let b = path.as_bytes();
    let mut end = b.len();
    while end > 0 && b[end - 1] == b'/' {
        end -= 1;
    }
    while end > 0 && b[end - 1] != b'/' {
        end -= 1;
    }
    &path[..end]
}

/// An absolute, normalized jail path. Constructed once from CLI input and
/// immutable afterwards; never `/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailPath(String);

impl JailPath {
    pub fn new(raw: &str) -> Result<Self, JailError> {
        let abs = absolute(raw).map_err(|e| JailError::io(raw, e))?;
        let clean = clean_filename(&abs).ok_or_else(|| JailError::BadFilename(raw.to_string()))?;
        if clean.is_empty() || clean == "/" || !clean.starts_with('/') {
            return Err(JailError::BadFilename(raw.to_string()));
        }
        Ok(JailPath(endslash(&clean)))
    }

    /// The path with a trailing slash.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path without its trailing slash.
    pub fn trimmed(&self) -> &str {
        noendslash(&self.0)
    }
}

impl std::fmt::Display for JailPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.trimmed())
    }
}

/// Quote an argument for `sh -c`, single-quoting anything outside the
/// known-safe character set.
pub fn shell_quote(argument: &str) -> String {
    let safe = |i: usize, c: char| {
        (c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '~' | '.' | '/'))
            && !(i == 0 && c == '~')
    };
    if argument.char_indices().all(|(i, c)| safe(i, c)) && !argument.is_empty() {
        return argument.to_string();
    }
    let mut quoted = String::with_capacity(argument.len() + 2);
    quoted.push('\'');
    for c in argument.chars() {
        if c == '\'' {
            quoted.push_str("'\\''");
        } else {
            quoted.push(c);
        }
    }
    quoted.push('\'');
    quoted
}
