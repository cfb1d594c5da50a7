//! The root-owned jail policy file.
//!
//! Sandboxing is refused unless an administrator has explicitly enabled it
//! in a single configuration file (default `/etc/cellbox.conf`). The file
//! is line-oriented; the first word of each line is an action, the second
//! (optional) word a directory pattern:
//!
//! ```text
//! enablejail /var/jails/*
//! disablejail /var/jails/shared
//! enableskeleton /var/cellbox-skeleton
//! ```
//!
//! Recognized actions are `enablejail`/`allowjail`, `disablejail`/`nojail`,
//! `enableskeleton`, and `disableskeleton`. A pattern may use `*` and `?`
//! within a component (never crossing `/`, never matching a leading `.`).
//! A bare action with no pattern applies globally.
//!
//! Evaluation order is deliberately asymmetric and must stay that way:
//! a scoped deny covering the target is fatal the moment it is scanned,
//! even if a later allow also covers it; scoped allows are last-match-wins;
//! a global deny clears earlier scoped allows but is overridden by a later
//! scoped allow. A grant always comes from a scoped allow, whose matched
//! prefix becomes the boundary below which directories may be created.
//!
//! The file itself must be owned by root and not writable by any other
//! principal, or the authority grants nothing at all.

use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::PolicyError;
use crate::path::endslash;

/// Default location of the policy file.
pub const POLICY_PATH: &str = "/etc/cellbox.conf";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    JailAllow,
    JailDeny,
    SkeletonAllow,
    SkeletonDeny,
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub kind: RuleKind,
    pub scope: Option<String>,
}

/// Result of authorizing a directory: whether it is allowed, and the
/// boundary prefix below which creation is permitted.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub allowed: bool,
    /// Longest allow-matched prefix of the candidate, trailing slash
    /// included.
    pub boundary: String,
}

#[derive(Debug)]
pub struct Authority {
    rules: Vec<Rule>,
    path: PathBuf,
}

impl Authority {
    /// Load and verify the policy file.
    ///
    /// A missing or unreadable file, or one writable by a non-root
    /// principal, refuses sandboxing outright rather than defaulting open.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PolicyError> {
        let path = path.as_ref().to_path_buf();
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NOFOLLOW)
            .open(&path)
            .map_err(|_| PolicyError::Disabled { path: path.clone() })?;

        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(file.as_raw_fd(), &mut st) } != 0 {
            return Err(PolicyError::Io {
                path,
                source: std::io::Error::last_os_error(),
            });
        }
        if !writable_only_by_root(st.st_uid, st.st_gid, st.st_mode) {
            return Err(PolicyError::WritableByNonRoot { path });
        }

        let mut text = String::new();
        file.read_to_string(&mut text)
            .map_err(|source| PolicyError::Io {
                path: path.clone(),
                source,
            })?;
        tracing::debug!(path = %path.display(), "loaded jail policy");
        Ok(Self::from_rules(Self::parse(&text), path))
    }

    /// Build an authority from already-parsed rules. Skips the file
    /// ownership verification, so callers other than tests should prefer
    /// [`Authority::load`].
    pub fn from_rules(rules: Vec<Rule>, path: PathBuf) -> Self {
        Authority { rules, path }
    }

    /// Parse the policy text into ordered rules. Unrecognized actions and
    /// non-absolute patterns are ignored, as are any words past the second.
    pub fn parse(text: &str) -> Vec<Rule> {
        text.lines()
            .filter_map(|line| {
                let mut words = line.split_whitespace();
                let action = words.next()?;
                let kind = match action {
                    "enablejail" | "allowjail" => RuleKind::JailAllow,
                    "disablejail" | "nojail" => RuleKind::JailDeny,
                    "enableskeleton" => RuleKind::SkeletonAllow,
                    "disableskeleton" => RuleKind::SkeletonDeny,
                    _ => return None,
                };
                let scope = match words.next() {
                    Some(w) if w.starts_with('/') => Some(w.to_string()),
                    Some(_) => return None,
                    None => None,
                };
                Some(Rule { kind, scope })
            })
            .collect()
    }

    /// The directory that contains the policy file. That one ancestor is
    /// exempt from the non-writability requirement during the jail walk.
    pub fn conf_dir(&self) -> String {
        let parent = self
            .path
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());
        if parent.is_empty() {
            "/".to_string()
        } else {
            parent
        }
    }

    /// Decide whether `dir` (trailing slash required) may hold a jail.
    pub fn allow_jail(&self, dir: &str) -> Result<Authorization, PolicyError> {
        debug_assert!(dir.ends_with('/'));
        let mut locally: i8 = -1;
        let mut globally: i8 = -1;
        let mut boundary = String::new();
        for rule in &self.rules {
            match (rule.kind, &rule.scope) {
                (RuleKind::JailDeny, None) => {
                    globally = 0;
                    locally = 0;
                }
                (RuleKind::JailDeny, Some(pattern)) => {
                    // deny short-circuits: a later allow cannot rescue this
                    if scope_covers(pattern, dir) {
                        return Err(PolicyError::DisabledUnder {
                            scope: pattern.clone(),
                        });
                    }
                }
                (RuleKind::JailAllow, None) => globally = 1,
                (RuleKind::JailAllow, Some(pattern)) => {
                    if scope_covers(pattern, dir) {
                        locally = 1;
                        boundary = dirmatch_prefix(&endslash(pattern), dir).to_string();
                    }
                }
                _ => {}
            }
        }
        if locally > 0 {
            Ok(Authorization {
                allowed: true,
                boundary,
            })
        } else if locally == 0 || globally == 0 {
            Err(PolicyError::Disabled {
                path: self.path.clone(),
            })
        } else {
            // no scoped allow ever matched; a bare global allow carries no
            // boundary and therefore grants nothing
            Ok(Authorization {
                allowed: false,
                boundary,
            })
        }
    }

    /// Decide whether `dir` may serve as a shared skeleton cache.
    pub fn allow_skeleton(&self, dir: &str) -> bool {
        debug_assert!(dir.ends_with('/'));
        let mut allowed = false;
        let mut globally: i8 = -1;
        for rule in &self.rules {
            match (rule.kind, &rule.scope) {
                (RuleKind::SkeletonAllow, None) => globally = 1,
                (RuleKind::SkeletonDeny, None) => globally = 0,
                (RuleKind::SkeletonAllow, Some(pattern)) => {
                    if scope_covers(pattern, dir) {
                        allowed = true;
                    }
                }
                (RuleKind::SkeletonDeny, Some(pattern)) => {
                    if scope_covers(pattern, dir) {
                        allowed = false;
                    }
                }
                _ => {}
            }
        }
        if globally == 0 {
            allowed = false;
        }
        allowed
    }
}

/// Owned by root, and writable by nobody else (group write tolerated only
/// for the root group).
pub fn writable_only_by_root(uid: libc::uid_t, gid: libc::gid_t, mode: libc::mode_t) -> bool {
    uid == 0 && (gid == 0 || mode & libc::S_IWGRP == 0) && mode & libc::S_IWOTH == 0
}

/// The prefix of `dir` containing as many slashes as the slash-padded
/// pattern. This is what a matching scoped allow turns into a boundary.
pub fn dirmatch_prefix<'d>(pattern: &str, dir: &'d str) -> &'d str {
    let mut remaining = pattern.bytes().filter(|&b| b == b'/').count();
    let db = dir.as_bytes();
    let mut pos = 0usize;
    while remaining > 0 {
        match db[pos..].iter().position(|&b| b == b'/') {
            Some(i) => {
                pos += i + 1;
                remaining -= 1;
            }
            None => return dir,
        }
    }
    &dir[..pos]
}

/// True when the scoped `pattern` covers `dir`: the prefix of `dir` with
/// the pattern's component count matches it glob-style.
pub fn scope_covers(pattern: &str, dir: &str) -> bool {
    let padded = endslash(pattern);
    wildcard_match(&padded, dirmatch_prefix(&padded, dir))
}

/// Component-wise glob match: `*` and `?` never cross `/` and never match
/// a leading `.`.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pats: Vec<&str> = pattern.split('/').collect();
    let texts: Vec<&str> = text.split('/').collect();
    if pats.len() != texts.len() {
        return false;
    }
    pats.iter().zip(&texts).all(|(p, t)| {
        if t.starts_with('.') && !p.starts_with('.') {
            return false;
        }
        component_match(p.as_bytes(), t.as_bytes())
    })
}

fn component_match(pat: &[u8], text: &[u8]) -> bool {
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;
    while ti < text.len() {
        if pi < pat.len() && (pat[pi] == b'?' || pat[pi] == text[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < pat.len() && pat[pi] == b'*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    while pi < pat.len() && pat[pi] == b'*' {
        pi += 1;
    }
    pi == pat.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority(text: &str) -> Authority {
        Authority::from_rules(Authority::parse(text), PathBuf::from(POLICY_PATH))
    }

    #[test]
    fn parse_skips_junk() {
        let rules = Authority::parse("enablejail /a\nbogus /b\nnojail relative\n\nallowjail");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].kind, RuleKind::JailAllow);
        assert_eq!(rules[1].kind, RuleKind::JailAllow);
        assert!(rules[1].scope.is_none());
    }

    #[test]
    fn scoped_allow_grants_with_boundary() {
        let a = authority("enablejail /jails/*");
        let auth = a.allow_jail("/jails/u1/run3/").unwrap();
        assert!(auth.allowed);
        assert_eq!(auth.boundary, "/jails/u1/");
    }

    #[test]
    fn global_allow_alone_grants_nothing() {
        let a = authority("enablejail");
        let auth = a.allow_jail("/jails/u1/").unwrap();
        assert!(!auth.allowed);
    }

    #[test]
    fn no_rules_grants_nothing() {
        let a = authority("");
        assert!(!a.allow_jail("/jails/u1/").unwrap().allowed);
    }

    #[test]
    fn scoped_deny_short_circuits_even_with_later_allow() {
        // the asymmetry: deny wins the moment it matches, allow does not
        let a = authority("disablejail /jails/u1\nenablejail /jails/*");
        assert!(matches!(
            a.allow_jail("/jails/u1/run/"),
            Err(PolicyError::DisabledUnder { .. })
        ));
        // sibling untouched by the deny is still allowed
        assert!(a.allow_jail("/jails/u2/run/").unwrap().allowed);
    }

    #[test]
    fn allow_is_last_match_wins() {
        let a = authority("enablejail /jails/*\nenablejail /jails/u1/deep");
        let auth = a.allow_jail("/jails/u1/deep/run/").unwrap();
        assert_eq!(auth.boundary, "/jails/u1/deep/");
    }

    #[test]
    fn global_deny_cleared_by_later_scoped_allow() {
        let a = authority("disablejail\nenablejail /jails/*");
        assert!(a.allow_jail("/jails/u1/").unwrap().allowed);

        let a = authority("enablejail /jails/*\ndisablejail");
        assert!(a.allow_jail("/jails/u1/").is_err());
    }

    #[test]
    fn wildcards_stay_within_components() {
        assert!(scope_covers("/jails/*", "/jails/u1/"));
        assert!(scope_covers("/jails/*", "/jails/u1/nested/"));
        assert!(!scope_covers("/jails/*", "/other/u1/"));
        // '*' must not cross a slash
        assert!(!scope_covers("/ja*1", "/jails/u1/"));
        assert!(scope_covers("/jails/u?", "/jails/u1/"));
    }

    #[test]
    fn wildcards_do_not_match_leading_dot() {
        assert!(!scope_covers("/jails/*", "/jails/.hidden/"));
        assert!(scope_covers("/jails/.h*", "/jails/.hidden/"));
    }

    #[test]
    fn deeper_target_than_pattern_still_covered() {
        // monotonic: allow at /jails/u1 covers every descendant
        let a = authority("enablejail /jails/u1");
        assert!(a.allow_jail("/jails/u1/a/b/c/").unwrap().allowed);
        assert!(!a.allow_jail("/jails/").unwrap().allowed);
    }

    #[test]
    fn skeleton_rules() {
        let a = authority("enableskeleton /skel\nenablejail /jails/*");
        assert!(a.allow_skeleton("/skel/"));
        assert!(!a.allow_skeleton("/elsewhere/"));

        let a = authority("enableskeleton /skel\ndisableskeleton");
        assert!(!a.allow_skeleton("/skel/"));

        let a = authority("enableskeleton /skel\ndisableskeleton /skel");
        assert!(!a.allow_skeleton("/skel/"));
    }

    #[test]
    fn ownership_predicate() {
        assert!(writable_only_by_root(0, 0, 0o100644));
        assert!(writable_only_by_root(0, 0, 0o100664));
        assert!(!writable_only_by_root(1000, 0, 0o100644));
        assert!(!writable_only_by_root(0, 50, 0o100664));
        assert!(!writable_only_by_root(0, 0, 0o100646));
    }
}
