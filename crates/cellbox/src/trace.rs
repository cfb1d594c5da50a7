//! Verbose and dry-run command tracing.
//!
//! With `--verbose`, every filesystem mutation prints its shell equivalent
//! (`mkdir -m 0755 /jail/x`, `mount -i -n -t proc proc /jail/proc`).
//! With `--dry-run`, the trace prints and the mutation is skipped.
//!
//! Trace output goes to stdout under dry-run (it is the primary output) and
//! to stderr otherwise, so it never interleaves with the supervised
//! command's terminal stream.

use std::fmt;

use nix::unistd::{Gid, Group, Uid, User};

#[derive(Debug, Clone, Copy, Default)]
pub struct Trace {
    pub verbose: bool,
    pub dryrun: bool,
}

impl Trace {
    pub fn new(verbose: bool, dryrun: bool) -> Self {
        // dry-run implies verbose: a silent dry-run would do nothing at all
        Self {
            verbose: verbose || dryrun,
            dryrun,
        }
    }

    /// True when the guarded syscall should actually run.
    #[inline]
    pub fn live(&self) -> bool {
        !self.dryrun
    }

    pub fn say(&self, msg: fmt::Arguments<'_>) {
        if !self.verbose {
            return;
        }
        if self.dryrun {
            println!("{msg}");
        } else {
            eprintln!("{msg}");
        }
    }
}

/// Resolve a uid to a login name for trace output, falling back to the
/// numeric form.
pub fn uid_name(uid: libc::uid_t) -> String {
    match User::from_uid(Uid::from_raw(uid)) {
        Ok(Some(user)) => user.name,
        _ => uid.to_string(),
    }
}

/// Resolve a gid to a group name for trace output.
pub fn gid_name(gid: libc::gid_t) -> String {
    match Group::from_gid(Gid::from_raw(gid)) {
        Ok(Some(group)) => group.name,
        _ => gid.to_string(),
    }
}
