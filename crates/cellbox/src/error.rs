//! Error types for cellbox.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from the policy authority.
///
/// Every variant refuses the whole operation: sandboxing fails closed when
/// the policy file is missing, tampered with, or denies the target.
#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("{}: {source}", path.display())]
    Io { path: PathBuf, source: io::Error },

    #[error("{}: writable by non-root", path.display())]
    WritableByNonRoot { path: PathBuf },

    #[error("jails are disabled; perhaps you need to edit `{}`", path.display())]
    Disabled { path: PathBuf },

    #[error("{scope}: jails are disabled under here")]
    DisabledUnder { scope: String },

    #[error("{dir}: no policy enables skeleton directories here")]
    SkeletonDisabled { dir: String },
}

/// Errors from jail directory validation, removal, and renaming.
///
/// These are fail-fast: the CLI terminates on the first one, since partial
/// progress past a failed authorization check is a privilege-escalation
/// hazard.
#[derive(Debug, Error)]
pub enum JailError {
    #[error("{0}: bad characters in filename")]
    BadFilename(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("{0}: not a directory")]
    NotADirectory(String),

    #[error("{0}: not owned by root")]
    NotRootOwned(String),

    #[error("{0}: writable by non-root")]
    WritableByNonRoot(String),

    #[error("mkdir {path}: {source}")]
    Mkdir { path: String, source: io::Error },

    #[error("{dst}: not a subdirectory of {boundary}")]
    OutsideBoundary { dst: String, boundary: String },

    #[error("{path}: {source}")]
    Io { path: String, source: io::Error },
}

impl JailError {
    pub(crate) fn io(path: impl Into<String>, source: io::Error) -> Self {
        JailError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors from resolving the jail owner account.
#[derive(Debug, Error)]
pub enum OwnerError {
    #[error("{0}: username too long")]
    NameTooLong(String),

    #[error("{0}: no such user")]
    NoSuchUser(String),

    #[error("{user}: user lookup failed: {source}")]
    Lookup { user: String, source: io::Error },

    #[error("{user}: home directory {home} not under /home")]
    HomeNotUnderHome { user: String, home: String },

    #[error("{user}: shell {shell} not allowed by /etc/shells")]
    ShellNotAllowed { user: String, shell: String },

    #[error("{0}: jail user cannot be root")]
    RootUser(String),
}

/// Errors from the execution supervisor before the I/O relay takes over.
///
/// Once privilege has been dropped irreversibly, later failures are
/// reported through the `125` exit convention instead.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("unshare: {0}")]
    Unshare(io::Error),

    #[error("fork: {0}")]
    Fork(io::Error),

    #[error("mount {target}: {source}")]
    Mount { target: String, source: io::Error },

    #[error("chdir {path}: {source}")]
    Chdir { path: String, source: io::Error },

    #[error("chroot: {0}")]
    Chroot(io::Error),

    #[error("{op}: {source}")]
    Privilege { op: &'static str, source: io::Error },

    #[error("{op}: {source}")]
    Pty { op: &'static str, source: io::Error },

    #[error("open {path}: {source}")]
    Open { path: String, source: io::Error },
}
