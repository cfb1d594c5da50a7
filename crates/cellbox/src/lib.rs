//! cellbox: a filesystem + namespace jail for untrusted code.
//!
//! A jail is a self-contained directory tree into which a command is
//! confined and run as an unprivileged user, its terminal relayed back to
//! the caller. The crate runs with root privilege and is built around
//! three defenses:
//!
//! - **Policy + path validation** — a root-owned policy file must
//!   explicitly enable jails under a directory, and the target path is
//!   walked component-by-component through `O_NOFOLLOW` directory handles
//!   so a concurrent symlink swap fails instead of redirecting privileged
//!   filesystem work.
//! - **Materialization** — the jail's contents come from a declarative
//!   file list; identical files are hardlink-deduplicated, optionally
//!   through a skeleton cache shared across jails, and special
//!   filesystems are re-mounted inside from a fixed allow-list.
//! - **Supervised execution** — the command runs in fresh mount/IPC/PID
//!   namespaces behind a chroot, on its own pty, with privilege dropped
//!   irreversibly before exec; the supervisor relays I/O with wall-clock
//!   timeout and an in-band cancel sequence.
//!
//! The CLI in `cellbox-cli` wires these together for the four actions
//! `init`, `run`, `rm`, and `mv`.

pub mod error;
pub mod exec;
pub mod jaildir;
pub mod materialize;
pub mod mounts;
pub mod owner;
pub mod path;
pub mod policy;
pub mod relay;
pub mod trace;

pub use error::{ExecError, JailError, OwnerError, PolicyError};
pub use exec::{exec_jail, ExecConfig, PidFile};
pub use jaildir::{Action, JailDir, WalkRequest};
pub use materialize::Session;
pub use mounts::{BindMount, MountSlot, MountTable};
pub use owner::Owner;
pub use path::JailPath;
pub use policy::{Authority, Authorization, POLICY_PATH};
pub use trace::Trace;
