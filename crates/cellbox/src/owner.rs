//! Resolution of the unprivileged account that owns a jail.

use std::fs;
use std::io;

use nix::unistd::{Gid, Uid, User};

use crate::error::OwnerError;

const SHELLS_FILE: &str = "/etc/shells";

/// The identity a sandboxed command runs as: never root, home confined to
/// `/home`, login shell from the system's allowed list.
#[derive(Debug, Clone)]
pub struct Owner {
    pub uid: Uid,
    pub gid: Gid,
    pub home: String,
    pub shell: String,
}

impl Owner {
    pub fn resolve(name: &str) -> Result<Self, OwnerError> {
        if name.len() >= 1024 {
            return Err(OwnerError::NameTooLong(name.to_string()));
        }
        let user = User::from_name(name)
            .map_err(|e| OwnerError::Lookup {
                user: name.to_string(),
                source: io::Error::from_raw_os_error(e as i32),
            })?
            .ok_or_else(|| OwnerError::NoSuchUser(name.to_string()))?;

        let pw_dir = user.dir.to_string_lossy().into_owned();
        let home = if pw_dir == "/" {
            "/home/nobody".to_string()
        } else if pw_dir.starts_with("/home/") {
            pw_dir
        } else {
            return Err(OwnerError::HomeNotUnderHome {
                user: name.to_string(),
                home: pw_dir,
            });
        };

        let shell = user.shell.to_string_lossy().into_owned();
        if !shell_allowed(&shell) {
            return Err(OwnerError::ShellNotAllowed {
                user: name.to_string(),
                shell,
            });
        }

        if user.uid.is_root() {
            return Err(OwnerError::RootUser(name.to_string()));
        }

        Ok(Owner {
            uid: user.uid,
            gid: user.gid,
            home,
            shell,
        })
    }
}

fn shell_allowed(shell: &str) -> bool {
    if shell == "/bin/bash" || shell == "/bin/sh" {
        return true;
    }
    match fs::read_to_string(SHELLS_FILE) {
        Ok(text) => parse_shells(&text).iter().any(|s| s == shell),
        Err(_) => false,
    }
}

fn parse_shells(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_shells_skips_comments() {
        let shells = parse_shells("# /etc/shells\n/bin/bash\n\n/usr/bin/zsh\n");
        assert_eq!(shells, vec!["/bin/bash", "/usr/bin/zsh"]);
    }

    #[test]
    fn bash_and_sh_always_allowed() {
        assert!(shell_allowed("/bin/bash"));
        assert!(shell_allowed("/bin/sh"));
    }

    #[test]
    fn root_is_rejected() {
        if let Ok(owner) = Owner::resolve("root") {
            panic!("root resolved as jail owner: {owner:?}");
        }
    }
}
