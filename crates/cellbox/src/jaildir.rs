//! Jail directory validation and manipulation.
//!
//! The walk defends against symlink-swap races: every component is opened
//! with `openat(parent_fd, component, O_PATH|O_NOFOLLOW)` relative to the
//! descriptor of the component before it, never through a re-resolved
//! absolute path. Above the policy boundary every ancestor must already
//! exist, be a directory, be owned by root, and be writable by root alone;
//! at or below the boundary, missing directories may be created for
//! `init`/`run`. The final handle keeps the jail root's *parent* open so
//! that later rename and removal go through `renameat`/`unlinkat` against
//! a directory the walk already vetted.

use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::error::JailError;
use crate::mounts::MountTable;
use crate::path::{absolute, clean_filename, endslash, JailPath};
use crate::policy::Authority;
use crate::trace::{gid_name, uid_name, Trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Init,
    Run,
    Rm,
    Mv,
}

/// A validated jail directory.
///
/// Holding `parent_fd` (an `O_PATH` descriptor of the jail root's parent)
/// pins the vetted directory identity: rename and removal act through it,
/// immune to concurrent path substitution. The descriptor must be dropped
/// before any command is exec'd in the jail.
#[derive(Debug)]
pub struct JailDir {
    /// Absolute jail path, trailing slash included.
    pub dir: String,
    /// Everything up to the last component.
    pub parent: String,
    /// The last component of `dir`.
    pub component: String,
    /// Policy boundary covering `dir`, trailing slash included.
    pub permdir: String,
    /// Device of the jail root, for one-file-system removal.
    pub dev: libc::dev_t,
    /// Skeleton cache directory, when requested and policy-approved.
    pub skeleton: Option<String>,
    /// Directories the walk created (or simulated creating), so the
    /// materializer can treat them as existing.
    pub created: Vec<String>,
    parent_fd: Option<OwnedFd>,
}

pub struct WalkRequest<'a> {
    pub action: Action,
    pub authority: &'a Authority,
    pub skeleton: Option<&'a str>,
    /// `rm --force`: an absent target is success, not an error.
    pub force: bool,
    pub trace: Trace,
}

impl JailDir {
    /// Authorize and open `raw` for `request.action`.
    ///
    /// Returns `Ok(None)` only for a forced removal of an absent target.
    pub fn open(raw: &str, request: &WalkRequest<'_>) -> Result<Option<JailDir>, JailError> {
        let path = JailPath::new(raw)?;
        let dir = path.as_str().to_string();

        let auth = request.authority.allow_jail(&dir)?;
        if !auth.allowed {
            return Err(JailError::Policy(crate::error::PolicyError::Disabled {
                path: crate::policy::POLICY_PATH.into(),
            }));
        }
        let permdir = endslash(&auth.boundary);
        debug_assert!(dir.starts_with(&permdir));

        let skeleton = match request.skeleton {
            Some(raw_skel) => {
                let abs = endslash(
                    &absolute(raw_skel).map_err(|e| JailError::io(raw_skel, e))?,
                );
                if !request.authority.allow_skeleton(&abs) {
                    return Err(JailError::Policy(
                        crate::error::PolicyError::SkeletonDisabled { dir: abs },
                    ));
                }
                Some(abs)
            }
            None => None,
        };

        let conf_dir = request.authority.conf_dir();
        let trace = &request.trace;

        let bytes = dir.as_bytes();
        let mut last_pos = 0usize;
        let mut fd: RawFd = -1;
        let mut parent_fd: RawFd = -1;
        let mut simulating = false;
        let mut parent = String::new();
        let mut component = String::new();
        let mut dev: libc::dev_t = 0;
        let mut created = Vec::new();

        while last_pos != bytes.len() {
            let mut next_pos = last_pos;
            while next_pos > 0 && next_pos < bytes.len() && bytes[next_pos] != b'/' {
                next_pos += 1;
            }
            if next_pos == 0 {
                next_pos = 1;
            }
            parent = dir[..last_pos].to_string();
            component = dir[last_pos..next_pos].to_string();
            let thisdir = &dir[..next_pos];
            last_pos = next_pos;
            while last_pos != bytes.len() && bytes[last_pos] == b'/' {
                last_pos += 1;
            }
            let is_final = last_pos == bytes.len();
            let allowed_here = last_pos >= permdir.len();

            if parent_fd >= 0 {
                unsafe { libc::close(parent_fd) };
            }
            parent_fd = fd;
            let comp_c = CString::new(component.as_str()).expect("no NUL in path");
            fd = unsafe {
                libc::openat(
                    parent_fd,
                    comp_c.as_ptr(),
                    libc::O_PATH | libc::O_CLOEXEC | libc::O_NOFOLLOW,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                let enoent = err.raw_os_error() == Some(libc::ENOENT);
                if enoent && request.action == Action::Rm && request.force {
                    if parent_fd >= 0 {
                        unsafe { libc::close(parent_fd) };
                    }
                    return Ok(None);
                }
                let may_create = enoent
                    && allowed_here
                    && matches!(request.action, Action::Init | Action::Run);
                if simulating || may_create {
                    trace.say(format_args!("mkdir -m 0755 {thisdir}"));
                    if trace.live()
                        && unsafe { libc::mkdirat(parent_fd, comp_c.as_ptr(), 0o755) } != 0
                    {
                        let source = io::Error::last_os_error();
                        if parent_fd >= 0 {
                            unsafe { libc::close(parent_fd) };
                        }
                        return Err(JailError::Mkdir {
                            path: thisdir.to_string(),
                            source,
                        });
                    }
                    created.push(thisdir.to_string());
                    fd = unsafe {
                        libc::openat(
                            parent_fd,
                            comp_c.as_ptr(),
                            libc::O_CLOEXEC | libc::O_NOFOLLOW,
                        )
                    };
                    // suid/sgid must never survive on a fresh jail root
                    if is_final && (fd >= 0 || trace.dryrun) {
                        trace.say(format_args!("chmod 0755 {thisdir}"));
                        if trace.live() && unsafe { libc::fchmod(fd, 0o755) } != 0 {
                            let source = io::Error::last_os_error();
                            unsafe { libc::close(parent_fd) };
                            return Err(JailError::io(thisdir, source));
                        }
                    }
                    if trace.dryrun {
                        simulating = true;
                        continue;
                    }
                }
                if fd < 0 {
                    if parent_fd >= 0 {
                        unsafe { libc::close(parent_fd) };
                    }
                    return Err(JailError::io(thisdir, err));
                }
            }

            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(fd, &mut st) } != 0 {
                let source = io::Error::last_os_error();
                unsafe { libc::close(fd) };
                if parent_fd >= 0 {
                    unsafe { libc::close(parent_fd) };
                }
                return Err(JailError::io(thisdir, source));
            }
            if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
                unsafe { libc::close(fd) };
                if parent_fd >= 0 {
                    unsafe { libc::close(parent_fd) };
                }
                return Err(JailError::NotADirectory(thisdir.to_string()));
            }
            if !allowed_here && !is_final {
                if st.st_uid != 0 {
                    unsafe { libc::close(fd) };
                    if parent_fd >= 0 {
                        unsafe { libc::close(parent_fd) };
                    }
                    return Err(JailError::NotRootOwned(thisdir.to_string()));
                }
                // the policy file's own directory is allowed looser modes;
                // the file check in Authority::load already vetted it
                let exempt = thisdir == conf_dir;
                if !exempt
                    && ((st.st_gid != 0 && st.st_mode & libc::S_IWGRP != 0)
                        || st.st_mode & libc::S_IWOTH != 0)
                {
                    unsafe { libc::close(fd) };
                    if parent_fd >= 0 {
                        unsafe { libc::close(parent_fd) };
                    }
                    return Err(JailError::WritableByNonRoot(thisdir.to_string()));
                }
            }
            dev = st.st_dev;
        }

        if fd >= 0 {
            unsafe { libc::close(fd) };
        }
        let parent_fd = if parent_fd >= 0 {
            Some(unsafe { OwnedFd::from_raw_fd(parent_fd) })
        } else {
            None
        };
        Ok(Some(JailDir {
            dir,
            parent,
            component,
            permdir,
            dev,
            skeleton,
            created,
            parent_fd,
        }))
    }

    fn parent_fd(&self) -> Result<RawFd, JailError> {
        self.parent_fd
            .as_ref()
            .map(AsRawFd::as_raw_fd)
            .ok_or_else(|| {
                JailError::io(self.dir.as_str(), io::Error::from_raw_os_error(libc::EBADF))
            })
    }

    /// Drop the held parent descriptor. Must happen before exec'ing any
    /// command so the fd cannot leak into the jail.
    pub fn release(&mut self) {
        self.parent_fd = None;
    }

    /// Rename the jail within its boundary. A destination that is an
    /// existing directory receives the jail as a child of itself.
    pub fn rename_to(&self, raw_dst: &str, trace: &Trace) -> Result<(), JailError> {
        let abs = absolute(raw_dst).map_err(|e| JailError::io(raw_dst, e))?;
        let mut newpath =
            clean_filename(&abs).ok_or_else(|| JailError::BadFilename(raw_dst.to_string()))?;
        if newpath.is_empty() || !newpath.starts_with('/') {
            return Err(JailError::BadFilename(raw_dst.to_string()));
        }
        if newpath.len() <= self.permdir.len() || !newpath.starts_with(&self.permdir) {
            return Err(JailError::OutsideBoundary {
                dst: newpath,
                boundary: self.permdir.clone(),
            });
        }
        if let Ok(meta) = std::fs::metadata(&newpath) {
            if meta.is_dir() {
                newpath = format!("{}{}", endslash(&newpath), self.component);
            }
        }
        trace.say(format_args!(
            "mv {}{} {}",
            self.parent, self.component, newpath
        ));
        if !trace.live() {
            return Ok(());
        }
        let parent_fd = self.parent_fd()?;
        let old_c = CString::new(self.component.as_str()).expect("no NUL in path");
        let new_c = CString::new(newpath.as_str()).expect("no NUL in path");
        // newpath is absolute, so the second dirfd is ignored
        if unsafe { libc::renameat(parent_fd, old_c.as_ptr(), parent_fd, new_c.as_ptr()) } != 0 {
            return Err(JailError::io(newpath, io::Error::last_os_error()));
        }
        Ok(())
    }

    /// Unmount everything inside the jail, then remove its tree.
    ///
    /// Unmounting runs deepest-first over the live mount table; removal
    /// descends through directory fds and never crosses onto another
    /// device.
    pub fn remove(
        &mut self,
        mounts: &mut MountTable,
        force: bool,
        trace: &Trace,
    ) -> Result<(), JailError> {
        for target in mounts.targets_under(&self.dir) {
            mounts
                .unmount(&target, trace)
                .map_err(|e| JailError::io(target, e))?;
        }
        let parent_fd = self.parent_fd()?;
        self.remove_recursive(parent_fd, &self.component, &self.dir, mounts, trace)?;
        trace.say(format_args!("rmdir {}", self.dir));
        if trace.live() {
            let comp_c = CString::new(self.component.as_str()).expect("no NUL in path");
            if unsafe { libc::unlinkat(parent_fd, comp_c.as_ptr(), libc::AT_REMOVEDIR) } != 0 {
                let err = io::Error::last_os_error();
                if !(err.raw_os_error() == Some(libc::ENOENT) && force) {
                    return Err(JailError::io(format!("rmdir {}", self.dir), err));
                }
            }
        }
        Ok(())
    }

    fn remove_recursive(
        &self,
        parent_fd: RawFd,
        component: &str,
        dirname: &str,
        mounts: &MountTable,
        trace: &Trace,
    ) -> Result<(), JailError> {
        let comp_c = CString::new(component).expect("no NUL in path");
        let dirfd =
            unsafe { libc::openat(parent_fd, comp_c.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) };
        if dirfd < 0 {
            return Err(JailError::io(dirname, io::Error::last_os_error()));
        }
        let mut st: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(dirfd, &mut st) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(dirfd) };
            return Err(JailError::io(dirname, err));
        }
        if st.st_dev != self.dev {
            // one-file-system: a surviving mount is not ours to empty
            unsafe { libc::close(dirfd) };
            return Ok(());
        }
        let dirp = unsafe { libc::fdopendir(dirfd) };
        if dirp.is_null() {
            let err = io::Error::last_os_error();
            unsafe { libc::close(dirfd) };
            return Err(JailError::io(dirname, err));
        }
        let result = self.remove_entries(dirp, dirfd, dirname, mounts, trace);
        unsafe { libc::closedir(dirp) };
        result
    }

    fn remove_entries(
        &self,
        dirp: *mut libc::DIR,
        dirfd: RawFd,
        dirname: &str,
        mounts: &MountTable,
        trace: &Trace,
    ) -> Result<(), JailError> {
        loop {
            let entry = unsafe { libc::readdir(dirp) };
            if entry.is_null() {
                return Ok(());
            }
            let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
            let name_str = name.to_string_lossy().into_owned();
            let is_dir = unsafe { (*entry).d_type } == libc::DT_DIR;
            if is_dir {
                if name_str == "." || name_str == ".." {
                    continue;
                }
                let next_dirname = format!("{dirname}{name_str}");
                if mounts.was_unmounted(&next_dirname) {
                    continue;
                }
                self.remove_recursive(
                    dirfd,
                    &name_str,
                    &endslash(&next_dirname),
                    mounts,
                    trace,
                )?;
            }
            let op = if is_dir { "rmdir " } else { "rm " };
            trace.say(format_args!("{op}{dirname}{name_str}"));
            if trace.live() {
                let flags = if is_dir { libc::AT_REMOVEDIR } else { 0 };
                let name_c = CString::new(name_str.as_str()).expect("no NUL in dirent");
                if unsafe { libc::unlinkat(dirfd, name_c.as_ptr(), flags) } != 0 {
                    return Err(JailError::io(
                        format!("{op}{dirname}{name_str}"),
                        io::Error::last_os_error(),
                    ));
                }
            }
        }
    }

    /// Normalize ownership of everything under the jail's `/home`,
    /// assigning each top-level entry to the matching system account.
    pub fn chown_home(&self, mounts: &MountTable, trace: &Trace) -> Result<(), JailError> {
        let parent_fd = self.parent_fd()?;
        let rel = format!("{}/home", self.component);
        let rel_c = CString::new(rel.as_str()).expect("no NUL in path");
        let dirfd = unsafe {
            libc::openat(
                parent_fd,
                rel_c.as_ptr(),
                libc::O_RDONLY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
            )
        };
        let homedir = format!("{}home/", self.dir);
        if dirfd < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) && trace.dryrun {
                return Ok(());
            }
            return Err(JailError::io(homedir, err));
        }
        self.chown_recursive(dirfd, &homedir, 1, 0, 0, mounts, trace)
    }

    fn chown_recursive(
        &self,
        dirfd: RawFd,
        dirbuf: &str,
        depth: u32,
        owner: libc::uid_t,
        group: libc::gid_t,
        mounts: &MountTable,
        trace: &Trace,
    ) -> Result<(), JailError> {
        let home_map = if depth == 1 && dirbuf.ends_with("/home/") {
            Some(account_home_map())
        } else {
            None
        };

        let dirp = unsafe { libc::fdopendir(dirfd) };
        if dirp.is_null() {
            let err = io::Error::last_os_error();
            unsafe { libc::close(dirfd) };
            return Err(JailError::io(dirbuf, err));
        }
        let result = (|| {
            loop {
                let entry = unsafe { libc::readdir(dirp) };
                if entry.is_null() {
                    return Ok(());
                }
                let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
                let name_str = name.to_string_lossy().into_owned();
                if name_str == "." || name_str == ".." {
                    continue;
                }
                let d_type = unsafe { (*entry).d_type };
                if d_type == libc::DT_LNK {
                    self.lchown_at(dirfd, &name_str, dirbuf, owner, group, trace)?;
                    continue;
                }
                let (u, g) = home_map
                    .as_ref()
                    .and_then(|m| m.get(&name_str).copied())
                    .unwrap_or((owner, group));
                if d_type == libc::DT_DIR {
                    let sub = format!("{dirbuf}{name_str}");
                    if mounts.get(&sub).is_some() {
                        continue;
                    }
                    let name_c = CString::new(name_str.as_str()).expect("no NUL in dirent");
                    let subfd = unsafe {
                        libc::openat(
                            dirfd,
                            name_c.as_ptr(),
                            libc::O_RDONLY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
                        )
                    };
                    if subfd < 0 {
                        return Err(JailError::io(sub, io::Error::last_os_error()));
                    }
                    trace.say(format_args!("chown {}:{} {sub}", uid_name(u), gid_name(g)));
                    if trace.live() && unsafe { libc::fchown(subfd, u, g) } != 0 {
                        let err = io::Error::last_os_error();
                        unsafe { libc::close(subfd) };
                        return Err(JailError::io(sub, err));
                    }
                    self.chown_recursive(
                        subfd,
                        &endslash(&sub),
                        depth + 1,
                        u,
                        g,
                        mounts,
                        trace,
                    )?;
                } else {
                    self.lchown_at(dirfd, &name_str, dirbuf, u, g, trace)?;
                }
            }
        })();
        unsafe { libc::closedir(dirp) };
        result
    }

    fn lchown_at(
        &self,
        dirfd: RawFd,
        name: &str,
        dirbuf: &str,
        owner: libc::uid_t,
        group: libc::gid_t,
        trace: &Trace,
    ) -> Result<(), JailError> {
        trace.say(format_args!(
            "chown -h {}:{} {dirbuf}{name}",
            uid_name(owner),
            gid_name(group)
        ));
        if !trace.live() {
            return Ok(());
        }
        let name_c = CString::new(name).expect("no NUL in dirent");
        if unsafe {
            libc::fchownat(
                dirfd,
                name_c.as_ptr(),
                owner,
                group,
                libc::AT_SYMLINK_NOFOLLOW,
            )
        } != 0
        {
            return Err(JailError::io(
                format!("{dirbuf}{name}"),
                io::Error::last_os_error(),
            ));
        }
        Ok(())
    }
}

/// Map `/home/<name>` entries to account uid/gid pairs: an account whose
/// home is directly under `/home` claims that entry name, anyone else
/// claims their login name.
fn account_home_map() -> HashMap<String, (libc::uid_t, libc::gid_t)> {
    let mut map = HashMap::new();
    unsafe {
        libc::setpwent();
        loop {
            let pw = libc::getpwent();
            if pw.is_null() {
                break;
            }
            let pw_name = CStr::from_ptr((*pw).pw_name).to_string_lossy().into_owned();
            let pw_dir = CStr::from_ptr((*pw).pw_dir).to_string_lossy().into_owned();
            let key = match pw_dir.strip_prefix("/home/") {
                Some(rest) if !rest.is_empty() && !rest.contains('/') => rest.to_string(),
                _ => pw_name,
            };
            map.insert(key, ((*pw).pw_uid, (*pw).pw_gid));
        }
        libc::endpwent();
    }
    map
}
