//! Jail filesystem materialization.
//!
//! A jail is populated from a line-oriented manifest:
//!
//! ```text
//! # comment
//! /usr/lib/locale
//! /usr/bin:
//! gcc
//! cc <- gcc
//! /etc/hostname <- /var/jails/hostname [cp]
//! /var/cache/shared <- /srv/shared [bind-ro]
//! ```
//!
//! A line ending in `:` sets the source-directory context for subsequent
//! relative entries. An entry copies `SRC` (default: the destination path
//! itself) to `DEST` inside the jail. Identical regular files are
//! deduplicated with hardlinks, optionally through a shared skeleton cache
//! reused across jails; symlinks are copied literally and their targets
//! materialized one hop outward; directories that are allow-listed mount
//! points on the host get the same filesystem mounted in the jail.
//!
//! All bookkeeping lives in a [`Session`] so one CLI invocation is one
//! single-writer state machine; nothing here is global. Entry failures are
//! reported and accumulated, never fatal: one bad line must not keep the
//! rest of a large manifest from staging.

use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::process::Command;

use crate::mounts::{BindMount, MountTable};
use crate::path::{noendslash, parent_dir};
use crate::trace::{gid_name, uid_name, Trace};

/// Per-destination processing state. A destination is handled at most once
/// per run; re-listing it is harmless and changes nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CopyStatus {
    Copied,
    LinkedFromSkeleton,
    Mounted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ensured {
    Existed,
    Created,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct EntryFlags {
    /// `[cp]`: always copy content, even for symlinks, never hardlink.
    pub cp: bool,
    /// `[bind]` / `[bind-ro]`: bind-mount instead of copying.
    pub bind: bool,
    pub bind_ro: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ManifestLine {
    Context(String),
    Entry {
        dst: String,
        src: String,
        flags: EntryFlags,
    },
}

/// Outcome of one copy operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Copied {
    /// Fresh object at the destination; carries the source's `st_mode`.
    Done(libc::mode_t),
    /// Destination was already handled this run.
    Seen,
    Failed,
}

/// The identity tuple that stands in for file content.
///
/// Two files agreeing on `(mode, uid, gid, size, mtime)` are treated as the
/// same file for idempotent re-runs and skeleton cache reuse. This is a
/// deliberate speed/safety tradeoff carried over intact: distinct contents
/// with colliding metadata would be wrongly unified, which hashing would
/// catch at the cost of reading every file on every run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileIdent {
    pub mode: libc::mode_t,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub size: libc::off_t,
    pub mtime: libc::time_t,
}

impl From<&libc::stat> for FileIdent {
    fn from(st: &libc::stat) -> Self {
        FileIdent {
            mode: st.st_mode,
            uid: st.st_uid,
            gid: st.st_gid,
            size: st.st_size,
            mtime: st.st_mtime,
        }
    }
}

/// One jail-construction run.
pub struct Session<'a> {
    /// Jail root, no trailing slash.
    dstroot: String,
    /// Skeleton cache directory, no trailing slash.
    linkdir: Option<String>,
    mounts: &'a MountTable,
    trace: Trace,
    /// Bind mounts applied later, in the namespace-entering child.
    defer_binds: bool,
    pub deferred_binds: Vec<BindMount>,
    dir_cache: HashMap<String, Option<Ensured>>,
    dst_table: HashMap<String, CopyStatus>,
    devino: HashMap<(libc::dev_t, libc::ino_t), String>,
    failed: bool,
}

impl<'a> Session<'a> {
    pub fn new(
        dstroot: &str,
        linkdir: Option<&str>,
        mounts: &'a MountTable,
        defer_binds: bool,
        trace: Trace,
    ) -> Self {
        Session {
            dstroot: noendslash(dstroot).to_string(),
            linkdir: linkdir.map(|d| noendslash(d).to_string()),
            mounts,
            trace,
            defer_binds,
            deferred_binds: Vec::new(),
            dir_cache: HashMap::new(),
            dst_table: HashMap::new(),
            devino: HashMap::new(),
            failed: false,
        }
    }

    /// Record a directory as already existing (created by the validator,
    /// possibly only notionally under dry-run).
    pub fn assume_dir(&mut self, path: &str) {
        self.dir_cache
            .insert(noendslash(path).to_string(), Some(Ensured::Existed));
    }

    pub fn ok(&self) -> bool {
        !self.failed
    }

    /// Run a whole manifest against the jail root. Returns `false` if any entry
    /// failed; processing always continues past failures.
    pub fn construct(&mut self, text: &str) -> bool {
        let root = self.dstroot.clone();
        let _ = self.x_chmod(&root, 0o755);
        let _ = self.x_lchown(&root, 0, 0);
        self.dst_table
            .insert(format!("{}/", self.dstroot), CopyStatus::Copied);

        let mut src_ctx = "/".to_string();
        for raw in text.lines() {
            match parse_manifest_line(raw, &src_ctx) {
                None => {}
                Some(ManifestLine::Context(dir)) => src_ctx = dir,
                Some(ManifestLine::Entry { dst, src, flags }) => {
                    if flags.bind {
                        self.handle_bind(&src, &dst, flags.bind_ro);
                    } else {
                        self.handle_copy(&src, &dst, flags.cp);
                    }
                }
            }
        }
        !self.failed
    }

    /// Materialize a single `SRC -> DEST` pair, `dest` relative to the jail
    /// root with a leading slash.
    pub fn copy_entry(&mut self, src: &str, dest: &str, cp: bool) -> bool {
        !matches!(self.handle_copy(src, dest, cp), Copied::Failed)
    }

    fn fail(&mut self, what: &str, err: &io::Error) -> Copied {
        eprintln!("{what}: {err}");
        self.failed = true;
        Copied::Failed
    }

    fn handle_bind(&mut self, src: &str, subdst: &str, readonly: bool) {
        let dst = format!("{}{}", self.dstroot, subdst);
        if self.dst_table.contains_key(&dst) {
            return;
        }
        self.dst_table.insert(dst.clone(), CopyStatus::Mounted);
        let bind = BindMount {
            source: src.to_string(),
            target: subdst.to_string(),
            readonly,
        };
        if self.defer_binds {
            self.deferred_binds.push(bind);
            return;
        }
        if self.ensure_dir(&dst, 0o755, true).is_err() {
            self.fail(&dst, &io::Error::last_os_error());
            return;
        }
        if let Err(e) = self
            .mounts
            .bind(&bind.source, &dst, bind.readonly, &self.trace)
        {
            self.fail(&dst, &e);
        }
    }

    fn handle_copy(&mut self, src: &str, subdst: &str, cp: bool) -> Copied {
        debug_assert!(subdst.starts_with('/'));
        let dst = format!("{}{}", self.dstroot, subdst);
        if self.dst_table.contains_key(&dst) {
            return Copied::Seen;
        }
        self.dst_table.insert(dst.clone(), CopyStatus::Copied);

        // materialize missing ancestors first, by recursing on the parent
        // pair; the jail root's trailing-slash entry terminates the descent
        if !dst.ends_with('/') {
            let parent_dst = parent_dir(&dst).to_string();
            if !self
                .dir_cache
                .contains_key(noendslash(&parent_dst))
            {
                if let Err(e) = lstat(&parent_dst) {
                    if e.raw_os_error() != Some(libc::ENOENT) {
                        return self.fail(&parent_dst, &e);
                    }
                    let parent_sub = &parent_dst[self.dstroot.len()..];
                    let parent_src = parent_dir(src).to_string();
                    if self.handle_copy(&parent_src, parent_sub, false) == Copied::Failed {
                        return Copied::Failed;
                    }
                    if let Err(e) = lstat(&parent_dst) {
                        if self.trace.live() {
                            return self.fail(&parent_dst, &e);
                        }
                    }
                }
            }
        }

        let ss = match lstat(src) {
            Ok(st) => st,
            Err(e) => return self.fail(&format!("lstat {src}"), &e),
        };
        let src_ident = FileIdent::from(&ss);
        let fmt = ss.st_mode & libc::S_IFMT;

        // what ends up on disk; chmod/chown below reconcile differences
        let mut out_mode = ss.st_mode;
        let mut out_uid: libc::uid_t = 0;
        let mut out_gid: libc::gid_t = 0;

        if fmt == libc::S_IFREG && !cp {
            if let Ok(ds) = lstat(&dst) {
                if FileIdent::from(&ds) == src_ident {
                    // idempotent re-run: same tuple, nothing to do
                    return Copied::Done(ss.st_mode);
                }
            }
            if let Some(linkdir) = self.linkdir.clone() {
                let cache = format!("{linkdir}{src}");
                let cache_fresh = match lstat(&cache) {
                    Ok(cs) => FileIdent::from(&cs) == src_ident,
                    Err(_) => false,
                };
                if !cache_fresh {
                    let cache_parent = parent_dir(&cache).to_string();
                    if self.ensure_dir(&cache_parent, 0o700, true).is_err() {
                        return self.fail(
                            &format!("mkdir -p {cache_parent}"),
                            &io::Error::last_os_error(),
                        );
                    }
                    if let Err(e) = self.copy_out_of_process(src, &cache) {
                        return self.fail(&cache, &e);
                    }
                }
                if let Err(e) = self.x_link(&cache, &dst) {
                    return self.fail(&dst, &e);
                }
                self.dst_table.insert(dst, CopyStatus::LinkedFromSkeleton);
                return Copied::Done(ss.st_mode);
            }
            if let Some(prior) = self.devino.get(&(ss.st_dev, ss.st_ino)).cloned() {
                // same-run dedup: an identical inode already landed here
                if let Err(e) = self.x_link(&prior, &dst) {
                    return self.fail(&dst, &e);
                }
                return Copied::Done(ss.st_mode);
            }
            self.devino.insert((ss.st_dev, ss.st_ino), dst.clone());
            if let Err(e) = self.copy_out_of_process(src, &dst) {
                return self.fail(&dst, &e);
            }
            out_uid = ss.st_uid;
            out_gid = ss.st_gid;
        } else if fmt == libc::S_IFREG || (fmt == libc::S_IFLNK && cp) {
            if let Err(e) = self.copy_out_of_process(src, &dst) {
                return self.fail(&dst, &e);
            }
            out_uid = ss.st_uid;
            out_gid = ss.st_gid;
        } else if fmt == libc::S_IFDIR {
            let perm = ss.st_mode
                & (libc::S_ISUID | libc::S_ISGID | libc::S_IRWXU | libc::S_IRWXG | libc::S_IRWXO);
            if self.ensure_dir(&dst, perm, true).is_err() {
                return self.fail(&dst, &io::Error::last_os_error());
            }
            out_mode = perm | libc::S_IFDIR;
        } else if matches!(fmt, libc::S_IFCHR | libc::S_IFBLK | libc::S_IFIFO) {
            let mode = ss.st_mode
                & (libc::S_IFMT
                    | libc::S_ISUID
                    | libc::S_ISGID
                    | libc::S_IRWXU
                    | libc::S_IRWXG
                    | libc::S_IRWXO);
            if let Err(e) = self.x_mknod(&dst, mode, ss.st_rdev) {
                return self.fail(&dst, &e);
            }
            out_mode = mode;
        } else if fmt == libc::S_IFLNK {
            let target = match std::fs::read_link(src) {
                Ok(t) => t.to_string_lossy().into_owned(),
                Err(e) => return self.fail(&format!("readlink {src}"), &e),
            };
            if let Err(e) = self.x_symlink(&target, &dst) {
                return self.fail(&dst, &e);
            }
            // reach one hop past the link so the file it names exists too,
            // but never into /proc
            if let Some((rsrc, rdst)) =
                resolve_symlink_target(src, &dst, &target, &self.dstroot)
            {
                let rsub = rdst[self.dstroot.len()..].to_string();
                if !rsub.starts_with("/proc/") {
                    self.handle_copy(&rsrc, &rsub, false);
                }
            }
            return Copied::Done(ss.st_mode);
        } else {
            return self.fail(src, &io::Error::from_raw_os_error(libc::EINVAL));
        }

        if out_mode != ss.st_mode && self.x_chmod(&dst, ss.st_mode & 0o7777).is_err() {
            return Copied::Failed;
        }
        if (out_uid != ss.st_uid || out_gid != ss.st_gid)
            && self.x_lchown(&dst, ss.st_uid, ss.st_gid).is_err()
        {
            return Copied::Failed;
        }

        if fmt == libc::S_IFDIR {
            if let Some(slot) = self.mounts.get(src) {
                if slot.allowed {
                    let slot = slot.clone();
                    if let Err(e) = self.mounts.apply(&slot, &dst, false, &self.trace) {
                        return self.fail(&format!("mount {dst}"), &e);
                    }
                    self.dst_table.insert(dst, CopyStatus::Mounted);
                }
            }
        }

        Copied::Done(ss.st_mode)
    }

    /// `mkdir -p` with a result cache, creating missing ancestors with the
    /// same mode.
    pub fn ensure_dir(
        &mut self,
        pathname: &str,
        mode: libc::mode_t,
        nolink: bool,
    ) -> Result<Ensured, ()> {
        let key = noendslash(pathname).to_string();
        if let Some(cached) = self.dir_cache.get(&key) {
            return cached.ok_or(());
        }
        let result = self.ensure_dir_uncached(&key, mode, nolink);
        self.dir_cache.insert(key, result.ok());
        result
    }

    fn ensure_dir_uncached(
        &mut self,
        pathname: &str,
        mode: libc::mode_t,
        nolink: bool,
    ) -> Result<Ensured, ()> {
        let st = if nolink {
            lstat(pathname)
        } else {
            stat(pathname)
        };
        match st {
            Ok(st) if st.st_mode & libc::S_IFMT == libc::S_IFDIR => Ok(Ensured::Existed),
            Ok(_) => Err(()),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                let parent = parent_dir(pathname);
                if parent.len() < pathname.len() && !parent.is_empty() {
                    self.ensure_dir(&parent.to_string(), mode, false)?;
                }
                self.trace
                    .say(format_args!("mkdir -m 0{mode:o} {pathname}"));
                if self.trace.live() {
                    let path_c = CString::new(pathname).map_err(|_| ())?;
                    if unsafe { libc::mkdir(path_c.as_ptr(), mode) } != 0 {
                        return Err(());
                    }
                }
                Ok(Ensured::Created)
            }
            Err(_) => Err(()),
        }
    }

    /// Copy through `/bin/cp -p`: content copying stays out of this
    /// privileged process.
    fn copy_out_of_process(&mut self, src: &str, dst: &str) -> io::Result<()> {
        self.trace
            .say(format_args!("rm -f {dst}; cp -p {src} {dst}"));
        if !self.trace.live() {
            return Ok(());
        }
        match std::fs::remove_file(dst) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        let status = Command::new("/bin/cp")
            .arg("-p")
            .arg(src)
            .arg(dst)
            .status()?;
        if !status.success() {
            return Err(io::Error::other(format!(
                "/bin/cp {src} {dst}: exit status {status}"
            )));
        }
        Ok(())
    }

    fn x_link(&mut self, oldpath: &str, newpath: &str) -> io::Result<()> {
        self.trace
            .say(format_args!("rm -f {newpath}; ln {oldpath} {newpath}"));
        if !self.trace.live() {
            return Ok(());
        }
        match std::fs::remove_file(newpath) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
            _ => {}
        }
        std::fs::hard_link(oldpath, newpath)
    }

    fn x_symlink(&mut self, target: &str, newpath: &str) -> io::Result<()> {
        self.trace.say(format_args!("ln -s {target} {newpath}"));
        if !self.trace.live() {
            return Ok(());
        }
        match std::os::unix::fs::symlink(target, newpath) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                match std::fs::read_link(newpath) {
                    Ok(existing) if existing.to_string_lossy() == target => Ok(()),
                    _ => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    fn x_mknod(&mut self, path: &str, mode: libc::mode_t, dev: libc::dev_t) -> io::Result<()> {
        self.trace
            .say(format_args!("mknod -m 0{:o} {path} {}", mode & 0o7777, dev_kind(mode, dev)));
        if !self.trace.live() {
            return Ok(());
        }
        let path_c = CString::new(path)?;
        if unsafe { libc::mknod(path_c.as_ptr(), mode, dev) } != 0 {
            let err = io::Error::last_os_error();
            let identical = err.raw_os_error() == Some(libc::EEXIST)
                && stat(path)
                    .map(|st| st.st_mode == mode && st.st_rdev == dev)
                    .unwrap_or(false);
            if !identical {
                return Err(err);
            }
        }
        Ok(())
    }

    fn x_chmod(&mut self, path: &str, mode: libc::mode_t) -> Result<(), ()> {
        self.trace.say(format_args!("chmod 0{mode:o} {path}"));
        if !self.trace.live() {
            return Ok(());
        }
        let path_c = CString::new(path).map_err(|_| ())?;
        if unsafe { libc::chmod(path_c.as_ptr(), mode) } != 0 {
            self.fail(&format!("chmod {path}"), &io::Error::last_os_error());
            return Err(());
        }
        Ok(())
    }

    fn x_lchown(&mut self, path: &str, owner: libc::uid_t, group: libc::gid_t) -> Result<(), ()> {
        self.trace.say(format_args!(
            "chown -h {}:{} {path}",
            uid_name(owner),
            gid_name(group)
        ));
        if !self.trace.live() {
            return Ok(());
        }
        let path_c = CString::new(path).map_err(|_| ())?;
        if unsafe { libc::lchown(path_c.as_ptr(), owner, group) } != 0 {
            self.fail(&format!("chown {path}"), &io::Error::last_os_error());
            return Err(());
        }
        Ok(())
    }
}

fn lstat(path: &str) -> io::Result<libc::stat> {
    let path_c = CString::new(path)?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::lstat(path_c.as_ptr(), &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

fn stat(path: &str) -> io::Result<libc::stat> {
    let path_c = CString::new(path)?;
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::stat(path_c.as_ptr(), &mut st) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

fn dev_kind(mode: libc::mode_t, dev: libc::dev_t) -> String {
    let major = libc::major(dev);
    let minor = libc::minor(dev);
    match mode & libc::S_IFMT {
        libc::S_IFCHR => format!("c {major} {minor}"),
        libc::S_IFBLK => format!("b {major} {minor}"),
        libc::S_IFIFO => "p".to_string(),
        _ => format!("{mode} {dev}"),
    }
}

/// Resolve what a copied symlink points at, yielding the host-side source
/// and jail-side destination of the target.
///
/// Relative links climb one component for the link's own name plus one per
/// leading `../`; the climb may never escape the jail root. Absolute links
/// resolve against the host on the source side and against the jail root
/// on the destination side.
pub(crate) fn resolve_symlink_target(
    src: &str,
    dst: &str,
    link: &str,
    dstroot: &str,
) -> Option<(String, String)> {
    if link.starts_with('/') {
        return Some((link.to_string(), format!("{dstroot}{link}")));
    }
    let mut src = src.to_string();
    let mut dst = dst.to_string();
    let mut link = link;
    loop {
        if src.len() == 1 {
            return None;
        }
        let srcslash = src[..src.len() - 1].rfind('/')?;
        let dstslash = dst[..dst.len() - 1].rfind('/')?;
        if dstslash < dstroot.len() {
            return None;
        }
        src.truncate(srcslash + 1);
        dst.truncate(dstslash + 1);
        if link.len() > 3 && link.starts_with("../") {
            link = &link[3..];
        } else {
            break;
        }
    }
    Some((format!("{src}{link}"), format!("{dst}{link}")))
}

/// Parse one manifest line against the current source-directory context.
pub(crate) fn parse_manifest_line(raw: &str, src_ctx: &str) -> Option<ManifestLine> {
    let mut line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    if line.ends_with(':') {
        let body = &line[..line.len() - 1];
        let mut dir = if body == "." {
            "/".to_string()
        } else if let Some(rest) = body.strip_prefix("./") {
            format!("/{rest}")
        } else {
            body.to_string()
        };
        if !dir.starts_with('/') {
            dir.insert(0, '/');
        }
        while dir.contains("//") {
            dir = dir.replace("//", "/");
        }
        if !dir.ends_with('/') {
            dir.push('/');
        }
        return Some(ManifestLine::Context(dir));
    }

    let mut flags = EntryFlags::default();
    if line.ends_with(']') {
        let open = line.rfind('[')?;
        for token in line[open + 1..line.len() - 1]
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|t| !t.is_empty())
        {
            match token {
                "cp" => flags.cp = true,
                "bind" => flags.bind = true,
                "bind-ro" => {
                    flags.bind = true;
                    flags.bind_ro = true;
                }
                _ => {}
            }
        }
        line = line[..open].trim_end();
        if line.is_empty() {
            return None;
        }
    }

    let (dst_part, src_part) = match line.find(" <- ") {
        Some(i) => (line[..i].trim_end(), Some(line[i + 4..].trim_start())),
        None => (line, None),
    };
    let src = match src_part {
        Some(s) if s.starts_with('/') => s.to_string(),
        Some(s) => format!("{src_ctx}{s}"),
        None if dst_part.starts_with('/') => dst_part.to_string(),
        None => format!("{src_ctx}{dst_part}"),
    };
    let dst = if dst_part.starts_with('/') {
        dst_part.to_string()
    } else {
        format!("{src_ctx}{dst_part}")
    };
    Some(ManifestLine::Entry { dst, src, flags })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(line: &str, ctx: &str) -> (String, String, EntryFlags) {
        match parse_manifest_line(line, ctx) {
            Some(ManifestLine::Entry { dst, src, flags }) => (dst, src, flags),
            other => panic!("expected entry, got {other:?}"),
        }
    }

    #[test]
    fn blank_and_comment_lines_ignored() {
        assert_eq!(parse_manifest_line("", "/"), None);
        assert_eq!(parse_manifest_line("   ", "/"), None);
        assert_eq!(parse_manifest_line("# /usr/bin/gcc", "/"), None);
    }

    #[test]
    fn context_lines() {
        assert_eq!(
            parse_manifest_line("/usr/bin:", "/"),
            Some(ManifestLine::Context("/usr/bin/".into()))
        );
        assert_eq!(
            parse_manifest_line("./lib:", "/"),
            Some(ManifestLine::Context("/lib/".into()))
        );
        assert_eq!(
            parse_manifest_line(".:", "/usr/"),
            Some(ManifestLine::Context("/".into()))
        );
        assert_eq!(
            parse_manifest_line("usr//share/:", "/"),
            Some(ManifestLine::Context("/usr/share/".into()))
        );
    }

    #[test]
    fn relative_entry_uses_context() {
        let (dst, src, flags) = entry("gcc", "/usr/bin/");
        assert_eq!(dst, "/usr/bin/gcc");
        assert_eq!(src, "/usr/bin/gcc");
        assert_eq!(flags, EntryFlags::default());
    }

    #[test]
    fn absolute_entry_ignores_context() {
        let (dst, src, _) = entry("/etc/passwd", "/usr/bin/");
        assert_eq!(dst, "/etc/passwd");
        assert_eq!(src, "/etc/passwd");
    }

    #[test]
    fn arrow_separates_dst_and_src() {
        let (dst, src, _) = entry("cc <- /usr/bin/gcc", "/usr/bin/");
        assert_eq!(dst, "/usr/bin/cc");
        assert_eq!(src, "/usr/bin/gcc");

        let (dst, src, _) = entry("/etc/hostname <- /srv/jail-hostname", "/");
        assert_eq!(dst, "/etc/hostname");
        assert_eq!(src, "/srv/jail-hostname");

        // a relative source resolves against the context, like the dest
        let (dst, src, _) = entry("cc <- gcc", "/usr/bin/");
        assert_eq!(dst, "/usr/bin/cc");
        assert_eq!(src, "/usr/bin/gcc");
    }

    #[test]
    fn annotations_parse_and_strip() {
        let (dst, _, flags) = entry("/bin/sh [cp]", "/");
        assert_eq!(dst, "/bin/sh");
        assert!(flags.cp);
        assert!(!flags.bind);

        let (_, src, flags) = entry("/mnt/data <- /srv/data [bind-ro]", "/");
        assert_eq!(src, "/srv/data");
        assert!(flags.bind && flags.bind_ro);

        let (_, _, flags) = entry("/mnt/data <- /srv/data [bind, cp]", "/");
        assert!(flags.bind && flags.cp && !flags.bind_ro);
    }

    #[test]
    fn symlink_target_absolute() {
        let r = resolve_symlink_target("/usr/lib/libz.so", "/jail/usr/lib/libz.so", "/lib/libz.so.1", "/jail");
        assert_eq!(
            r,
            Some(("/lib/libz.so.1".into(), "/jail/lib/libz.so.1".into()))
        );
    }

    #[test]
    fn symlink_target_sibling() {
        let r = resolve_symlink_target(
            "/usr/lib/libz.so",
            "/jail/usr/lib/libz.so",
            "libz.so.1.2",
            "/jail",
        );
        assert_eq!(
            r,
            Some((
                "/usr/lib/libz.so.1.2".into(),
                "/jail/usr/lib/libz.so.1.2".into()
            ))
        );
    }

    #[test]
    fn symlink_target_climbs_dotdot() {
        let r = resolve_symlink_target(
            "/usr/lib/x/link",
            "/jail/usr/lib/x/link",
            "../shared/real",
            "/jail",
        );
        assert_eq!(
            r,
            Some((
                "/usr/lib/shared/real".into(),
                "/jail/usr/lib/shared/real".into()
            ))
        );
    }

    #[test]
    fn symlink_target_cannot_escape_jail() {
        let r = resolve_symlink_target("/a/link", "/jail/a/link", "../../etc/passwd", "/jail");
        assert_eq!(r, None);
    }

    #[test]
    fn file_ident_equality() {
        let a = FileIdent {
            mode: 0o100644,
            uid: 0,
            gid: 0,
            size: 10,
            mtime: 1000,
        };
        let mut b = a;
        assert_eq!(a, b);
        b.mtime = 1001;
        assert_ne!(a, b);
    }
}
