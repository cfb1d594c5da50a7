//! The live mount table and jail-side mounting.
//!
//! `/proc/mounts` is read once per process and consulted for two decisions:
//! which host mount points are re-creatable inside a jail (a fixed
//! allow-list of special filesystems), and what is mounted under a jail
//! that `rm` must unmount first. Mount option flags are only ever set from
//! the whitelist below; unknown options ride along as filesystem data
//! strings but can never flip kernel mount flags.

use std::collections::{BTreeMap, HashSet};
use std::ffi::CString;
use std::fs;
use std::io;

use crate::trace::Trace;

const MOUNT_OPTS: &[(&str, libc::c_ulong)] = &[
    ("noatime", libc::MS_NOATIME),
    ("nodev", libc::MS_NODEV),
    ("nodiratime", libc::MS_NODIRATIME),
    ("noexec", libc::MS_NOEXEC),
    ("nosuid", libc::MS_NOSUID),
    ("relatime", libc::MS_RELATIME),
    ("ro", libc::MS_RDONLY),
    ("rw", 0),
    ("strictatime", libc::MS_STRICTATIME),
];

fn find_mount_opt(name: &str) -> Option<libc::c_ulong> {
    MOUNT_OPTS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|&(_, v)| v)
}

/// One mount, either kernel-reported or about to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSlot {
    pub fsname: String,
    pub fstype: String,
    pub flags: libc::c_ulong,
    pub data: String,
    /// Whether this mount may be recreated inside a jail.
    pub allowed: bool,
}

impl MountSlot {
    pub fn new(fsname: &str, fstype: &str, options: &str, dir: &str) -> Self {
        let mut flags = 0;
        let mut data = String::new();
        for opt in options.split(',').filter(|o| !o.is_empty()) {
            let key = opt.split('=').next().unwrap_or(opt);
            match find_mount_opt(key) {
                Some(bits) => flags |= bits,
                None => {
                    if !data.is_empty() {
                        data.push(',');
                    }
                    data.push_str(opt);
                }
            }
        }
        let allowed = matches!(
            (dir, fstype),
            ("/proc", "proc") | ("/sys", "sysfs") | ("/dev", "udev") | ("/dev/pts", "devpts")
        ) || (fstype == "tmpfs" && matches!(dir, "/tmp" | "/run"));
        MountSlot {
            fsname: fsname.to_string(),
            fstype: fstype.to_string(),
            flags,
            data,
            allowed,
        }
    }

    /// Add one option: whitelisted names toggle flag bits, anything else
    /// replaces a same-keyed entry in the data string.
    pub fn add_opt(&mut self, opt: &str) {
        let key = opt.split('=').next().unwrap_or(opt);
        match find_mount_opt(key) {
            Some(0) => self.flags &= !libc::MS_RDONLY,
            Some(bits) => self.flags |= bits,
            None => {
                let kept: Vec<&str> = self
                    .data
                    .split(',')
                    .filter(|o| !o.is_empty() && o.split('=').next() != Some(key))
                    .collect();
                self.data = kept.join(",");
                if !self.data.is_empty() {
                    self.data.push(',');
                }
                self.data.push_str(opt);
            }
        }
    }

    /// Render the options the way `mount -o` would take them, for tracing.
    pub fn debug_opts(&self) -> String {
        let mut out = String::new();
        if self.flags & libc::MS_RDONLY == 0 {
            out.push_str("rw");
        }
        for &(name, bits) in MOUNT_OPTS {
            if bits != 0 && self.flags & bits != 0 {
                if !out.is_empty() {
                    out.push(',');
                }
                out.push_str(name);
            }
        }
        if !self.data.is_empty() {
            if !out.is_empty() {
                out.push(',');
            }
            out.push_str(&self.data);
        }
        out
    }
}

/// A bind mount requested by a jail manifest entry. Applied immediately for
/// `init`, or deferred into the namespace-entering child for `run` so the
/// mount lands in the unshared namespace.
#[derive(Debug, Clone)]
pub struct BindMount {
    /// Host-side source path.
    pub source: String,
    /// Destination relative to the jail root (leading slash).
    pub target: String,
    pub readonly: bool,
}

#[derive(Debug, Default)]
pub struct MountTable {
    slots: BTreeMap<String, MountSlot>,
    /// Targets unmounted under dry-run, so a simulated `rm` skips them.
    unmounted: HashSet<String>,
}

impl MountTable {
    /// Snapshot the live mount table from `/proc/mounts`.
    pub fn load() -> io::Result<Self> {
        let text = fs::read_to_string("/proc/mounts")?;
        Ok(Self::parse(&text))
    }

    pub fn parse(text: &str) -> Self {
        let mut slots = BTreeMap::new();
        for line in text.lines() {
            let mut fields = line.split_whitespace();
            let (Some(fsname), Some(dir), Some(fstype)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let options = fields.next().unwrap_or("");
            let dir = unescape_mount_field(dir);
            let fsname = unescape_mount_field(fsname);
            slots.insert(dir.clone(), MountSlot::new(&fsname, fstype, options, &dir));
        }
        MountTable {
            slots,
            unmounted: HashSet::new(),
        }
    }

    pub fn get(&self, dir: &str) -> Option<&MountSlot> {
        self.slots.get(dir)
    }

    /// Mount targets at or under `prefix`, deepest first, for teardown.
    pub fn targets_under(&self, prefix: &str) -> Vec<String> {
        self.slots
            .keys()
            .filter(|k| k.starts_with(prefix))
            .rev()
            .cloned()
            .collect()
    }

    pub fn was_unmounted(&self, dir: &str) -> bool {
        self.unmounted.contains(dir)
    }

    /// Recreate `slot` at `dst`. Inside a chroot, a devpts gets its own
    /// instance and an `EBUSY` falls back to a remount.
    pub fn apply(&self, slot: &MountSlot, dst: &str, chrooted: bool, trace: &Trace) -> io::Result<()> {
        if !chrooted {
            if let Some(current) = self.slots.get(dst) {
                if current == slot {
                    return Ok(());
                }
            }
        }
        let mut slot = slot.clone();
        if chrooted && slot.fstype == "devpts" {
            slot.add_opt("newinstance");
            slot.add_opt("ptmxmode=0666");
        }
        let opts = slot.debug_opts();
        trace.say(format_args!(
            "mount -i -n -t {}{}{} {} {}",
            slot.fstype,
            if opts.is_empty() { "" } else { " -o " },
            opts,
            slot.fsname,
            dst,
        ));
        if !trace.live() {
            return Ok(());
        }
        let fsname = CString::new(slot.fsname.as_str())?;
        let target = CString::new(dst)?;
        let fstype = CString::new(slot.fstype.as_str())?;
        let data = CString::new(slot.data.as_str())?;
        let data_ptr = if slot.data.is_empty() {
            std::ptr::null()
        } else {
            data.as_ptr().cast::<libc::c_void>()
        };
        let mut rc = unsafe {
            libc::mount(
                fsname.as_ptr(),
                target.as_ptr(),
                fstype.as_ptr(),
                slot.flags,
                data_ptr,
            )
        };
        if rc != 0 && chrooted && io::Error::last_os_error().raw_os_error() == Some(libc::EBUSY) {
            rc = unsafe {
                libc::mount(
                    fsname.as_ptr(),
                    target.as_ptr(),
                    fstype.as_ptr(),
                    slot.flags | libc::MS_REMOUNT,
                    data_ptr,
                )
            };
        }
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Apply a recursive bind mount, remounting read-only when asked.
    pub fn bind(&self, source: &str, target: &str, readonly: bool, trace: &Trace) -> io::Result<()> {
        trace.say(format_args!(
            "mount -i -n --rbind{} {} {}",
            if readonly { " -o ro" } else { "" },
            source,
            target,
        ));
        if !trace.live() {
            return Ok(());
        }
        let source_c = CString::new(source)?;
        let target_c = CString::new(target)?;
        let rc = unsafe {
            libc::mount(
                source_c.as_ptr(),
                target_c.as_ptr(),
                std::ptr::null(),
                libc::MS_BIND | libc::MS_REC,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        if readonly {
            let rc = unsafe {
                libc::mount(
                    std::ptr::null(),
                    target_c.as_ptr(),
                    std::ptr::null(),
                    libc::MS_BIND | libc::MS_REMOUNT | libc::MS_RDONLY,
                    std::ptr::null(),
                )
            };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    pub fn unmount(&mut self, dir: &str, trace: &Trace) -> io::Result<()> {
        trace.say(format_args!("umount -i -n {dir}"));
        if !trace.live() {
            self.unmounted.insert(dir.to_string());
            return Ok(());
        }
        let dir_c = CString::new(dir)?;
        if unsafe { libc::umount(dir_c.as_ptr()) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// Decode the octal escapes `getmntent` would decode (`\040` for space and
/// friends).
fn unescape_mount_field(s: &str) -> String {
    let b = s.as_bytes();
    let mut out = Vec::with_capacity(b.len());
    let mut i = 0;
    while i < b.len() {
        if b[i] == b'\\' && i + 3 < b.len() && b[i + 1..i + 4].iter().all(u8::is_ascii_digit) {
            let value = (b[i + 1] - b'0') * 64 + (b[i + 2] - b'0') * 8 + (b[i + 3] - b'0');
            out.push(value);
            i += 4;
        } else {
            out.push(b[i]);
            i += 1;
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
proc /proc proc rw,nosuid,nodev,noexec,relatime 0 0
sysfs /sys sysfs rw,nosuid,nodev,noexec 0 0
devpts /dev/pts devpts rw,nosuid,noexec,gid=5,mode=620,ptmxmode=000 0 0
tmpfs /tmp tmpfs rw,nosuid,nodev 0 0
tmpfs /run tmpfs rw,nosuid,nodev,size=402976k 0 0
/dev/sda1 /home ext4 rw,relatime 0 0
tmpfs /mnt/with\\040space tmpfs rw 0 0
";

    #[test]
    fn parse_classifies_allowed_mounts() {
        let table = MountTable::parse(SAMPLE);
        assert!(table.get("/proc").unwrap().allowed);
        assert!(table.get("/sys").unwrap().allowed);
        assert!(table.get("/dev/pts").unwrap().allowed);
        assert!(table.get("/tmp").unwrap().allowed);
        assert!(table.get("/run").unwrap().allowed);
        assert!(!table.get("/home").unwrap().allowed);
    }

    #[test]
    fn options_split_into_flags_and_data() {
        let table = MountTable::parse(SAMPLE);
        let pts = table.get("/dev/pts").unwrap();
        assert_ne!(pts.flags & libc::MS_NOSUID, 0);
        assert_eq!(pts.flags & libc::MS_RDONLY, 0);
        assert_eq!(pts.data, "gid=5,mode=620,ptmxmode=000");
    }

    #[test]
    fn unknown_flag_bits_never_come_from_data() {
        let slot = MountSlot::new("x", "tmpfs", "rw,evil,size=1m", "/somewhere");
        assert_eq!(slot.flags, 0);
        assert_eq!(slot.data, "evil,size=1m");
    }

    #[test]
    fn add_opt_replaces_keyed_data() {
        let mut slot = MountSlot::new("devpts", "devpts", "gid=5,ptmxmode=000", "/dev/pts");
        slot.add_opt("newinstance");
        slot.add_opt("ptmxmode=0666");
        assert_eq!(slot.data, "gid=5,newinstance,ptmxmode=0666");
    }

    #[test]
    fn add_opt_rw_clears_readonly() {
        let mut slot = MountSlot::new("p", "proc", "ro", "/proc");
        assert_ne!(slot.flags & libc::MS_RDONLY, 0);
        slot.add_opt("rw");
        assert_eq!(slot.flags & libc::MS_RDONLY, 0);
    }

    #[test]
    fn unescape_octal_sequences() {
        assert_eq!(unescape_mount_field("a\\040b"), "a b");
        assert_eq!(unescape_mount_field("plain"), "plain");
        let table = MountTable::parse(SAMPLE);
        assert!(table.get("/mnt/with space").is_some());
    }

    #[test]
    fn targets_under_deepest_first() {
        let table = MountTable::parse(SAMPLE);
        let targets = table.targets_under("/dev/");
        assert_eq!(targets, vec!["/dev/pts".to_string()]);
        let all = table.targets_under("/");
        assert!(all.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn debug_opts_round_trip() {
        let slot = MountSlot::new("proc", "proc", "rw,nosuid,nodev,noexec,relatime", "/proc");
        let opts = slot.debug_opts();
        assert!(opts.starts_with("rw"));
        assert!(opts.contains("nosuid"));
    }
}
