//! Filesystem materialization against real temp trees.
//!
//! Everything here runs unprivileged: sources are owned by the test user,
//! so the ownership reconciliation step is a no-op and the interesting
//! machinery (parent descent, hardlink dedup, skeleton cache, symlink
//! rewriting, idempotence) is exercised for real.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use tempfile::TempDir;

use cellbox::materialize::Session;
use cellbox::mounts::MountTable;
use cellbox::trace::Trace;

struct Fixture {
    _tmp: TempDir,
    src: String,
    jail: String,
    mounts: MountTable,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::with_prefix("cellbox-mat-").unwrap();
        let src = tmp.path().join("src");
        let jail = tmp.path().join("jail");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&jail).unwrap();
        Fixture {
            src: src.to_string_lossy().into_owned(),
            jail: jail.to_string_lossy().into_owned(),
            _tmp: tmp,
            mounts: MountTable::parse(""),
        }
    }

    fn session(&self) -> Session<'_> {
        Session::new(&self.jail, None, &self.mounts, false, Trace::default())
    }

    fn write(&self, rel: &str, content: &str) -> String {
        let path = format!("{}/{rel}", self.src);
        fs::create_dir_all(Path::new(&path).parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
        path
    }

    fn jail_path(&self, rel: &str) -> String {
        format!("{}{rel}", self.jail)
    }
}

#[test]
fn copy_creates_missing_ancestors() {
    let fx = Fixture::new();
    let src = fx.write("usr/bin/tool", "#!/bin/sh\n");
    fs::set_permissions(&src, fs::Permissions::from_mode(0o755)).unwrap();

    let mut session = fx.session();
    assert!(session.copy_entry(&src, "/usr/bin/tool", false));
    assert!(session.ok());

    let dst = fx.jail_path("/usr/bin/tool");
    assert_eq!(fs::read_to_string(&dst).unwrap(), "#!/bin/sh\n");
    assert_eq!(
        fs::metadata(&dst).unwrap().permissions().mode() & 0o7777,
        0o755
    );
    assert!(fs::metadata(fx.jail_path("/usr/bin")).unwrap().is_dir());
}

#[test]
fn shared_inode_sources_become_hardlinks() {
    let fx = Fixture::new();
    let first = fx.write("lib/libone.so", "shared object");
    let second = format!("{}/lib/libone.so.1", fx.src);
    fs::hard_link(&first, &second).unwrap();

    let mut session = fx.session();
    assert!(session.copy_entry(&first, "/lib/libone.so", false));
    assert!(session.copy_entry(&second, "/lib/libone.so.1", false));

    let a = fs::metadata(fx.jail_path("/lib/libone.so")).unwrap();
    let b = fs::metadata(fx.jail_path("/lib/libone.so.1")).unwrap();
    assert_eq!(a.ino(), b.ino());
    assert!(a.nlink() >= 2);
}

#[test]
fn second_run_is_idempotent() {
    let fx = Fixture::new();
    let src = fx.write("etc/motd", "welcome\n");

    let mut session = fx.session();
    assert!(session.copy_entry(&src, "/etc/motd", false));
    let before = fs::metadata(fx.jail_path("/etc/motd")).unwrap();

    // a fresh session re-running the same entry must change nothing:
    // the metadata tuple already matches, so the copy short-circuits
    let mut session = fx.session();
    assert!(session.copy_entry(&src, "/etc/motd", false));
    let after = fs::metadata(fx.jail_path("/etc/motd")).unwrap();
    assert_eq!(before.ino(), after.ino());
    assert_eq!(before.mtime(), after.mtime());
}

#[test]
fn repeated_destination_is_harmless() {
    let fx = Fixture::new();
    let src = fx.write("etc/motd", "one\n");

    let mut session = fx.session();
    assert!(session.copy_entry(&src, "/etc/motd", false));
    assert!(session.copy_entry(&src, "/etc/motd", false));
    assert!(session.ok());
    assert_eq!(fs::read_to_string(fx.jail_path("/etc/motd")).unwrap(), "one\n");
}

#[test]
fn skeleton_cache_is_created_and_reused() {
    let fx = Fixture::new();
    let src = fx.write("usr/share/data", "cached payload");
    let linkdir = format!("{}/skel", fx.src);
    fs::create_dir_all(&linkdir).unwrap();

    let mut session = Session::new(&fx.jail, Some(&linkdir), &fx.mounts, false, Trace::default());
    assert!(session.copy_entry(&src, "/usr/share/data", false));

    let cache = format!("{linkdir}{src}");
    let cache_meta = fs::metadata(&cache).expect("skeleton copy exists");
    let dst_meta = fs::metadata(fx.jail_path("/usr/share/data")).unwrap();
    assert_eq!(cache_meta.ino(), dst_meta.ino());

    // a second jail built from the same skeleton reuses the cached inode
    let jail2 = format!("{}/jail2", fx.src);
    fs::create_dir_all(&jail2).unwrap();
    let mut session = Session::new(&jail2, Some(&linkdir), &fx.mounts, false, Trace::default());
    assert!(session.copy_entry(&src, "/usr/share/data", false));
    let dst2_meta = fs::metadata(format!("{jail2}/usr/share/data")).unwrap();
    assert_eq!(cache_meta.ino(), dst2_meta.ino());
    assert!(fs::metadata(&cache).unwrap().nlink() >= 3);
}

#[test]
fn symlink_copied_literally_and_target_materialized() {
    let fx = Fixture::new();
    fx.write("app/real", "the real file");
    let link = format!("{}/app/alias", fx.src);
    std::os::unix::fs::symlink("real", &link).unwrap();

    let mut session = fx.session();
    assert!(session.copy_entry(&link, "/app/alias", false));

    let dst_link = fx.jail_path("/app/alias");
    assert_eq!(fs::read_link(&dst_link).unwrap().to_str(), Some("real"));
    // one hop outward: the sibling the link names is materialized too
    assert_eq!(
        fs::read_to_string(fx.jail_path("/app/real")).unwrap(),
        "the real file"
    );
}

#[test]
fn symlink_climbing_dotdot_materializes_sibling_dir_file() {
    let fx = Fixture::new();
    fx.write("usr/lib/shared/libx.so", "x");
    let link = format!("{}/usr/lib/pkg/libx.so", fx.src);
    fs::create_dir_all(format!("{}/usr/lib/pkg", fx.src)).unwrap();
    std::os::unix::fs::symlink("../shared/libx.so", &link).unwrap();

    let mut session = fx.session();
    assert!(session.copy_entry(&link, "/usr/lib/pkg/libx.so", false));
    assert!(fs::metadata(fx.jail_path("/usr/lib/shared/libx.so")).is_ok());
}

#[test]
fn symlink_into_proc_is_never_followed() {
    let fx = Fixture::new();
    fs::create_dir_all(format!("{}/p", fx.src)).unwrap();
    let link = format!("{}/p/status", fx.src);
    std::os::unix::fs::symlink("/proc/self/status", &link).unwrap();

    let mut session = fx.session();
    assert!(session.copy_entry(&link, "/p/status", false));

    assert_eq!(
        fs::read_link(fx.jail_path("/p/status")).unwrap().to_str(),
        Some("/proc/self/status")
    );
    assert!(fs::metadata(fx.jail_path("/proc/self/status")).is_err());
    assert!(fs::metadata(fx.jail_path("/proc")).is_err());
}

#[test]
fn fifo_is_recreated() {
    let fx = Fixture::new();
    fs::create_dir_all(format!("{}/run", fx.src)).unwrap();
    let fifo = format!("{}/run/pipe", fx.src);
    let fifo_c = std::ffi::CString::new(fifo.as_str()).unwrap();
    assert_eq!(unsafe { libc::mkfifo(fifo_c.as_ptr(), 0o600) }, 0);

    let mut session = fx.session();
    assert!(session.copy_entry(&fifo, "/run/pipe", false));

    let meta = fs::metadata(fx.jail_path("/run/pipe"));
    let meta = meta.unwrap();
    assert_eq!(meta.mode() & libc::S_IFMT as u32, libc::S_IFIFO as u32);
}

#[test]
fn cp_flag_copies_symlink_content() {
    let fx = Fixture::new();
    fx.write("cfg/real.conf", "key=value\n");
    let link = format!("{}/cfg/active.conf", fx.src);
    std::os::unix::fs::symlink("real.conf", &link).unwrap();

    let mut session = fx.session();
    assert!(session.copy_entry(&link, "/cfg/active.conf", true));

    let dst = fx.jail_path("/cfg/active.conf");
    // [cp] dereferences: the jail gets file content, not a link
    assert!(fs::symlink_metadata(&dst).unwrap().file_type().is_file());
    assert_eq!(fs::read_to_string(&dst).unwrap(), "key=value\n");
}

#[test]
fn construct_runs_a_whole_manifest() {
    let fx = Fixture::new();
    fx.write("usr/bin/gcc", "elf");
    fx.write("usr/bin/ld", "elf2");
    fx.write("etc/passwd", "nobody:x:65534:\n");

    let manifest = format!(
        "# build toolchain\n\
         {src}/usr/bin:\n\
         gcc\n\
         ld\n\
         \n\
         {src}/etc/passwd <- {src}/etc/passwd\n",
        src = fx.src
    );
    let mut session = fx.session();
    let ok = session.construct(&manifest);
    if nix::unistd::geteuid().is_root() {
        assert!(ok);
    }

    assert!(fs::metadata(fx.jail_path(&format!("{}/usr/bin/gcc", fx.src))).is_ok());
    assert!(fs::metadata(fx.jail_path(&format!("{}/usr/bin/ld", fx.src))).is_ok());
    assert!(fs::metadata(fx.jail_path(&format!("{}/etc/passwd", fx.src))).is_ok());
}

#[test]
fn bind_entries_defer_when_a_command_will_run() {
    let fx = Fixture::new();
    let mut session = Session::new(&fx.jail, None, &fx.mounts, true, Trace::default());
    let manifest = "/mnt/data <- /srv/data [bind-ro]\n";
    session.construct(manifest);
    assert_eq!(session.deferred_binds.len(), 1);
    assert_eq!(session.deferred_binds[0].source, "/srv/data");
    assert_eq!(session.deferred_binds[0].target, "/mnt/data");
    assert!(session.deferred_binds[0].readonly);
    // nothing mounted, nothing created at the target yet
    assert!(fs::metadata(fx.jail_path("/mnt/data")).is_err());
}

#[test]
fn dry_run_touches_nothing() {
    let fx = Fixture::new();
    let src = fx.write("etc/motd", "hi\n");
    let mut session = Session::new(
        &fx.jail,
        None,
        &fx.mounts,
        false,
        Trace::new(false, true),
    );
    assert!(session.copy_entry(&src, "/etc/motd", false));
    assert!(fs::metadata(fx.jail_path("/etc/motd")).is_err());
    assert!(fs::metadata(fx.jail_path("/etc")).is_err());
}
