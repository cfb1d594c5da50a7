//! Jail directory walk, rename, and removal.
//!
//! These need real root: the walk demands root-owned ancestors, and the
//! fixtures sit directly under `/` so no world-writable `/tmp` component
//! poisons the ancestor checks. Without euid 0 every test skips.

use std::fs;
use std::path::PathBuf;

use tempfile::TempDir;

use cellbox::jaildir::{Action, JailDir, WalkRequest};
use cellbox::mounts::MountTable;
use cellbox::policy::Authority;
use cellbox::trace::Trace;

fn as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

struct Fixture {
    _tmp: TempDir,
    root: String,
    authority: Authority,
}

impl Fixture {
    fn new() -> Self {
        let tmp = TempDir::with_prefix_in("cellbox-dir-", "/").unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        fs::set_permissions(&root, std::os::unix::fs::PermissionsExt::from_mode(0o755)).unwrap();
        let policy = format!("enablejail {root}/jails\n");
        let authority = Authority::from_rules(Authority::parse(&policy), PathBuf::from("/etc/cellbox.conf"));
        Fixture {
            root,
            _tmp: tmp,
            authority,
        }
    }

    fn request(&self, action: Action, force: bool) -> WalkRequest<'_> {
        WalkRequest {
            action,
            authority: &self.authority,
            skeleton: None,
            force,
            trace: Trace::default(),
        }
    }
}

#[test]
fn init_creates_the_authorized_tree() {
    if !as_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let fx = Fixture::new();
    let target = format!("{}/jails/j1", fx.root);
    let jail = JailDir::open(&target, &fx.request(Action::Init, false))
        .unwrap()
        .unwrap();

    assert_eq!(jail.dir, format!("{target}/"));
    assert_eq!(jail.permdir, format!("{}/jails/", fx.root));
    assert_eq!(jail.component, "j1");
    let meta = fs::metadata(&target).unwrap();
    assert!(meta.is_dir());
    use std::os::unix::fs::PermissionsExt;
    assert_eq!(meta.permissions().mode() & 0o7777, 0o755);
}

#[test]
fn walk_refuses_symlinked_component() {
    if !as_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let fx = Fixture::new();
    let elsewhere = format!("{}/elsewhere", fx.root);
    fs::create_dir_all(&elsewhere).unwrap();
    std::os::unix::fs::symlink(&elsewhere, format!("{}/jails", fx.root)).unwrap();

    // a component swapped for a symlink must fail, never be followed
    let target = format!("{}/jails/j1", fx.root);
    assert!(JailDir::open(&target, &fx.request(Action::Init, false)).is_err());
    assert!(fs::metadata(format!("{elsewhere}/j1")).is_err());
}

#[test]
fn rm_force_succeeds_on_absent_target() {
    if !as_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let fx = Fixture::new();
    let target = format!("{}/jails/gone", fx.root);
    let result = JailDir::open(&target, &fx.request(Action::Rm, true)).unwrap();
    assert!(result.is_none());
}

#[test]
fn remove_deletes_the_tree() {
    if !as_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let fx = Fixture::new();
    let target = format!("{}/jails/j2", fx.root);
    JailDir::open(&target, &fx.request(Action::Init, false))
        .unwrap()
        .unwrap();
    fs::create_dir_all(format!("{target}/home/student")).unwrap();
    fs::write(format!("{target}/home/student/file"), "x").unwrap();

    let mut jail = JailDir::open(&target, &fx.request(Action::Rm, false))
        .unwrap()
        .unwrap();
    let mut mounts = MountTable::parse("");
    jail.remove(&mut mounts, false, &Trace::default()).unwrap();
    assert!(fs::metadata(&target).is_err());
}

#[test]
fn rename_stays_inside_the_boundary() {
    if !as_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let fx = Fixture::new();
    let target = format!("{}/jails/old", fx.root);
    let jail = JailDir::open(&target, &fx.request(Action::Init, false))
        .unwrap()
        .unwrap();

    let outside = format!("{}/elsewhere/new", fx.root);
    assert!(jail.rename_to(&outside, &Trace::default()).is_err());

    let inside = format!("{}/jails/new", fx.root);
    jail.rename_to(&inside, &Trace::default()).unwrap();
    assert!(fs::metadata(&inside).unwrap().is_dir());
    assert!(fs::metadata(&target).is_err());
}

#[test]
fn walk_requires_root_owned_ancestors() {
    if !as_root() {
        eprintln!("skipping: requires root");
        return;
    }
    let fx = Fixture::new();
    // a world-writable ancestor above the boundary is a takeover vector
    fs::set_permissions(
        &fx.root,
        std::os::unix::fs::PermissionsExt::from_mode(0o777),
    )
    .unwrap();
    let target = format!("{}/jails/j3", fx.root);
    let err = JailDir::open(&target, &fx.request(Action::Init, false));
    assert!(err.is_err());
}
