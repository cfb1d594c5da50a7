//! The privileged execution supervisor.
//!
//! `run` hands a validated, materialized jail to this module and never
//! gets it back: the supervisor unshares mount/IPC/PID namespaces, enters
//! the jail, drops privilege, and exits with the supervised command's
//! status.
//!
//! The privilege choreography is an ordered sequence of raw `setresuid`/
//! `setresgid` triples and must stay visible as one: effective ids drop to
//! the jail owner *while saved root is retained* for exactly one more
//! privileged step (pty allocation inside the chroot), then the pty-side
//! grandchild drops saved root permanently before exec, and the relay-side
//! parent returns to the invoking caller's identity. Reordering any of
//! these calls is a security bug, not a refactor.

use std::ffi::CString;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::{IntoRawFd, RawFd};
use std::time::{Duration, Instant};

use nix::pty::{grantpt, posix_openpt, ptsname_r, unlockpt};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, chroot, fork, setresgid, setresuid, ForkResult, Gid, Pid, Uid};

use crate::error::ExecError;
use crate::jaildir::JailDir;
use crate::mounts::{BindMount, MountTable};
use crate::owner::Owner;
use crate::path::{noendslash, shell_quote};
use crate::relay::{install_sigpipe, set_nonblocking, Relay, EXIT_CANCELLED, EXIT_TIMEOUT};
use crate::trace::{uid_name, Trace};

/// Mounts recreated inside the jail for a `run`, when the host's mount
/// table allows them.
const RUN_MOUNTS: &[&str] = &["/proc", "/dev/pts", "/tmp", "/run"];

/// Pid bookkeeping for callers that babysit background jails.
#[derive(Debug)]
pub struct PidFile {
    file: File,
    path: String,
}

impl PidFile {
    pub fn create(path: &str) -> io::Result<Self> {
        let file = File::options()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(PidFile {
            file,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn write_pid(&self, pid: i32) -> io::Result<()> {
        let mut f = &self.file;
        f.seek(SeekFrom::Start(0))?;
        let text = format!("{pid}\n");
        f.write_all(text.as_bytes())?;
        self.file.set_len(text.len() as u64)?;
        Ok(())
    }
}

pub struct ExecConfig {
    /// The command line, joined and shell-quoted for `shell -l -c`.
    pub command: Vec<String>,
    pub timeout: Option<Duration>,
    /// Caller-side input source; 0 unless `--input` redirected it.
    pub input_fd: RawFd,
    pub foreground: bool,
    pub quiet: bool,
    pub caller_uid: libc::uid_t,
    pub caller_gid: libc::gid_t,
    pub pidfile: Option<PidFile>,
}

/// Run `cfg.command` inside the jail as `owner`.
///
/// On anything but a dry run this function does not return: the calling
/// process becomes the supervisor and exits with the command's status
/// (`124` timeout, `128+SIGTERM` cancellation, `125` relay failure,
/// `126`/`127` exec failure, `128+N` signal death).
pub fn exec_jail(
    jail: &JailDir,
    owner: &Owner,
    mounts: &MountTable,
    binds: &[BindMount],
    cfg: ExecConfig,
    trace: &Trace,
) -> Result<(), ExecError> {
    let deadline = cfg.timeout.map(|t| Instant::now() + t);

    if !trace.live() {
        // dry run: walk the whole protocol on paper
        supervise(jail, owner, mounts, binds, &cfg, deadline, trace)?;
        return Ok(());
    }

    // mount + IPC + PID isolation; the next fork starts the new pid space
    unshare(CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWIPC | CloneFlags::CLONE_NEWPID)
        .map_err(|e| ExecError::Unshare(e.into()))?;

    match unsafe { fork() }.map_err(|e| ExecError::Fork(e.into()))? {
        ForkResult::Child => {
            let code = match supervise(jail, owner, mounts, binds, &cfg, deadline, trace) {
                Ok(code) => code,
                Err(e) => {
                    eprintln!("cellbox: {e}");
                    1
                }
            };
            std::process::exit(code);
        }
        ForkResult::Parent { child } => {
            tracing::debug!(pid = child.as_raw(), "jail supervisor started");
            if let Some(pidfile) = &cfg.pidfile {
                if let Err(e) = pidfile.write_pid(child.as_raw()) {
                    eprintln!("{}: {e}", pidfile.path());
                    std::process::exit(1);
                }
            }
            // nothing left to say on the caller's terminal
            unsafe {
                libc::close(libc::STDIN_FILENO);
                libc::close(libc::STDOUT_FILENO);
                libc::close(libc::STDERR_FILENO);
            }
            if cfg.foreground {
                let _ = setresgid(
                    Gid::from_raw(cfg.caller_gid),
                    Gid::from_raw(cfg.caller_gid),
                    Gid::from_raw(cfg.caller_gid),
                );
                let _ = setresuid(
                    Uid::from_raw(cfg.caller_uid),
                    Uid::from_raw(cfg.caller_uid),
                    Uid::from_raw(cfg.caller_uid),
                );
                let status = wait_exit_code(child);
                if let Some(pidfile) = &cfg.pidfile {
                    let _ = pidfile.write_pid(0);
                }
                std::process::exit(status);
            }
            std::process::exit(0);
        }
    }
}

/// The namespace-isolated side: enter the jail, make the pty, spawn the
/// command, relay its terminal. Returns only under dry-run.
fn supervise(
    jail: &JailDir,
    owner: &Owner,
    mounts: &MountTable,
    binds: &[BindMount],
    cfg: &ExecConfig,
    deadline: Option<Instant>,
    trace: &Trace,
) -> Result<i32, ExecError> {
    if trace.live() {
        // keep our mount activity out of the parent namespace
        let rc = unsafe {
            libc::mount(
                std::ptr::null(),
                c"/".as_ptr(),
                std::ptr::null(),
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            )
        };
        if rc != 0 {
            return Err(ExecError::Mount {
                target: "/".to_string(),
                source: io::Error::last_os_error(),
            });
        }
    }

    trace.say(format_args!("cd {}", jail.dir));
    if trace.live() {
        chdir(noendslash(&jail.dir)).map_err(|e| ExecError::Chdir {
            path: jail.dir.clone(),
            source: e.into(),
        })?;
    }

    // binds need the host view of their sources, so they go in before
    // chroot; the manifest registered them deferred for exactly this moment
    for bind in binds {
        let target = format!("{}{}", noendslash(&jail.dir), bind.target);
        trace.say(format_args!("mkdir -p {target}"));
        if trace.live() {
            std::fs::create_dir_all(&target).map_err(|e| ExecError::Mount {
                target: target.clone(),
                source: e,
            })?;
        }
        mounts
            .bind(&bind.source, &target, bind.readonly, trace)
            .map_err(|e| ExecError::Mount { target, source: e })?;
    }

    trace.say(format_args!("chroot ."));
    if trace.live() {
        chroot(".").map_err(|e| ExecError::Chroot(e.into()))?;
    }

    for target in RUN_MOUNTS {
        let Some(slot) = mounts.get(target) else {
            continue;
        };
        if !slot.allowed {
            continue;
        }
        if trace.live() {
            let target_c = CString::new(*target).expect("static path");
            let rc = unsafe { libc::mkdir(target_c.as_ptr(), 0o555) };
            if rc != 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::EEXIST) {
                    return Err(ExecError::Mount {
                        target: target.to_string(),
                        source: err,
                    });
                }
            }
        }
        mounts
            .apply(slot, target, true, trace)
            .map_err(|e| ExecError::Mount {
                target: target.to_string(),
                source: e,
            })?;
    }
    trace.say(format_args!("ln -s pts/ptmx /dev/ptmx"));
    if trace.live() {
        unsafe {
            libc::unlink(c"/dev/ptmx".as_ptr());
            libc::symlink(c"pts/ptmx".as_ptr(), c"/dev/ptmx".as_ptr());
        }
    }

    trace.say(format_args!("sudo -u {} make-pty", uid_name(owner.uid.as_raw())));
    let mut pty_fd: RawFd = -1;
    let mut slave_path = String::new();
    if trace.live() {
        // drop effective ids to the owner but hold saved root: the pty
        // device must be created as the owner, and one more privileged
        // transition is still owed to the relay side
        setresgid(owner.gid, owner.gid, Gid::from_raw(0)).map_err(|e| ExecError::Privilege {
            op: "setresgid",
            source: e.into(),
        })?;
        setresuid(owner.uid, owner.uid, Uid::from_raw(0)).map_err(|e| ExecError::Privilege {
            op: "setresuid",
            source: e.into(),
        })?;
        let master = posix_openpt(nix::fcntl::OFlag::O_RDWR).map_err(|e| ExecError::Pty {
            op: "posix_openpt",
            source: e.into(),
        })?;
        grantpt(&master).map_err(|e| ExecError::Pty {
            op: "grantpt",
            source: e.into(),
        })?;
        unlockpt(&master).map_err(|e| ExecError::Pty {
            op: "unlockpt",
            source: e.into(),
        })?;
        slave_path = ptsname_r(&master).map_err(|e| ExecError::Pty {
            op: "ptsname",
            source: e.into(),
        })?;
        pty_fd = master.into_raw_fd();
    }

    trace.say(format_args!("cd {}", owner.home));
    if trace.live() {
        chdir(owner.home.as_str()).map_err(|e| ExecError::Chdir {
            path: owner.home.clone(),
            source: e.into(),
        })?;
    }
    if trace.live() {
        let shell = File::open(&owner.shell).map_err(|e| ExecError::Open {
            path: owner.shell.clone(),
            source: e,
        })?;
        drop(shell);
    }

    let (argv, envp) = build_command(owner, cfg);
    if trace.verbose {
        let mut line = String::new();
        for env in &envp {
            line.push_str(&env.to_string_lossy());
            line.push(' ');
        }
        let rendered: Vec<String> = argv
            .iter()
            .map(|a| shell_quote(&a.to_string_lossy()))
            .collect();
        line.push_str(&rendered.join(" "));
        trace.say(format_args!("{line}"));
    }

    if !trace.live() {
        return Ok(0);
    }

    let (sig_rx, sig_tx) = install_sigpipe().map_err(|e| ExecError::Pty {
        op: "sigpipe",
        source: e,
    })?;
    set_nonblocking(cfg.input_fd).ok();
    set_nonblocking(libc::STDOUT_FILENO).ok();

    match unsafe { fork() }.map_err(|e| ExecError::Fork(e.into()))? {
        ForkResult::Child => {
            unsafe { libc::close(sig_tx) };
            run_grandchild(owner, pty_fd, &slave_path, sig_rx, &argv, &envp, trace)
        }
        ForkResult::Parent { child } => {
            wait_background(child, pty_fd, cfg, deadline, sig_rx)
        }
    }
}

/// The pty-attached process: permanent privilege drop, new session, pty
/// slave on stdio, default signal dispositions, exec.
fn run_grandchild(
    owner: &Owner,
    pty_fd: RawFd,
    slave_path: &str,
    sig_rx: RawFd,
    argv: &[CString],
    envp: &[CString],
    trace: &Trace,
) -> ! {
    unsafe { libc::close(sig_rx) };

    trace.say(format_args!("su {}", uid_name(owner.uid.as_raw())));
    // final drop: no saved root survives into the supervised command
    if setresgid(owner.gid, owner.gid, owner.gid).is_err()
        || setresuid(owner.uid, owner.uid, owner.uid).is_err()
    {
        eprintln!("setresuid: {}", io::Error::last_os_error());
        unsafe { libc::_exit(125) };
    }
    if unsafe { libc::setsid() } < 0 {
        eprintln!("setsid: {}", io::Error::last_os_error());
        unsafe { libc::_exit(125) };
    }

    let slave_c = match CString::new(slave_path) {
        Ok(c) => c,
        Err(_) => unsafe { libc::_exit(125) },
    };
    let slave = unsafe { libc::open(slave_c.as_ptr(), libc::O_RDWR) };
    if slave < 0 {
        eprintln!("{slave_path}: {}", io::Error::last_os_error());
        unsafe { libc::_exit(125) };
    }
    let ws = libc::winsize {
        ws_row: 24,
        ws_col: 80,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe { libc::ioctl(slave, libc::TIOCSWINSZ, &ws) };
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(slave, &mut tio) } >= 0 {
        // raw output: no NL -> CRNL translation on the jail side
        tio.c_oflag = 0;
        unsafe { libc::tcsetattr(slave, libc::TCSANOW, &tio) };
    }
    unsafe {
        libc::dup2(slave, libc::STDIN_FILENO);
        libc::dup2(slave, libc::STDOUT_FILENO);
        libc::dup2(slave, libc::STDERR_FILENO);
        libc::close(pty_fd);
        libc::close(slave);
    }

    // an ignored SIGPIPE or SIGINT inherited from the caller must not
    // leak into the supervised command
    for signo in 1..64 {
        unsafe { libc::signal(signo, libc::SIG_DFL) };
    }

    let argv_ptrs: Vec<*const libc::c_char> = argv
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    let envp_ptrs: Vec<*const libc::c_char> = envp
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect();
    unsafe { libc::execve(argv[0].as_ptr(), argv_ptrs.as_ptr(), envp_ptrs.as_ptr()) };

    let err = io::Error::last_os_error();
    eprintln!("exec {}: {err}", argv[0].to_string_lossy());
    let code = if err.raw_os_error() == Some(libc::ENOENT) {
        127
    } else {
        126
    };
    unsafe { libc::_exit(code) };
}

/// The relay side: return to the caller's identity (saved root retained),
/// put a tty stdin in raw mode, and multiplex until done.
fn wait_background(
    child: Pid,
    pty_fd: RawFd,
    cfg: &ExecConfig,
    deadline: Option<Instant>,
    sig_rx: RawFd,
) -> ! {
    let root = Uid::from_raw(0);
    if setresuid(root, root, root).is_err()
        || setresgid(
            Gid::from_raw(cfg.caller_gid),
            Gid::from_raw(cfg.caller_gid),
            Gid::from_raw(0),
        )
        .is_err()
        || setresuid(
            Uid::from_raw(cfg.caller_uid),
            Uid::from_raw(cfg.caller_uid),
            root,
        )
        .is_err()
    {
        eprintln!("setresuid: {}", io::Error::last_os_error());
        exec_done(127, None, cfg.quiet);
    }

    // non-canonical, non-echoing stdin while the jail owns the terminal
    let mut saved_termios: Option<libc::termios> = None;
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(libc::STDIN_FILENO, &mut tio) } >= 0 {
        saved_termios = Some(tio);
        tio.c_lflag &= !(libc::ICANON | libc::ISIG | libc::ECHO);
        tio.c_cc[libc::VMIN] = 1;
        tio.c_cc[libc::VTIME] = 0;
        unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSAFLUSH, &tio) };
    }
    // reads block for at most half a second so the loop keeps its own clock
    let mut pty_tio: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(pty_fd, &mut pty_tio) } >= 0 {
        pty_tio.c_cc[libc::VMIN] = 1;
        pty_tio.c_cc[libc::VTIME] = 5;
        unsafe { libc::tcsetattr(pty_fd, libc::TCSANOW, &pty_tio) };
    }
    set_nonblocking(pty_fd).ok();
    io::stdout().flush().ok();

    let code = Relay::new(
        cfg.input_fd,
        libc::STDOUT_FILENO,
        pty_fd,
        child,
        deadline,
        sig_rx,
    )
    .run();
    exec_done(code, saved_termios, cfg.quiet)
}

fn exec_done(code: i32, saved_termios: Option<libc::termios>, quiet: bool) -> ! {
    let notice = match code {
        EXIT_TIMEOUT if !quiet => Some("...timed out"),
        EXIT_CANCELLED if !quiet => Some("...terminated"),
        _ => None,
    };
    if let Some(msg) = notice {
        if unsafe { libc::isatty(libc::STDOUT_FILENO) } == 1 {
            print!("\n\x1b[3;7;31m{msg}\x1b[0m\n");
        } else {
            print!("\n{msg}\n");
        }
    }
    io::stdout().flush().ok();
    if let Some(tio) = saved_termios {
        unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSAFLUSH, &tio) };
    }
    std::process::exit(code);
}

/// Assemble `shell -l -c COMMAND` and the minimal jail environment.
fn build_command(owner: &Owner, cfg: &ExecConfig) -> (Vec<CString>, Vec<CString>) {
    let command = if cfg.command.len() == 1 {
        cfg.command[0].clone()
    } else {
        cfg.command
            .iter()
            .map(|a| shell_quote(a))
            .collect::<Vec<_>>()
            .join(" ")
    };
    let argv = vec![
        CString::new(owner.shell.as_str()).expect("shell path"),
        CString::new("-l").expect("static"),
        CString::new("-c").expect("static"),
        CString::new(command).unwrap_or_else(|_| CString::new("false").expect("static")),
    ];

    let path = std::env::var("PATH").unwrap_or_else(|_| "/usr/local/bin:/bin:/usr/bin".into());
    let mut envp = vec![
        CString::new(format!("PATH={path}")).expect("no NUL in env"),
        CString::new(format!("HOME={}", owner.home)).expect("no NUL in env"),
    ];
    if let Ok(ld) = std::env::var("LD_LIBRARY_PATH") {
        if let Ok(entry) = CString::new(format!("LD_LIBRARY_PATH={ld}")) {
            envp.push(entry);
        }
    }
    (argv, envp)
}

fn wait_exit_code(child: Pid) -> i32 {
    loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => return code,
            Ok(WaitStatus::Signaled(_, signal, _)) => return 128 + signal as i32,
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => return 125,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &[&str]) -> ExecConfig {
        ExecConfig {
            command: command.iter().map(|s| s.to_string()).collect(),
            timeout: None,
            input_fd: 0,
            foreground: false,
            quiet: false,
            caller_uid: 1000,
            caller_gid: 1000,
            pidfile: None,
        }
    }

    fn owner() -> Owner {
        Owner {
            uid: Uid::from_raw(1000),
            gid: Gid::from_raw(1000),
            home: "/home/student".into(),
            shell: "/bin/bash".into(),
        }
    }

    #[test]
    fn single_word_command_is_not_quoted() {
        let (argv, _) = build_command(&owner(), &config(&["echo hi | wc -c"]));
        assert_eq!(argv[3].to_str().unwrap(), "echo hi | wc -c");
    }

    #[test]
    fn multi_word_command_is_quoted() {
        let (argv, _) = build_command(&owner(), &config(&["echo", "two words"]));
        assert_eq!(argv[1].to_str().unwrap(), "-l");
        assert_eq!(argv[2].to_str().unwrap(), "-c");
        assert_eq!(argv[3].to_str().unwrap(), "echo 'two words'");
    }

    #[test]
    fn env_carries_home() {
        let (_, envp) = build_command(&owner(), &config(&["true"]));
        assert!(envp
            .iter()
            .any(|e| e.to_str().unwrap() == "HOME=/home/student"));
    }

    #[test]
    fn pidfile_write_and_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pid");
        let pidfile = PidFile::create(path.to_str().unwrap()).unwrap();
        pidfile.write_pid(4242).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "4242\n");
        pidfile.write_pid(0).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "0\n");
    }
}
