//! cellbox CLI: build, run, move, and remove jails.

use std::io::Read;
use std::os::fd::RawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use nix::unistd::{getgid, getuid, setresgid, setresuid, Gid, Uid};

use cellbox::exec::{exec_jail, ExecConfig, PidFile};
use cellbox::jaildir::{Action, JailDir, WalkRequest};
use cellbox::materialize::Session;
use cellbox::mounts::MountTable;
use cellbox::owner::Owner;
use cellbox::path::noendslash;
use cellbox::policy::{Authority, POLICY_PATH};
use cellbox::trace::Trace;

#[derive(Parser)]
#[command(name = "cellbox")]
#[command(about = "Confine untrusted commands to a filesystem + namespace jail")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Default)]
struct Common {
    /// Print each filesystem action as its shell equivalent
    #[arg(short = 'V', long)]
    verbose: bool,

    /// Trace without touching anything
    #[arg(short = 'n', long)]
    dry_run: bool,
}

#[derive(Args, Clone, Default)]
struct BuildArgs {
    /// Jail manifest listing files to materialize (- for stdin)
    #[arg(short = 'f', long = "files")]
    files: Option<String>,

    /// Shared skeleton cache directory for hardlink reuse across jails
    #[arg(short = 'S', long)]
    skeleton: Option<String>,

    /// Normalize ownership of everything under the jail's /home
    #[arg(long)]
    chown_home: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or refresh a jail without running anything
    Init {
        #[command(flatten)]
        common: Common,
        #[command(flatten)]
        build: BuildArgs,
        jaildir: String,
        user: Option<String>,
    },

    /// Build the jail, then run a command inside it
    Run {
        #[command(flatten)]
        common: Common,
        #[command(flatten)]
        build: BuildArgs,

        /// Wait for the command and report its exit status
        #[arg(long)]
        fg: bool,

        /// Suppress the timeout/termination notice
        #[arg(short = 'q', long)]
        quiet: bool,

        /// Kill the command after this many seconds (fractions allowed)
        #[arg(short = 'T', long)]
        timeout: Option<f64>,

        /// Feed the command's terminal from this file or fifo
        #[arg(short = 'i', long)]
        input: Option<String>,

        /// Record the supervisor pid here, zeroed once it exits
        #[arg(short = 'p', long = "pid-file")]
        pid_file: Option<String>,

        jaildir: String,
        user: String,

        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Rename a jail within its policy boundary
    Mv {
        #[command(flatten)]
        common: Common,
        olddir: String,
        newdir: String,
    },

    /// Unmount and delete a jail
    Rm {
        #[command(flatten)]
        common: Common,

        /// Succeed even if the jail is already gone
        #[arg(short = 'f', long)]
        force: bool,

        jaildir: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("cellbox: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Init {
            common,
            build,
            jaildir,
            user,
        } => {
            let trace = Trace::new(common.verbose, common.dry_run);
            build_jail(
                Action::Init,
                &jaildir,
                user.as_deref(),
                &build,
                &trace,
                None,
            )
        }
        Commands::Run {
            common,
            build,
            fg,
            quiet,
            timeout,
            input,
            pid_file,
            jaildir,
            user,
            command,
        } => {
            let trace = Trace::new(common.verbose, common.dry_run);
            let run = RunArgs {
                fg,
                quiet,
                timeout,
                input,
                pid_file,
                command,
            };
            build_jail(Action::Run, &jaildir, Some(&user), &build, &trace, Some(run))
        }
        Commands::Mv {
            common,
            olddir,
            newdir,
        } => {
            let trace = Trace::new(common.verbose, common.dry_run);
            escalate(&trace)?;
            let authority = Authority::load(POLICY_PATH)?;
            let request = WalkRequest {
                action: Action::Mv,
                authority: &authority,
                skeleton: None,
                force: false,
                trace,
            };
            let jail = JailDir::open(&olddir, &request)?.expect("mv never skips");
            jail.rename_to(&newdir, &trace)?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Rm {
            common,
            force,
            jaildir,
        } => {
            let trace = Trace::new(common.verbose, common.dry_run);
            escalate(&trace)?;
            let authority = Authority::load(POLICY_PATH)?;
            let request = WalkRequest {
                action: Action::Rm,
                authority: &authority,
                skeleton: None,
                force,
                trace,
            };
            let Some(mut jail) = JailDir::open(&jaildir, &request)? else {
                return Ok(ExitCode::SUCCESS);
            };
            let mut mounts = MountTable::load().context("read /proc/mounts")?;
            jail.remove(&mut mounts, force, &trace)?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

struct RunArgs {
    fg: bool,
    quiet: bool,
    timeout: Option<f64>,
    input: Option<String>,
    pid_file: Option<String>,
    command: Vec<String>,
}

fn build_jail(
    action: Action,
    jaildir: &str,
    user: Option<&str>,
    build: &BuildArgs,
    trace: &Trace,
    run: Option<RunArgs>,
) -> Result<ExitCode> {
    let owner = user.map(Owner::resolve).transpose()?;
    if action == Action::Run && owner.is_none() {
        bail!("run requires a jail user");
    }

    // everything supplied by the caller opens as the caller
    let manifest_text = match &build.files {
        Some(arg) if arg == "-" => {
            if unsafe { libc::isatty(libc::STDIN_FILENO) } == 1 {
                bail!("stdin: is a tty");
            }
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("read stdin")?;
            Some(text)
        }
        Some(arg) => Some(std::fs::read_to_string(arg).with_context(|| arg.clone())?),
        None => None,
    };

    let mut input_fd: RawFd = libc::STDIN_FILENO;
    if let Some(run) = &run {
        if let Some(input) = &run.input {
            if trace.live() {
                let file = std::fs::OpenOptions::new()
                    .read(true)
                    .custom_flags(libc::O_NONBLOCK | libc::O_CLOEXEC)
                    .open(input)
                    .with_context(|| input.clone())?;
                input_fd = std::os::fd::IntoRawFd::into_raw_fd(file);
            }
        }
    }
    let pidfile = match run.as_ref().and_then(|r| r.pid_file.as_ref()) {
        Some(path) => {
            trace.say(format_args!("touch {path}"));
            if trace.live() {
                Some(PidFile::create(path).with_context(|| path.clone())?)
            } else {
                None
            }
        }
        None => None,
    };

    // real root from here on: spawned helpers must run privileged too
    let caller_uid = getuid();
    let caller_gid = getgid();
    escalate(trace)?;

    let authority = Authority::load(POLICY_PATH)?;
    let request = WalkRequest {
        action,
        authority: &authority,
        skeleton: build.skeleton.as_deref(),
        force: false,
        trace: *trace,
    };
    let mut jail = JailDir::open(jaildir, &request)?.expect("init/run never skip");

    let mut mounts = MountTable::load().context("read /proc/mounts")?;
    let will_exec = run.is_some();
    let dstroot = noendslash(&jail.dir).to_string();
    let mut session = Session::new(
        &dstroot,
        jail.skeleton.as_deref().map(noendslash),
        &mounts,
        will_exec,
        *trace,
    );
    for dir in &jail.created {
        session.assume_dir(dir);
    }

    if let Some(skeleton) = jail.skeleton.clone() {
        session
            .ensure_dir(noendslash(&skeleton), 0o700, true)
            .ok()
            .with_context(|| format!("mkdir -p {skeleton}"))?;
    }

    // the owner's home exists before any manifest entry lands
    if let Some(owner) = &owner {
        session
            .ensure_dir(&format!("{dstroot}/home"), 0o755, true)
            .ok()
            .with_context(|| format!("mkdir -p {dstroot}/home"))?;
        let jailhome = format!("{dstroot}{}", owner.home);
        let created = session
            .ensure_dir(&jailhome, 0o700, true)
            .ok()
            .with_context(|| jailhome.clone())?;
        if created == cellbox::materialize::Ensured::Created && trace.live() {
            let (want_uid, want_gid) = if action == Action::Init {
                (caller_uid.as_raw(), caller_gid.as_raw())
            } else {
                (owner.uid.as_raw(), owner.gid.as_raw())
            };
            chown_path(&jailhome, want_uid, want_gid)?;
        }
    }

    if build.chown_home {
        jail.chown_home(&mounts, trace)?;
    }

    let mut failed = false;
    if let Some(text) = &manifest_text {
        let old_umask = unsafe { libc::umask(0) };
        failed = !session.construct(text);
        unsafe { libc::umask(old_umask) };
    }
    let deferred_binds = std::mem::take(&mut session.deferred_binds);
    drop(session);

    // the walk's descriptor must never leak into the jail
    jail.release();

    if failed {
        return Ok(ExitCode::FAILURE);
    }

    if let Some(run) = run {
        let owner = owner.expect("run requires a user");
        let cfg = ExecConfig {
            command: run.command,
            timeout: run
                .timeout
                .filter(|t| *t > 0.0)
                .map(std::time::Duration::from_secs_f64),
            input_fd,
            foreground: run.fg,
            quiet: run.quiet,
            caller_uid: caller_uid.as_raw(),
            caller_gid: caller_gid.as_raw(),
            pidfile,
        };
        mounts = refresh_after_build(mounts);
        // never returns except under dry-run
        exec_jail(&jail, &owner, &mounts, &deferred_binds, cfg, trace)?;
    }

    Ok(ExitCode::SUCCESS)
}

/// Reload the mount table after materialization so mounts created while
/// building the jail are visible to the supervisor.
fn refresh_after_build(previous: MountTable) -> MountTable {
    MountTable::load().unwrap_or(previous)
}

/// Make the real uid/gid root, not just the effective ones, so helper
/// processes (`/bin/cp`) run privileged as well.
fn escalate(trace: &Trace) -> Result<()> {
    if !trace.live() {
        return Ok(());
    }
    let root_uid = Uid::from_raw(0);
    let root_gid = Gid::from_raw(0);
    setresgid(root_gid, root_gid, root_gid).context("setresgid")?;
    setresuid(root_uid, root_uid, root_uid).context("setresuid")?;
    Ok(())
}

fn chown_path(path: &str, uid: libc::uid_t, gid: libc::gid_t) -> Result<()> {
    let path_c = std::ffi::CString::new(path)?;
    if unsafe { libc::lchown(path_c.as_ptr(), uid, gid) } != 0 {
        return Err(std::io::Error::last_os_error()).with_context(|| format!("chown {path}"));
    }
    Ok(())
}
