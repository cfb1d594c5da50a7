//! The I/O relay between the caller and the sandboxed process's pty.
//!
//! Single-threaded and `select`-driven: two fixed-size byte buffers carry
//! input toward the pty slave and pty output back to the caller, one read
//! and one write per buffer per iteration. Signals never do work — the
//! SIGTERM/SIGCHLD handlers only write a byte into a non-blocking
//! self-pipe, and the loop picks the flag up at its next wakeup. The
//! wall-clock deadline is re-checked every iteration rather than trusted
//! to the `select` budget, so early wakeups on other descriptors cannot
//! starve the timeout.
//!
//! The escape sequence ESC ETX (`0x1b 0x03`) anywhere in pending input
//! terminates the supervised command as if SIGTERM had arrived: it is the
//! interactive user's kill switch, independent of OS signal delivery.

use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

pub const EXIT_TIMEOUT: i32 = 124;
pub const EXIT_RELAY_FAILURE: i32 = 125;
pub const EXIT_CANCELLED: i32 = 128 + libc::SIGTERM;

const ESCAPE: &[u8] = b"\x1b\x03";
const BUF_SIZE: usize = 8192;

static SIGPIPE_WR: AtomicI32 = AtomicI32::new(-1);
static GOT_SIGTERM: AtomicBool = AtomicBool::new(false);

extern "C" fn relay_signal_handler(signo: libc::c_int) {
    if signo == libc::SIGTERM {
        GOT_SIGTERM.store(true, Ordering::Relaxed);
    }
    let fd = SIGPIPE_WR.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        unsafe { libc::write(fd, std::ptr::addr_of!(byte).cast(), 1) };
    }
}

/// Create the self-pipe and route SIGCHLD/SIGTERM into it. Returns
/// `(read, write)`; the write end also lives in a process-wide slot for
/// the handler, and both ends must be closed on the exec side of a fork.
pub fn install_sigpipe() -> io::Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    set_nonblocking(fds[0])?;
    set_nonblocking(fds[1])?;
    SIGPIPE_WR.store(fds[1], Ordering::Relaxed);

    let action = SigAction::new(
        SigHandler::Handler(relay_signal_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGCHLD, &action).map_err(io::Error::from)?;
        sigaction(Signal::SIGTERM, &action).map_err(io::Error::from)?;
    }
    Ok((fds[0], fds[1]))
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// A directional byte buffer with head/tail cursors.
#[derive(Debug)]
pub struct RelayBuffer {
    buf: [u8; BUF_SIZE],
    head: usize,
    tail: usize,
    pub input_closed: bool,
    input_is_fifo: bool,
    pub output_closed: bool,
    /// errno of the read that closed the input side, 0 for clean EOF.
    pub rerrno: i32,
}

impl Default for RelayBuffer {
    fn default() -> Self {
        RelayBuffer {
            buf: [0; BUF_SIZE],
            head: 0,
            tail: 0,
            input_closed: false,
            input_is_fifo: false,
            output_closed: false,
            rerrno: 0,
        }
    }
}

impl RelayBuffer {
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.head..self.tail]
    }

    pub fn has_pending(&self) -> bool {
        self.head != self.tail
    }

    /// One non-blocking read into the buffer, compacting first when the
    /// tail has hit the end.
    pub fn fill_from(&mut self, from: RawFd) {
        if self.tail == BUF_SIZE && self.head != 0 {
            self.buf.copy_within(self.head..self.tail, 0);
            self.tail -= self.head;
            self.head = 0;
        }
        if from < 0 || self.input_closed || self.tail == BUF_SIZE {
            return;
        }
        let n = unsafe {
            libc::read(
                from,
                self.buf[self.tail..].as_mut_ptr().cast(),
                BUF_SIZE - self.tail,
            )
        };
        if n > 0 {
            self.tail += n as usize;
        } else if n == 0 {
            if self.input_is_fifo {
                return;
            }
            // a fifo at EOF may gain another writer later; a regular
            // stream will not
            let mut st: libc::stat = unsafe { std::mem::zeroed() };
            if unsafe { libc::fstat(from, &mut st) } == 0
                && st.st_mode & libc::S_IFMT == libc::S_IFIFO
            {
                self.input_is_fifo = true;
            } else {
                self.input_closed = true;
            }
        } else {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno != libc::EINTR && errno != libc::EAGAIN {
                self.input_closed = true;
                self.rerrno = errno;
            }
        }
    }

    /// One non-blocking write of whatever is pending.
    pub fn drain_to(&mut self, to: RawFd) {
        if to < 0 || self.output_closed || self.head == self.tail {
            return;
        }
        let n = unsafe {
            libc::write(
                to,
                self.buf[self.head..self.tail].as_ptr().cast(),
                self.tail - self.head,
            )
        };
        if n > 0 {
            self.head += n as usize;
        } else {
            let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if n < 0 && errno != libc::EINTR && errno != libc::EAGAIN {
                self.output_closed = true;
            }
        }
    }
}

pub fn contains_escape(data: &[u8]) -> bool {
    data.windows(ESCAPE.len()).any(|w| w == ESCAPE)
}

struct FdSet {
    set: libc::fd_set,
    max: RawFd,
}

impl FdSet {
    fn new() -> Self {
        let mut set = unsafe { std::mem::zeroed() };
        unsafe { libc::FD_ZERO(&mut set) };
        FdSet { set, max: -1 }
    }

    fn insert(&mut self, fd: RawFd) {
        unsafe { libc::FD_SET(fd, &mut self.set) };
        if fd > self.max {
            self.max = fd;
        }
    }

    fn contains(&mut self, fd: RawFd) -> bool {
        unsafe { libc::FD_ISSET(fd, &mut self.set) }
    }
}

/// The supervisor side of a running jail command.
pub struct Relay {
    pub input_fd: RawFd,
    pub output_fd: RawFd,
    pub pty_fd: RawFd,
    pub child: Pid,
    pub deadline: Option<Instant>,
    sig_rx: RawFd,
    to_slave: RelayBuffer,
    from_slave: RelayBuffer,
    child_status: Option<i32>,
}

impl Relay {
    pub fn new(
        input_fd: RawFd,
        output_fd: RawFd,
        pty_fd: RawFd,
        child: Pid,
        deadline: Option<Instant>,
        sig_rx: RawFd,
    ) -> Self {
        Relay {
            input_fd,
            output_fd,
            pty_fd,
            child,
            deadline,
            sig_rx,
            to_slave: RelayBuffer::default(),
            from_slave: RelayBuffer::default(),
            child_status: None,
        }
    }

    /// Run until the child exits, the deadline passes, or cancellation.
    /// Returns the process exit code to report.
    pub fn run(&mut self) -> i32 {
        loop {
            self.block();

            self.to_slave.fill_from(self.input_fd);
            if contains_escape(self.to_slave.pending()) {
                return EXIT_CANCELLED;
            }
            self.to_slave.drain_to(self.pty_fd);
            self.from_slave.fill_from(self.pty_fd);
            self.from_slave.drain_to(self.output_fd);

            if let Some(code) = self.check_child_and_deadline() {
                return code;
            }

            // pty read errors other than the slave-side hangup are real
            if self.from_slave.input_closed && self.from_slave.rerrno != libc::EIO {
                eprintln!(
                    "read: {}",
                    io::Error::from_raw_os_error(self.from_slave.rerrno)
                );
                return EXIT_RELAY_FAILURE;
            }
        }
    }

    /// Block in `select` for whichever descriptors currently have work,
    /// bounded by the remaining wall-clock budget, then drain the
    /// self-pipe.
    fn block(&mut self) {
        let mut rset = FdSet::new();
        let mut wset = FdSet::new();
        rset.insert(self.sig_rx);

        if !self.to_slave.input_closed && !self.to_slave.output_closed {
            rset.insert(self.input_fd);
        }
        if !self.to_slave.output_closed && self.to_slave.has_pending() {
            wset.insert(self.pty_fd);
        }
        if !self.from_slave.input_closed && !self.from_slave.output_closed {
            rset.insert(self.pty_fd);
        }
        if !self.from_slave.output_closed && self.from_slave.has_pending() {
            wset.insert(self.output_fd);
        }

        let max = rset.max.max(wset.max);
        let mut tv;
        let tv_ptr = match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tv = libc::timeval {
                    tv_sec: remaining.as_secs() as libc::time_t,
                    tv_usec: libc::suseconds_t::from(remaining.subsec_micros()),
                };
                std::ptr::addr_of_mut!(tv)
            }
            None => std::ptr::null_mut(),
        };
        unsafe {
            libc::select(
                max + 1,
                &mut rset.set,
                &mut wset.set,
                std::ptr::null_mut(),
                tv_ptr,
            );
        }

        if rset.contains(self.sig_rx) {
            let mut scratch = [0u8; 128];
            while unsafe {
                libc::read(self.sig_rx, scratch.as_mut_ptr().cast(), scratch.len())
            } > 0
            {}
        }
    }

    /// Non-blocking child poll plus cancellation and timeout checks.
    ///
    /// A collected exit status is only honored once the pty side has
    /// closed: the child being gone does not mean its buffered output has
    /// been read.
    fn check_child_and_deadline(&mut self) -> Option<i32> {
        loop {
            match waitpid(self.child, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(_, code)) => {
                    self.child_status = Some(code);
                    break;
                }
                Ok(WaitStatus::Signaled(_, signal, _)) => {
                    self.child_status = Some(128 + signal as i32);
                    break;
                }
                Ok(_) => break,
                Err(nix::errno::Errno::EINTR) => continue,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(_) => return Some(EXIT_RELAY_FAILURE),
            }
        }

        if let Some(status) = self.child_status {
            if self.from_slave.input_closed {
                return Some(status);
            }
        }
        if GOT_SIGTERM.load(Ordering::Relaxed) {
            return Some(EXIT_CANCELLED);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() > deadline {
                return Some(EXIT_TIMEOUT);
            }
        }
        None
    }
}
