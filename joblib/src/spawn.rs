//! Child process launch via `clone3`.
//!
//! The child must be subject to its cgroup limits from its first
//! instruction, so the fork goes through `clone3` with `CLONE_INTO_CGROUP`
//! and the leaf directory descriptor instead of an ordinary spawn followed
//! by a `cgroup.procs` write. The same call gives the child fresh UTS, PID,
//! and mount namespaces.

use std::ffi::CString;
use std::fs::File;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::ptr;

use nix::unistd::Pid;

use crate::job::CommandSpec;

/// Not in libc's `CLONE_*` set: the flag sits above the `c_int` range and is
/// only accepted by `clone3` (Linux >= 5.7).
const CLONE_INTO_CGROUP: u64 = 0x2_0000_0000;

/// Mirrors `struct clone_args` from `linux/sched.h`.
#[repr(C)]
#[derive(Default)]
struct CloneArgs {
    flags: u64,
    pidfd: u64,
    child_tid: u64,
    parent_tid: u64,
    exit_signal: u64,
    stack: u64,
    stack_size: u64,
    tls: u64,
    set_tid: u64,
    set_tid_size: u64,
    cgroup: u64,
}

/// Fork-and-exec `command` as a member of the cgroup behind `cgroup_dir`,
/// with stdout/stderr wired to the given descriptors and stdin to
/// `/dev/null`. Returns the child's pid in the caller's namespace.
pub(crate) fn spawn_into_cgroup(
    command: &CommandSpec,
    cgroup_dir: BorrowedFd<'_>,
    stdout: OwnedFd,
    stderr: OwnedFd,
) -> io::Result<Pid> {
    // Everything the child needs is prepared up front: between clone and
    // exec only async-signal-safe calls are allowed.
    let program = cstring(&command.program)?;
    let mut argv = Vec::with_capacity(command.args.len() + 1);
    argv.push(program.clone());
    for arg in &command.args {
        argv.push(cstring(arg)?);
    }
    let mut argv_ptrs: Vec<*const libc::c_char> = argv.iter().map(|arg| arg.as_ptr()).collect();
    argv_ptrs.push(ptr::null());

    let stdin = File::open("/dev/null")?;

    let mut args = CloneArgs {
        flags: CLONE_INTO_CGROUP
            | (libc::CLONE_NEWUTS | libc::CLONE_NEWPID | libc::CLONE_NEWNS) as u64,
        exit_signal: libc::SIGCHLD as u64,
        cgroup: cgroup_dir.as_raw_fd() as u64,
        ..CloneArgs::default()
    };

    let pid = unsafe {
        libc::syscall(
            libc::SYS_clone3,
            &mut args as *mut CloneArgs,
            mem::size_of::<CloneArgs>(),
        )
    };

    match pid {
        -1 => Err(io::Error::last_os_error()),
        0 => unsafe {
            child_after_clone(
                stdin.as_raw_fd(),
                stdout.as_raw_fd(),
                stderr.as_raw_fd(),
                program.as_ptr(),
                argv_ptrs.as_ptr(),
            )
        },
        child => Ok(Pid::from_raw(child as libc::pid_t)),
    }
}

/// Runs in the child between `clone3` and `execvp`. Async-signal-safe calls
/// only; never returns.
unsafe fn child_after_clone(
    stdin: RawFd,
    stdout: RawFd,
    stderr: RawFd,
    program: *const libc::c_char,
    argv: *const *const libc::c_char,
) -> ! {
    // die with the supervisor rather than run on as an orphan
    libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL as libc::c_ulong, 0, 0, 0);
    // lead a fresh process group so a stop can signal the whole tree
    libc::setpgid(0, 0);

    libc::dup2(stdin, 0);
    libc::dup2(stdout, 1);
    libc::dup2(stderr, 2);

    libc::execvp(program, argv);
    libc::_exit(127);
}

fn cstring(value: &str) -> io::Result<CString> {
    CString::new(value)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "argument contains a NUL byte"))
}
