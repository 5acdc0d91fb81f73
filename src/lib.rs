//! Run a system call inside another process.
//!
//! `pscall` attaches to a target as a debugger, resolves the `syscall`
//! trampoline inside the target's own loaded C runtime by walking its ELF
//! image through debugger reads, captures a realistic register and stack
//! context from a faulted local child, splices that context into the
//! target for exactly one syscall, and restores the target afterwards.
//! Which register slots hold the program counter, the stack pointer and
//! the syscall result is discovered at runtime by a one-shot probe rather
//! than per-architecture tables.
//!
//! ```no_run
//! use nix::unistd::Pid;
//!
//! // getpid(2), as observed by process 4711.
//! let pid = pscall::remote_syscall(Pid::from_raw(4711), libc::SYS_getpid, &[])?;
//! assert_eq!(pid, 4711);
//! # Ok::<(), pscall::Error>(())
//! ```
//!
//! No code is written into the target: the one executed instruction
//! sequence is the target's own `syscall()` function, and both its
//! registers and the borrowed sliver of its stack are rolled back before
//! detaching.

use lazy_static::lazy_static;
use nix::unistd::Pid;
use std::fmt;
use std::os::raw::c_long;

pub mod arch;
pub mod elf;
pub mod proc_maps;
pub mod registers;
pub mod remote_mem;

mod executor;

pub use crate::arch::{ArchDescriptor, ProbeError, RegisterRole};

/// Failure kinds of a remote invocation, each distinguishable by the
/// caller. No partial results: any failure leaves the target restored and
/// detached.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Error {
    /// First-use architecture discovery failed. Sticky: later calls fail
    /// the same way without re-probing.
    Probe(ProbeError),
    /// The target could not be attached.
    Attach(nix::Error),
    /// The target never reached a debugger stop after attach.
    TargetUnstoppable,
    /// No loaded image in the target matched the C-runtime naming rule
    /// with a resolvable `syscall` symbol, or the target has no usable
    /// main stack.
    RuntimeNotFound,
    /// The local context-capture child could not be created or stopped.
    SacrificeFailed,
    /// The spliced syscall did not reach its exit stop; the target exited
    /// or was killed during execution.
    ExecutionFailed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Probe(e) => write!(f, "architecture probe failed: {}", e),
            Error::Attach(e) => write!(f, "cannot attach to the target: {}", e),
            Error::TargetUnstoppable => write!(f, "failed to stop the target"),
            Error::RuntimeNotFound => {
                write!(f, "no usable C runtime or main stack in the target")
            }
            Error::SacrificeFailed => write!(f, "failed to stop a context-capture child"),
            Error::ExecutionFailed => write!(f, "the spliced syscall did not complete"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Probe(e) => Some(e),
            Error::Attach(e) => Some(e),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

lazy_static! {
    /// Probed exactly once per process on first use; read-only afterwards.
    static ref ARCH: std::result::Result<ArchDescriptor, ProbeError> = arch::probe();
}

/// The process-wide architecture descriptor, probing on first use. A
/// probe failure is sticky for the life of the process.
pub fn architecture() -> Result<&'static ArchDescriptor> {
    ARCH.as_ref().map_err(|e| Error::Probe(*e))
}

/// Invoke syscall `number` inside `pid` with up to six integer-width
/// arguments, and return the raw kernel result exactly as the target
/// observed it (error results come back as negative errno values, before
/// any libc translation).
///
/// Slots past `args.len()` reach the kernel as unspecified junk it never
/// consumes, matching the variadic C entry point this mirrors; entries
/// past the sixth are ignored.
pub fn remote_syscall(pid: Pid, number: c_long, args: &[c_long]) -> Result<c_long> {
    let mut argv = [0 as c_long; 6];
    for (slot, arg) in argv.iter_mut().zip(args.iter()) {
        *slot = *arg;
    }
    remote_syscall6(pid, number, argv)
}

/// Fixed-arity variant of [`remote_syscall`].
pub fn remote_syscall6(pid: Pid, number: c_long, argv: [c_long; 6]) -> Result<c_long> {
    let desc = architecture()?;
    executor::execute(desc, pid, number, argv)
}
