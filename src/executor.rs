//! Per-call orchestration: attach to the target, resolve the `syscall`
//! trampoline inside its own C runtime, borrow a faulted local child's
//! register and stack context as a template, run exactly one syscall in
//! the target, and put everything back.

use crate::arch::{self, ArchDescriptor, RegisterRole};
use crate::elf::ElfImage;
use crate::proc_maps::{self, MapsIter, Perms};
use crate::registers::RegisterFile;
use crate::{Error, Result};
use log::debug;
use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::mem;
use std::os::raw::{c_long, c_void};

/// Offset of the scratch area into the low edge of the target's main
/// stack: junk bytes far below anything live.
const STACK_SCRATCH_OFFSET: usize = 0x80;
/// Words of live sacrificial stack transplanted per stack-pointer slot.
const STACK_WORDS: usize = 0x10;

const WORD: usize = mem::size_of::<c_long>();

/// Attachment to the target, holding the register file to put back.
/// Every exit path restores and detaches through the destructor.
struct TracedTarget {
    pid: Pid,
    saved: Option<RegisterFile>,
}

impl TracedTarget {
    fn attach(pid: Pid) -> Result<TracedTarget> {
        ptrace::attach(pid).map_err(Error::Attach)?;
        let traced = TracedTarget { pid, saved: None };
        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(..)) => Ok(traced),
            _ => Err(Error::TargetUnstoppable),
        }
    }
}

impl Drop for TracedTarget {
    fn drop(&mut self) {
        if let Some(saved) = &self.saved {
            let _ = saved.write_to(self.pid);
        }
        let _ = ptrace::detach(self.pid, None);
    }
}

/// The forked context-capture child, killed and reaped by the destructor.
struct Sacrifice {
    pid: Pid,
}

impl Sacrifice {
    /// Fork a child that stages `(number, argv)` in the variadic call ABI
    /// and faults at the call, then bring it to that faulted stop. The
    /// crash freezes registers and stack in exactly the state a real
    /// caller of `syscall(number, ...)` would present.
    fn capture(number: c_long, argv: &[c_long; 6]) -> Result<Sacrifice> {
        let child = match fork().map_err(|_| Error::SacrificeFailed)? {
            ForkResult::Child => {
                // Only async-signal-safe work between fork and _exit.
                if ptrace::traceme().is_ok() && kill(nix::unistd::getpid(), Signal::SIGSTOP).is_ok()
                {
                    unsafe {
                        arch::call_scrambled(arch::scrambled(execute as usize), number, argv);
                    }
                }
                unsafe { libc::_exit(0) }
            }
            ForkResult::Parent { child } => child,
        };
        let sacrifice = Sacrifice { pid: child };
        let mut status = waitpid(child, None).map_err(|_| Error::SacrificeFailed)?;
        if let WaitStatus::Stopped(_, Signal::SIGSTOP) = status {
            ptrace::cont(child, None).map_err(|_| Error::SacrificeFailed)?;
            status = waitpid(child, None).map_err(|_| Error::SacrificeFailed)?;
        }
        match status {
            WaitStatus::Stopped(..) => Ok(sacrifice),
            _ => Err(Error::SacrificeFailed),
        }
    }
}

impl Drop for Sacrifice {
    fn drop(&mut self) {
        let _ = kill(self.pid, Signal::SIGKILL);
        let _ = waitpid(self.pid, None);
    }
}

/// Backing-path test for the C runtime image: the file name contains
/// `libc`, then an optional version run, then the shared-object suffix,
/// then optionally a further version run (`libc-2.31.so`, `libc.so.6`).
pub(crate) fn is_libc_path(path: &str) -> bool {
    let file = path.rsplit('/').next().unwrap_or(path);
    let rest = match file.find("libc") {
        Some(at) => &file[at + 4..],
        None => return false,
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit() || c == '.' || c == '-');
    if !rest.starts_with("so") {
        return false;
    }
    rest[2..]
        .chars()
        .all(|c| c.is_ascii_digit() || c == '.' || c == '-')
}

/// Invoke `number` with `argv` inside `pid` and return the raw kernel
/// result as the target observed it.
pub(crate) fn execute(
    arch_desc: &ArchDescriptor,
    pid: Pid,
    number: c_long,
    argv: [c_long; 6],
) -> Result<c_long> {
    let mut target = TracedTarget::attach(pid)?;

    // The syscall trampoline inside the target's C runtime, and the
    // target's main stack.
    let mut syscall_va = 0usize;
    for region in MapsIter::open(pid).map_err(|_| Error::RuntimeNotFound)? {
        if !is_libc_path(&region.path) {
            continue;
        }
        if let Some(va) =
            ElfImage::load(Some(pid), region.start).and_then(|image| image.resolve(b"syscall"))
        {
            syscall_va = va;
            break;
        }
    }
    if syscall_va == 0 {
        return Err(Error::RuntimeNotFound);
    }
    let stack = proc_maps::find_by_path(pid, "[stack]")
        .map_err(|_| Error::RuntimeNotFound)?
        .ok_or(Error::RuntimeNotFound)?;
    debug!(
        "target {}: syscall() at {:#x}, stack at {:#x}-{:#x}",
        pid, syscall_va, stack.start, stack.end
    );

    let sp_slots: Vec<usize> = arch_desc
        .roles
        .iter()
        .enumerate()
        .filter(|(_, role)| **role == RegisterRole::StackPointer)
        .map(|(slot, _)| slot)
        .collect();
    if stack.end - stack.start < STACK_SCRATCH_OFFSET + sp_slots.len() * STACK_WORDS * WORD {
        // Too shallow to hold the scratch blocks.
        return Err(Error::RuntimeNotFound);
    }
    let mut scratch_va = stack.start + STACK_SCRATCH_OFFSET;

    let sacrifice = Sacrifice::capture(number, &argv)?;
    let template = RegisterFile::read_from(sacrifice.pid).map_err(|_| Error::SacrificeFailed)?;

    let saved = RegisterFile::read_from(pid).map_err(|_| Error::ExecutionFailed)?;
    target.saved = Some(saved);

    // Splice: the template context, pointed at the target's trampoline,
    // with each live stack-pointer block transplanted into the scratch
    // area.
    let mut spliced = template;
    spliced[arch_desc.pc] = syscall_va;
    for &slot in &sp_slots {
        // An alias that does not point into readable-writable memory of
        // the sacrifice carries no live stack.
        match proc_maps::find_by_addr(sacrifice.pid, template[slot]) {
            Ok(Some(region)) if region.perms.contains(Perms::READ | Perms::WRITE) => {}
            _ => continue,
        }
        for word_idx in 0..STACK_WORDS {
            let word = ptrace::read(
                sacrifice.pid,
                (template[slot] + word_idx * WORD) as ptrace::AddressType,
            )
            .map_err(|_| Error::ExecutionFailed)?;
            unsafe {
                ptrace::write(
                    pid,
                    (scratch_va + word_idx * WORD) as ptrace::AddressType,
                    word as *mut c_void,
                )
            }
            .map_err(|_| Error::ExecutionFailed)?;
        }
        spliced[slot] = scratch_va;
        scratch_va += STACK_WORDS * WORD;
    }
    drop(sacrifice);

    // Run exactly one syscall: write the spliced file, step through the
    // entry and exit stops, harvest the return slot.
    spliced.write_to(pid).map_err(|_| Error::ExecutionFailed)?;
    ptrace::syscall(pid, None).map_err(|_| Error::ExecutionFailed)?;
    let mut status = waitpid(pid, None).map_err(|_| Error::ExecutionFailed)?;
    if arch::is_syscall_trap(&status) {
        ptrace::syscall(pid, None).map_err(|_| Error::ExecutionFailed)?;
        status = waitpid(pid, None).map_err(|_| Error::ExecutionFailed)?;
    }
    match status {
        WaitStatus::Stopped(..) | WaitStatus::PtraceSyscall(..) => {
            let after = RegisterFile::read_from(pid).map_err(|_| Error::ExecutionFailed)?;
            let result = after[arch_desc.ret] as c_long;
            debug!("syscall {} in target {} returned {}", number, pid, result);
            Ok(result)
        }
        _ => {
            // The target exited or was killed mid-call; there is nothing
            // left to restore.
            target.saved = None;
            Err(Error::ExecutionFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn libc_naming_rule() {
        assert!(is_libc_path("/usr/lib/x86_64-linux-gnu/libc.so.6"));
        assert!(is_libc_path("/lib/i386-linux-gnu/libc-2.31.so"));
        assert!(is_libc_path("libc.so"));
        assert!(!is_libc_path("/usr/lib/libcrypto.so.1.1"));
        assert!(!is_libc_path("/usr/lib/libcap.so.2"));
        assert!(!is_libc_path("/usr/lib/liblibcmock.txt"));
        assert!(!is_libc_path("/usr/bin/cat"));
        assert!(!is_libc_path("[stack]"));
        assert!(!is_libc_path(""));
    }
}
