//! The debugger-visible register file as an ordered sequence of machine
//! words.
//!
//! Role discovery treats the file as opaque storage: nothing in this crate
//! knows at compile time which slot is which. The native
//! `user_regs_struct` view exists only to ride the bulk
//! `PTRACE_GETREGS`/`PTRACE_SETREGS` primitives.

use nix::sys::ptrace;
use nix::unistd::Pid;
use static_assertions::const_assert_eq;
use std::mem;
use std::ops::{Index, IndexMut};

/// Number of word-sized slots the bulk-register primitive exposes.
pub const NREG_SLOTS: usize =
    mem::size_of::<libc::user_regs_struct>() / mem::size_of::<usize>();

const_assert_eq!(mem::size_of::<libc::user_regs_struct>() % mem::size_of::<usize>(), 0);

#[repr(C)]
#[derive(Copy, Clone)]
union RegisterRepr {
    native: libc::user_regs_struct,
    words: [usize; NREG_SLOTS],
}

/// One bulk snapshot of a stopped tracee's general-purpose registers,
/// indexable by slot.
#[derive(Copy, Clone)]
pub struct RegisterFile {
    u: RegisterRepr,
}

impl RegisterFile {
    /// Snapshot the register file of the stopped tracee `pid`.
    pub fn read_from(pid: Pid) -> nix::Result<RegisterFile> {
        let native = ptrace::getregs(pid)?;
        Ok(RegisterFile {
            u: RegisterRepr { native },
        })
    }

    /// Write this register file into the stopped tracee `pid`.
    pub fn write_to(&self, pid: Pid) -> nix::Result<()> {
        ptrace::setregs(pid, unsafe { self.u.native })
    }

    pub fn words(&self) -> &[usize; NREG_SLOTS] {
        unsafe { &self.u.words }
    }
}

impl Default for RegisterFile {
    fn default() -> RegisterFile {
        RegisterFile {
            u: RegisterRepr {
                words: [0; NREG_SLOTS],
            },
        }
    }
}

impl Index<usize> for RegisterFile {
    type Output = usize;

    fn index(&self, slot: usize) -> &usize {
        unsafe { &self.u.words[slot] }
    }
}

impl IndexMut<usize> for RegisterFile {
    fn index_mut(&mut self, slot: usize) -> &mut usize {
        unsafe { &mut self.u.words[slot] }
    }
}
