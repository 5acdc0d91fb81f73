//! Uniform byte reads from the caller's own address space or from a
//! stopped tracee's.
//!
//! The tracee path assembles ranges out of `PTRACE_PEEKDATA` words, so it
//! is slow; it exists because it works on any process we are attached to,
//! with no setup beyond the attach itself.

use nix::sys::ptrace;
use nix::unistd::Pid;
use std::cmp;
use std::mem;

const WORD: usize = mem::size_of::<libc::c_long>();

/// Read `buf.len()` bytes starting at `addr`.
///
/// With `pid == None` the range is read from the caller's own address
/// space with a plain copy. With `pid == Some(..)` the caller must already
/// be attached to that process as a debugger and the tracee must be
/// stopped; the range is then assembled word by word, handling a
/// misaligned start, the aligned middle, and a short tail. Any failed peek
/// fails the whole read.
pub fn read_bytes(pid: Option<Pid>, addr: usize, buf: &mut [u8]) -> nix::Result<()> {
    let pid = match pid {
        Some(pid) => pid,
        None => {
            unsafe {
                std::ptr::copy_nonoverlapping(addr as *const u8, buf.as_mut_ptr(), buf.len());
            }
            return Ok(());
        }
    };

    let mut addr = addr;
    let mut done = 0;
    while done < buf.len() {
        let misalign = addr % WORD;
        let left = buf.len() - done;
        if misalign != 0 || left < WORD {
            let word = ptrace::read(pid, (addr - misalign) as ptrace::AddressType)?;
            let bytes = word.to_ne_bytes();
            let take = cmp::min(WORD - misalign, left);
            buf[done..done + take].copy_from_slice(&bytes[misalign..misalign + take]);
            addr += take;
            done += take;
        } else {
            let word = ptrace::read(pid, addr as ptrace::AddressType)?;
            buf[done..done + WORD].copy_from_slice(&word.to_ne_bytes());
            addr += WORD;
            done += WORD;
        }
    }
    Ok(())
}

/// [`read_bytes`], then reverse the buffer. Selected at image-load time
/// when an image's recorded byte order disagrees with the host's.
pub fn read_bytes_swapped(pid: Option<Pid>, addr: usize, buf: &mut [u8]) -> nix::Result<()> {
    read_bytes(pid, addr, buf)?;
    buf.reverse();
    Ok(())
}

/// Single bytes are endian-neutral, so this always takes the raw path.
pub fn read_u8(pid: Option<Pid>, addr: usize) -> nix::Result<u8> {
    let mut buf = [0u8; 1];
    read_bytes(pid, addr, &mut buf)?;
    Ok(buf[0])
}
