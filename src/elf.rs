//! Read-only walker for loaded ELF images and the dynamic-symbol resolver
//! built on it.
//!
//! The walker operates over a *process's memory*, not a file: every field
//! is pulled through [`crate::remote_mem`], so the same code parses an
//! image in the caller's own address space or in a stopped tracee's. It
//! never needs section headers; the symbol and string tables come out of
//! the DYNAMIC segment, and symbol iteration is bounded by the gap between
//! the two tables.

use crate::remote_mem;
use nix::unistd::Pid;

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

const DT_NULL: usize = 0;
const DT_STRTAB: usize = 5;
const DT_SYMTAB: usize = 6;
const DT_STRSZ: usize = 10;
const DT_SYMENT: usize = 11;

const ET_EXEC: u16 = 2;

/// A loaded ELF image bound to `(pid, base)`, transient and scoped to one
/// symbol-resolution attempt. `pid == None` reads the caller's own address
/// space.
///
/// After a successful load the symbol table, string table, symbol-entry
/// size and string-table size are all nonzero. For `ET_EXEC` images they
/// are absolute addresses; for position-independent images they are
/// offsets, biased by `base` at point of use.
pub struct ElfImage {
    pid: Option<Pid>,
    base: usize,
    /// ELF class: 1 = 32-bit, 2 = 64-bit.
    class: u8,
    /// The image's recorded byte order disagrees with the host's.
    swap: bool,
    etype: u16,
    /// The image's natural word size in bytes.
    word: usize,
    symtab: usize,
    syment: usize,
    strtab: usize,
    strsz: usize,
}

impl ElfImage {
    /// Parse the image loaded at `base` in `pid`.
    ///
    /// Returns `None` for anything that is not a well-formed dynamic ELF
    /// image: unrecognized magic, class, byte order or header version; no
    /// LOAD segment; a fixed-address executable whose lowest virtual
    /// address lies below `base` (the caller handed us the wrong base); or
    /// a dynamic table missing any of the four symbol/string values.
    pub fn load(pid: Option<Pid>, base: usize) -> Option<ElfImage> {
        let mut magic = [0u8; 4];
        remote_mem::read_bytes(pid, base, &mut magic).ok()?;
        if magic != ELF_MAGIC {
            return None;
        }
        let class = remote_mem::read_u8(pid, base + 4).ok()?;
        let data = remote_mem::read_u8(pid, base + 5).ok()?;
        let version = remote_mem::read_u8(pid, base + 6).ok()?;
        if class != 1 && class != 2 {
            return None;
        }
        if data != 1 && data != 2 {
            return None;
        }
        if version != 1 {
            return None;
        }

        let swap = (cfg!(target_endian = "little") && data == 2)
            || (cfg!(target_endian = "big") && data == 1);
        let mut image = ElfImage {
            pid,
            base,
            class,
            swap,
            etype: 0,
            word: 2 << class,
            symtab: 0,
            syment: 0,
            strtab: 0,
            strsz: 0,
        };
        image.etype = image.get16(base + 0x10)?;

        // e_phoff, e_phentsize, e_phnum sit at class-dependent offsets
        // past the identification block.
        let w = image.word;
        let phoff = image.getw(base + 0x18 + w)?;
        let phentsize = image.get16(base + 0x18 + w * 3 + 0x6)? as usize;
        let phnum = image.get16(base + 0x18 + w * 3 + 0x8)? as usize;

        let mut loads = 0;
        for i in 0..phnum {
            let ph = base + phoff + i * phentsize;
            let ptype = image.get32(ph)?;
            if ptype != PT_LOAD && ptype != PT_DYNAMIC {
                continue;
            }
            let offset = image.getw(ph + w)?;
            let vaddr = image.getw(ph + w * 2)?;
            let filesz = image.getw(ph + w * 4)?;
            let memsz = image.getw(ph + w * 5)?;
            if vaddr < offset || memsz < filesz {
                return None;
            }

            if ptype == PT_LOAD {
                if image.etype == ET_EXEC && vaddr - offset < base {
                    // `base` is not the lowest mapped address of this image.
                    return None;
                }
                loads += 1;
            } else {
                let table = if image.etype == ET_EXEC { vaddr } else { base + vaddr };
                let mut j = 0;
                while 2 * j * w < memsz {
                    let tag = image.getw(table + 2 * w * j)?;
                    if tag == DT_NULL {
                        break;
                    }
                    let value = image.getw(table + 2 * w * j + w)?;
                    match tag {
                        DT_STRTAB => image.strtab = value,
                        DT_SYMTAB => image.symtab = value,
                        DT_STRSZ => image.strsz = value,
                        DT_SYMENT => image.syment = value,
                        _ => {}
                    }
                    j += 1;
                }
            }
        }

        if loads > 0
            && image.strtab != 0
            && image.strsz != 0
            && image.symtab != 0
            && image.syment != 0
        {
            Some(image)
        } else {
            None
        }
    }

    /// In-memory address of dynamic symbol `name` (no NUL) in the owning
    /// process, or `None`. Position-independent values come back biased by
    /// the load base.
    pub fn resolve(&self, name: &[u8]) -> Option<usize> {
        let strtab = self.biased(self.strtab);
        let span = self.strtab.checked_sub(self.symtab)?;
        let mut i = 0;
        // An entry whose string offset escapes the string table marks the
        // structural end of the table, as does running into the table gap.
        while (i + 1) * self.syment <= span {
            let sym = self.biased(self.symtab) + i * self.syment;
            let stridx = self.get32(sym)? as usize;
            if stridx >= self.strsz {
                return None;
            }
            let mut value = self.getw(sym + self.word)?;
            if value != 0 {
                if self.etype != ET_EXEC {
                    value += self.base;
                }
                if self.name_matches(strtab, stridx, name) {
                    return Some(value);
                }
            }
            i += 1;
        }
        None
    }

    /// A table address recorded below the image base is an offset still in
    /// need of the load bias.
    fn biased(&self, addr: usize) -> usize {
        if addr < self.base {
            addr + self.base
        } else {
            addr
        }
    }

    fn name_matches(&self, strtab: usize, stridx: usize, name: &[u8]) -> bool {
        for (j, &expect) in name.iter().chain(std::iter::once(&0u8)).enumerate() {
            if stridx + j >= self.strsz {
                return false;
            }
            match remote_mem::read_u8(self.pid, strtab + stridx + j) {
                Ok(b) if b == expect => {}
                _ => return false,
            }
        }
        true
    }

    fn read(&self, addr: usize, buf: &mut [u8]) -> Option<()> {
        if self.swap {
            remote_mem::read_bytes_swapped(self.pid, addr, buf).ok()
        } else {
            remote_mem::read_bytes(self.pid, addr, buf).ok()
        }
    }

    fn get16(&self, addr: usize) -> Option<u16> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Some(u16::from_ne_bytes(buf))
    }

    fn get32(&self, addr: usize) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Some(u32::from_ne_bytes(buf))
    }

    fn get64(&self, addr: usize) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Some(u64::from_ne_bytes(buf))
    }

    /// Word-sized read, 32 or 64 bits by the image's recorded class.
    fn getw(&self, addr: usize) -> Option<usize> {
        if self.class == 1 {
            self.get32(addr).map(|v| v as usize)
        } else {
            self.get64(addr).map(|v| v as usize)
        }
    }
}
