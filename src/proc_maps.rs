//! Enumeration of a process's loaded memory regions.
//!
//! The source is the kernel's `/proc/<pid>/maps` pseudo-file:
//!
//! ```text
//! address           perms offset  dev   inode   pathname
//! 00400000-00580000 r-xp 00000000 fe:01 4858009 /usr/lib/nethack/nethack
//! ```

use bitflags::bitflags;
use nix::unistd::Pid;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Lines};

bitflags! {
    /// Permission and visibility bits from the four-character `rwxp`
    /// column (dash for absent).
    pub struct Perms: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const PRIVATE = 1 << 3;
        const SHARED = 1 << 4;
    }
}

impl Perms {
    fn parse(column: &str) -> Option<Perms> {
        if column.len() != 4 {
            return None;
        }
        let mut perms = Perms::empty();
        for (pos, c) in column.chars().enumerate() {
            perms |= match (pos, c) {
                (0, 'r') => Perms::READ,
                (1, 'w') => Perms::WRITE,
                (2, 'x') => Perms::EXEC,
                (3, 'p') => Perms::PRIVATE,
                (3, 's') => Perms::SHARED,
                (_, '-') => Perms::empty(),
                _ => return None,
            };
        }
        Some(perms)
    }
}

/// One loaded region: a half-open address range, its permissions, and the
/// backing path. Anonymous regions carry an empty path; special regions
/// keep their bracketed names (the main thread's stack is `[stack]`).
#[derive(Clone, Debug)]
pub struct MemoryRegion {
    pub start: usize,
    pub end: usize,
    pub perms: Perms,
    pub path: String,
}

impl MemoryRegion {
    pub fn contains(&self, addr: usize) -> bool {
        self.start <= addr && addr < self.end
    }
}

/// Lazy iterator over the regions of one process, scoped to a single
/// enumeration pass.
pub struct MapsIter {
    lines: Lines<BufReader<File>>,
}

impl MapsIter {
    pub fn open(pid: Pid) -> io::Result<MapsIter> {
        let file = File::open(format!("/proc/{}/maps", pid))?;
        Ok(MapsIter {
            lines: BufReader::new(file).lines(),
        })
    }
}

impl Iterator for MapsIter {
    type Item = MemoryRegion;

    fn next(&mut self) -> Option<MemoryRegion> {
        let line = self.lines.next()?.ok()?;
        parse_region(&line)
    }
}

fn parse_region(line: &str) -> Option<MemoryRegion> {
    let mut fields = line.splitn(6, ' ');
    let range = fields.next()?;
    let perms = Perms::parse(fields.next()?)?;
    let _offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    // The path column is padded with spaces and may itself contain them.
    let path = fields
        .next()
        .map_or_else(String::new, |p| p.trim_start().to_string());

    let mut bounds = range.splitn(2, '-');
    let start = usize::from_str_radix(bounds.next()?, 16).ok()?;
    let end = usize::from_str_radix(bounds.next()?, 16).ok()?;
    Some(MemoryRegion {
        start,
        end,
        perms,
        path,
    })
}

/// First region of `pid` containing `addr`.
pub fn find_by_addr(pid: Pid, addr: usize) -> io::Result<Option<MemoryRegion>> {
    Ok(MapsIter::open(pid)?.find(|region| region.contains(addr)))
}

/// First region of `pid` whose backing path is exactly `path`.
pub fn find_by_path(pid: Pid, path: &str) -> io::Result<Option<MemoryRegion>> {
    Ok(MapsIter::open(pid)?.find(|region| region.path == path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn parses_backed_and_anonymous_rows() {
        let backed = "00400000-00580000 r-xp 00000000 fe:01 4858009 /usr/lib/nethack/nethack";
        let region = parse_region(backed).unwrap();
        assert_eq!(region.start, 0x0040_0000);
        assert_eq!(region.end, 0x0058_0000);
        assert!(region.perms.contains(Perms::READ | Perms::EXEC | Perms::PRIVATE));
        assert!(!region.perms.contains(Perms::WRITE));
        assert_eq!(region.path, "/usr/lib/nethack/nethack");

        let anon = "7f1c2000-7f1c3000 rw-p 00000000 00:00 0";
        let region = parse_region(anon).unwrap();
        assert_eq!(region.path, "");
        assert!(region.perms.contains(Perms::WRITE));

        let stack = "7ffd1000-7ffd2000 rw-p 00000000 00:00 0                          [stack]";
        assert_eq!(parse_region(stack).unwrap().path, "[stack]");
    }

    #[test]
    fn rejects_malformed_rows() {
        assert!(parse_region("").is_none());
        assert!(parse_region("not-a-range rwxp 0 0 0").is_none());
        assert!(parse_region("1000-2000 rwzp 0 0 0").is_none());
    }

    #[test]
    fn enumerates_own_regions() {
        let regions: Vec<MemoryRegion> = MapsIter::open(getpid()).unwrap().collect();
        assert!(!regions.is_empty());
        for region in &regions {
            assert!(region.start < region.end);
        }
    }

    #[test]
    fn finds_region_by_address() {
        let text_addr = parse_region as usize;
        let region = find_by_addr(getpid(), text_addr).unwrap().expect("text region");
        assert!(region.contains(text_addr));
        assert!(region.perms.contains(Perms::EXEC));
    }

    #[test]
    fn finds_main_stack_by_sentinel_path() {
        let stack = find_by_path(getpid(), "[stack]").unwrap();
        assert!(stack.is_some());
    }
}
