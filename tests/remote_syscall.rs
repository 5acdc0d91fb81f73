//! End-to-end scenarios against a forked target that idles in `pause()`.
//!
//! A forked child keeps this process's libc image and `[stack]` region at
//! the same addresses, is always attachable (it is our own child), and
//! never leaves libc on its own, which makes before/after comparisons
//! meaningful.

use nix::sys::ptrace;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, getpid, ForkResult, Pid};
use std::ffi::CString;
use std::fs;
use std::os::raw::c_long;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A target process that loops in pause() until killed.
struct Target(Pid);

impl Target {
    fn spawn() -> Target {
        match fork().expect("fork target") {
            ForkResult::Child => loop {
                unsafe {
                    libc::pause();
                }
            },
            ForkResult::Parent { child } => Target(child),
        }
    }

    fn pid(&self) -> Pid {
        self.0
    }
}

impl Drop for Target {
    fn drop(&mut self) {
        let _ = kill(self.0, Signal::SIGKILL);
        let _ = waitpid(self.0, None);
    }
}

/// Read bytes out of the (running) target by attaching around the read.
fn read_target_bytes(pid: Pid, addr: usize, buf: &mut [u8]) {
    ptrace::attach(pid).expect("verification attach");
    waitpid(pid, None).expect("verification stop");
    pscall::remote_mem::read_bytes(Some(pid), addr, buf).expect("verification read");
    ptrace::detach(pid, None).expect("verification detach");
}

#[test]
fn getpid_in_target_returns_target_pid() {
    init_logging();
    let target = Target::spawn();
    let ret = pscall::remote_syscall(target.pid(), libc::SYS_getpid, &[]).expect("remote getpid");
    assert_eq!(ret, target.pid().as_raw() as c_long);

    // Registers were restored, so a second call behaves identically.
    let again =
        pscall::remote_syscall(target.pid(), libc::SYS_getpid, &[]).expect("second remote getpid");
    assert_eq!(again, ret);
}

#[test]
fn getppid_in_target_returns_caller_pid() {
    init_logging();
    let target = Target::spawn();
    let ret = pscall::remote_syscall(target.pid(), libc::SYS_getppid, &[]).expect("remote getppid");
    assert_eq!(ret, getpid().as_raw() as c_long);
}

#[test]
fn open_and_read_inside_target() {
    init_logging();
    let path = std::env::temp_dir().join(format!("pscall-probe-{}.txt", getpid()));
    let content = b"bytes observed through a remote descriptor\n";
    fs::write(&path, &content[..]).expect("write probe file");
    // The CString is allocated before the fork, so the same address is
    // valid inside the copy-on-write child.
    let cpath = CString::new(path.to_str().unwrap()).unwrap();

    let target = Target::spawn();
    let fd = pscall::remote_syscall(
        target.pid(),
        libc::SYS_openat,
        &[
            libc::AT_FDCWD as c_long,
            cpath.as_ptr() as c_long,
            libc::O_RDONLY as c_long,
        ],
    )
    .expect("remote openat");
    assert!(fd >= 0, "descriptor in the target's table: {}", fd);

    // Land the read in the target's stack region, well past the
    // executor's scratch window.
    let stack = pscall::proc_maps::find_by_path(target.pid(), "[stack]")
        .unwrap()
        .expect("target has a [stack] region");
    let buf_va = stack.start + 0x4000;
    let nread = pscall::remote_syscall(
        target.pid(),
        libc::SYS_read,
        &[fd, buf_va as c_long, content.len() as c_long],
    )
    .expect("remote read");
    assert_eq!(nread as usize, content.len());

    let mut seen = vec![0u8; content.len()];
    read_target_bytes(target.pid(), buf_va, &mut seen);
    assert_eq!(&seen[..], &content[..]);

    drop(target);
    let _ = fs::remove_file(&path);
}

#[test]
fn kill_sig0_probes_target_existence() {
    init_logging();
    let target = Target::spawn();
    let ret = pscall::remote_syscall(
        target.pid(),
        libc::SYS_kill,
        &[target.pid().as_raw() as c_long, 0],
    )
    .expect("remote kill");
    assert_eq!(ret, 0);
}

#[test]
fn out_of_range_syscall_number_returns_enosys() {
    init_logging();
    let target = Target::spawn();
    let ret = pscall::remote_syscall(target.pid(), 100_000, &[]).expect("remote bad syscall");
    assert_eq!(ret, -(libc::ENOSYS as c_long));
}

#[test]
fn attach_to_missing_pid_fails() {
    init_logging();
    // Far beyond any configurable pid_max.
    let ret = pscall::remote_syscall(Pid::from_raw(0x7fff_fffe), libc::SYS_getpid, &[]);
    match ret {
        Err(pscall::Error::Attach(_)) => {}
        other => panic!("expected an attach failure, got {:?}", other),
    }
}

#[test]
fn stack_above_scratch_window_is_preserved() {
    init_logging();
    let target = Target::spawn();
    let stack = pscall::proc_maps::find_by_path(target.pid(), "[stack]")
        .unwrap()
        .expect("target has a [stack] region");
    // Comfortably past every scratch block the executor could write.
    let probe_va = stack.start + 0x2000;

    let mut before = [0u8; 64];
    read_target_bytes(target.pid(), probe_va, &mut before);

    let ret = pscall::remote_syscall(target.pid(), libc::SYS_getpid, &[]).expect("remote getpid");
    assert_eq!(ret, target.pid().as_raw() as c_long);

    let mut after = [0u8; 64];
    read_target_bytes(target.pid(), probe_va, &mut after);
    assert_eq!(before[..], after[..]);
}

#[test]
fn architecture_descriptor_is_probed_once() {
    init_logging();
    let desc = pscall::architecture().expect("probe");
    let pcs = desc
        .roles
        .iter()
        .filter(|r| **r == pscall::RegisterRole::ProgramCounter)
        .count();
    let rets = desc
        .roles
        .iter()
        .filter(|r| **r == pscall::RegisterRole::SyscallReturn)
        .count();
    assert_eq!(pcs, 1);
    assert_eq!(rets, 1);

    // Probe-free afterwards: the same shared descriptor comes back.
    let again = pscall::architecture().expect("cached descriptor");
    assert!(std::ptr::eq(desc, again));
}
