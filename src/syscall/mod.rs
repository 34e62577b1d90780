//! An interface trait so that the rest of the sandbox can invoke the
//! privileged kernel operations it needs without having to worry about
//! their implementation details. Failures carry the raw errno where the
//! caller's control flow depends on it (the `EINVAL` retry on unshare,
//! the tolerated read-only remount); everything else is reported through
//! `anyhow` with context and aborts the pipeline. There is deliberately
//! no cleanup path: partially constructed namespaces and mounts are
//! reclaimed by the kernel when the process exits.

use std::any::Any;
use std::path::Path;

use anyhow::Result;
use nix::errno::Errno;
use nix::mount::{MntFlags, MsFlags};
use nix::sched::CloneFlags;
use nix::unistd::{Gid, Uid};

pub mod linux;

pub use linux::LinuxSyscall;
pub use test::TestHelperSyscall;

/// The kernel facilities required to assemble a sandbox.
pub trait Syscall {
    fn as_any(&self) -> &dyn Any;
    fn unshare(&self, flags: CloneFlags) -> Result<(), Errno>;
    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<(), Errno>;
    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()>;
    fn symlink(&self, original: &Path, link: &Path) -> Result<()>;
    fn chdir(&self, path: &Path) -> Result<()>;
    fn chroot(&self, path: &Path) -> Result<()>;
    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<()>;
    fn set_hostname(&self, hostname: &str) -> Result<()>;
    fn set_id(&self, uid: Uid, gid: Gid) -> Result<()>;
}

pub fn create_syscall() -> Box<dyn Syscall> {
    if cfg!(test) {
        Box::<TestHelperSyscall>::default()
    } else {
        Box::new(LinuxSyscall)
    }
}
