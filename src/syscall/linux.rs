//! Implements the syscall seam for Linux through the `nix` wrappers.

use std::any::Any;
use std::path::Path;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{self, Gid, Uid};

use super::Syscall;

#[derive(Clone)]
pub struct LinuxSyscall;

impl Syscall for LinuxSyscall {
    fn as_any(&self) -> &dyn Any {
        self
    }

    // see https://man7.org/linux/man-pages/man2/unshare.2.html
    fn unshare(&self, flags: CloneFlags) -> Result<(), Errno> {
        unshare(flags)
    }

    fn mount(
        &self,
        source: Option<&Path>,
        target: &Path,
        fstype: Option<&str>,
        flags: MsFlags,
        data: Option<&str>,
    ) -> Result<(), Errno> {
        mount(source, target, fstype, flags, data)
    }

    fn umount2(&self, target: &Path, flags: MntFlags) -> Result<()> {
        umount2(target, flags)
            .with_context(|| format!("failed to unmount {}", target.display()))?;
        Ok(())
    }

    fn symlink(&self, original: &Path, link: &Path) -> Result<()> {
        std::os::unix::fs::symlink(original, link).with_context(|| {
            format!(
                "failed to symlink {} as {}",
                original.display(),
                link.display()
            )
        })?;
        Ok(())
    }

    fn chdir(&self, path: &Path) -> Result<()> {
        unistd::chdir(path).with_context(|| format!("failed to chdir to {}", path.display()))?;
        Ok(())
    }

    fn chroot(&self, path: &Path) -> Result<()> {
        unistd::chroot(path).with_context(|| format!("failed to chroot to {}", path.display()))?;
        Ok(())
    }

    fn pivot_root(&self, new_root: &Path, put_old: &Path) -> Result<()> {
        unistd::pivot_root(new_root, put_old).with_context(|| {
            format!(
                "pivot_root({}, {}) failed",
                new_root.display(),
                put_old.display()
            )
        })?;
        Ok(())
    }

    fn set_hostname(&self, hostname: &str) -> Result<()> {
        unistd::sethostname(hostname)
            .with_context(|| format!("failed to set {} as hostname", hostname))?;
        Ok(())
    }

    /// Make real, effective and saved ids all the given identity. The gid
    /// is changed first: once the uid has been dropped the process may no
    /// longer be allowed to change groups.
    fn set_id(&self, uid: Uid, gid: Gid) -> Result<()> {
        unistd::setresgid(gid, gid, gid)
            .with_context(|| format!("failed to setresgid to {}", gid))?;
        unistd::setresuid(uid, uid, uid)
            .with_context(|| format!("failed to setresuid to {}", uid))?;
        Ok(())
    }
}
