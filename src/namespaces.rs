//! Creation of the namespace set the sandbox lives in.
//!
//! Everything is requested with a single unshare so the later pipeline
//! steps (mounts, id maps, hostname, pivot) already run inside the new
//! world. The kernel has a known race where concurrent namespace
//! operations in unrelated processes make unshare fail with a spurious
//! EINVAL (https://lkml.org/lkml/2015/7/28/833), so that errno, and only
//! that errno, is retried with exponential backoff.

use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::mount::MsFlags;
use nix::sched::{self, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use std::path::Path;

use crate::syscall::Syscall;

const MAX_UNSHARE_ATTEMPTS: u32 = 100;
/// Backoff starts at one microsecond and doubles up to this ceiling.
const MAX_BACKOFF_MICROS: u64 = 250_000;

const PROBE_STACK_SIZE: usize = 1024 * 1024;

/// The namespaces every sandbox gets; the network namespace is opt-in.
pub fn clone_flags(create_netns: bool) -> CloneFlags {
    let mut flags = CloneFlags::CLONE_NEWUSER
        | CloneFlags::CLONE_NEWNS
        | CloneFlags::CLONE_NEWUTS
        | CloneFlags::CLONE_NEWIPC;
    if create_netns {
        flags |= CloneFlags::CLONE_NEWNET;
    }
    flags
}

/// Unshares the requested namespace set and immediately makes the mount
/// namespace recursively private, so nothing mounted from here on
/// propagates back to the host.
pub fn create(syscall: &dyn Syscall, create_netns: bool) -> Result<()> {
    let flags = clone_flags(create_netns);
    let mut delay = 1u64;
    let mut attempts = 0;
    loop {
        attempts += 1;
        match syscall.unshare(flags) {
            Ok(()) => {
                log::debug!("unshare succeeded after {} attempt(s)", attempts);
                break;
            }
            Err(Errno::EINVAL) if attempts < MAX_UNSHARE_ATTEMPTS => {
                thread::sleep(Duration::from_micros(delay));
                if delay < MAX_BACKOFF_MICROS {
                    delay *= 2;
                }
            }
            Err(Errno::EINVAL) => {
                bail!(
                    "unshare failed with EINVAL even after {} attempts, giving up",
                    attempts
                );
            }
            Err(errno) => {
                return Err(errno).context("unshare failed");
            }
        }
    }

    syscall
        .mount(
            None,
            Path::new("/"),
            None,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None,
        )
        .context("failed to make the mount namespace private")?;

    Ok(())
}

/// Checks whether the kernel supports all five namespace types by
/// cloning a child that carries every isolation flag and exits at once.
/// clone(2) is used instead of unshare so the EINVAL race above cannot
/// produce a spurious "unsupported" verdict; the check has to be fast
/// and cannot afford the retry loop.
pub fn probe() -> Result<()> {
    let mut stack = vec![0u8; PROBE_STACK_SIZE];
    let flags = clone_flags(true);
    let child = unsafe {
        sched::clone(
            Box::new(|| 0),
            &mut stack,
            flags,
            Some(libc::SIGCHLD),
        )
    }
    .context("clone failed, required namespaces are not supported")?;

    match waitpid(child, None).context("waitpid on the probe child failed")? {
        WaitStatus::Exited(_, 0) => Ok(()),
        status => bail!("probe child did not exit cleanly: {:?}", status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscall::test::TestHelperSyscall;
    use std::path::PathBuf;

    #[test]
    fn test_clone_flags() {
        let base = clone_flags(false);
        assert!(base.contains(CloneFlags::CLONE_NEWUSER));
        assert!(base.contains(CloneFlags::CLONE_NEWNS));
        assert!(base.contains(CloneFlags::CLONE_NEWUTS));
        assert!(base.contains(CloneFlags::CLONE_NEWIPC));
        assert!(!base.contains(CloneFlags::CLONE_NEWNET));
        assert!(clone_flags(true).contains(CloneFlags::CLONE_NEWNET));
    }

    #[test]
    fn test_create_unshares_then_privatizes_root() {
        let syscall = TestHelperSyscall::default();
        create(&syscall, false).unwrap();

        assert_eq!(syscall.get_unshare_args(), vec![clone_flags(false)]);
        let mounts = syscall.get_mount_args();
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].source, None);
        assert_eq!(mounts[0].target, PathBuf::from("/"));
        assert_eq!(mounts[0].flags, MsFlags::MS_REC | MsFlags::MS_PRIVATE);
    }

    #[test]
    fn test_create_retries_einval() {
        let syscall = TestHelperSyscall::default();
        syscall.set_unshare_errors(vec![Errno::EINVAL, Errno::EINVAL, Errno::EINVAL]);
        create(&syscall, true).unwrap();

        // Three failed attempts plus the one that succeeded.
        assert_eq!(syscall.get_unshare_args().len(), 4);
        assert_eq!(syscall.get_unshare_args()[0], clone_flags(true));
    }

    #[test]
    fn test_create_aborts_on_other_errors() {
        let syscall = TestHelperSyscall::default();
        syscall.set_unshare_errors(vec![Errno::EPERM]);
        let err = create(&syscall, false).unwrap_err();

        assert!(err.to_string().contains("unshare failed"));
        assert_eq!(syscall.get_unshare_args().len(), 1);
        // The mount namespace was never privatized.
        assert!(syscall.get_mount_args().is_empty());
    }
}
