//! The final swap of the filesystem root. The old root is moved onto a
//! throwaway directory inside the new root, detached and removed, so
//! after this nothing outside the sandbox is reachable by absolute path.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::mount::MntFlags;

use crate::syscall::Syscall;

/// How many random old-root names to try before giving up. Collisions are
/// only possible if a previous run left debris in the sandbox root.
const OLD_ROOT_ATTEMPTS: u32 = 3;

/// Pivots the root to the current directory (the sandbox root) and then
/// enters the configured working directory. The caller must already have
/// chdir'd into the anchored sandbox root.
pub fn change_root(syscall: &dyn Syscall, working_dir: Option<&Path>) -> Result<()> {
    let old_root = create_old_root_dir()?;

    syscall.pivot_root(Path::new("."), &old_root)?;
    syscall.chroot(Path::new("."))?;
    syscall.umount2(&old_root, MntFlags::MNT_DETACH)?;
    fs::remove_dir(&old_root)
        .with_context(|| format!("cannot remove {}", old_root.display()))?;

    if let Some(dir) = working_dir {
        syscall.chdir(dir)?;
        env::set_var("PWD", dir);
    }
    Ok(())
}

/// A mkdtemp-style scratch directory in the current directory for the old
/// root to land on during the pivot.
fn create_old_root_dir() -> Result<PathBuf> {
    for _ in 0..OLD_ROOT_ATTEMPTS {
        let name: String = (0..6).map(|_| fastrand::alphanumeric()).collect();
        let path = PathBuf::from(format!("old-root-{}", name));
        match fs::create_dir(&path) {
            Ok(()) => return Ok(path),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| format!("cannot create {}", path.display()))
            }
        }
    }
    bail!("could not create an old-root directory in the sandbox root")
}
