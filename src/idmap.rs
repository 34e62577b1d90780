//! Identity handling on both sides of the user namespace boundary.
//!
//! Before anything else the process collapses its real ids onto the
//! effective ones: some shells (bash among them) consult the real uid
//! and drop privileges when it differs from the effective uid, which
//! would defeat a set-uid install of this binary. The effective ids are
//! the outer identity that the uid/gid maps translate from.
//!
//! After the user namespace exists, exactly one id is mapped — the
//! simplest configuration the kernel accepts without extra capabilities —
//! and `setgroups` is denied first, which lifts the capability
//! requirement for writing the gid map.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{Context, Result};
use nix::unistd::{self, Gid, Uid};

use crate::syscall::Syscall;
use crate::utils;

/// Collapses real onto effective uid/gid and returns the effective pair,
/// the outer identity used as the source of the id maps.
pub fn switch_to_effective_ids() -> Result<(Uid, Gid)> {
    let uid = unistd::getuid();
    let euid = unistd::geteuid();
    if uid != euid {
        unistd::setresuid(euid, euid, euid).context("failed to switch to the effective uid")?;
    }

    let gid = unistd::getgid();
    let egid = unistd::getegid();
    if gid != egid {
        unistd::setresgid(egid, egid, egid).context("failed to switch to the effective gid")?;
    }

    Ok((euid, egid))
}

/// Maps the outer identity onto the requested inner one and assumes it.
/// Must run after the user namespace exists and before any other process
/// in it calls `setgroups`; the map files are write-once.
pub fn setup_user_namespace(
    syscall: &dyn Syscall,
    proc_self: &Path,
    outer: (Uid, Gid),
    inner: (u32, u32),
) -> Result<()> {
    write_setgroups_deny(&proc_self.join("setgroups"))?;

    utils::write_file(
        proc_self.join("uid_map"),
        format!("{} {} 1\n", inner.0, outer.0),
    )
    .context("failed to write the uid map")?;
    utils::write_file(
        proc_self.join("gid_map"),
        format!("{} {} 1\n", inner.1, outer.1),
    )
    .context("failed to write the gid map")?;

    syscall.set_id(Uid::from_raw(inner.0), Gid::from_raw(inner.1))?;
    Ok(())
}

/// Kernels before 3.19 have no setgroups file; its absence is fine, any
/// other failure is not.
fn write_setgroups_deny(path: &Path) -> Result<()> {
    match fs::write(path, "deny") {
        Err(err) if err.kind() == ErrorKind::NotFound => {
            log::debug!("{} does not exist, skipping", path.display());
            Ok(())
        }
        result => result.with_context(|| format!("failed to write deny to {}", path.display())),
    }
}
