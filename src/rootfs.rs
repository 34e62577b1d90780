//! Turns the raw sandbox root directory into a self-contained root
//! filesystem. Runs entirely inside the fresh (private) mount namespace;
//! the operations happen in a fixed order because each one depends on
//! what the previous ones made visible:
//! the root is first bound onto itself so it is a mount point the later
//! pivot can operate on, /dev and /proc come before user mounts so user
//! mounts may shadow them, and the home directory is created last because
//! a user mount may be the thing providing it.

use std::env;
use std::fs::{self, DirBuilder, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind};
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::errno::Errno;
use nix::mount::MsFlags;
use procfs::process::{MountInfo, Process};

use crate::config::Config;
use crate::syscall::Syscall;
use crate::utils::PathExt;

/// Host device nodes bound into the sandbox's /dev.
const BIND_DEVICES: [&str; 4] = ["/dev/null", "/dev/random", "/dev/urandom", "/dev/zero"];

pub fn prepare_rootfs(config: &Config, syscall: &dyn Syscall) -> Result<()> {
    let root = config.sandbox_root.as_path();
    log::debug!("prepare rootfs at {}", root.display());

    // Anchor the sandbox root: bind it onto itself so it becomes a mount
    // point, then work from inside it.
    syscall
        .mount(
            Some(root),
            root,
            None,
            MsFlags::MS_BIND | MsFlags::MS_NOSUID,
            None,
        )
        .with_context(|| format!("cannot bind {} onto itself", root.display()))?;
    syscall.chdir(root)?;

    setup_devices(root, syscall)?;
    setup_proc(root, syscall)?;

    for dir in &config.create_dirs {
        log::debug!("createdir: {}", dir.display());
        let path = root.join_absolute_path(dir)?;
        create_target(&path, true)?;
    }

    apply_user_mounts(config, syscall)?;
    setup_home(root, config.inner_uid)?;

    Ok(())
}

/// Populates /dev with the handful of nodes sandboxed tools expect:
/// bind-mounted host devices, a fresh devpts instance, a tmpfs for
/// /dev/shm and the fd symlink into /proc.
fn setup_devices(root: &Path, syscall: &dyn Syscall) -> Result<()> {
    create_target(&root.join("dev"), true)?;

    for dev in BIND_DEVICES {
        let target = root.join_absolute_path(Path::new(dev))?;
        create_target(&target, false)?;
        syscall
            .mount(Some(Path::new(dev)), &target, None, MsFlags::MS_BIND, None)
            .with_context(|| format!("cannot mount {} into the sandbox", dev))?;
    }

    let pts = root.join("dev/pts");
    create_target(&pts, true)?;
    syscall
        .mount(
            Some(Path::new("devpts")),
            &pts,
            Some("devpts"),
            MsFlags::MS_NOSUID | MsFlags::MS_NOEXEC,
            Some("ptmxmode=0666"),
        )
        .context("cannot mount devpts")?;
    syscall.symlink(Path::new("pts/ptmx"), &root.join("dev/ptmx"))?;

    let shm = root.join("dev/shm");
    create_target(&shm, true)?;
    syscall
        .mount(
            Some(Path::new("tmpfs")),
            &shm,
            Some("tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            None,
        )
        .context("cannot mount tmpfs on dev/shm")?;

    syscall.symlink(Path::new("/proc/self/fd"), &root.join("dev/fd"))?;
    Ok(())
}

/// The host /proc is bind-mounted rather than freshly mounted: the user
/// namespace is not yet allowed to mount a new procfs at this point.
fn setup_proc(root: &Path, syscall: &dyn Syscall) -> Result<()> {
    let proc = root.join("proc");
    create_target(&proc, true)?;
    syscall
        .mount(
            Some(Path::new("/proc")),
            &proc,
            None,
            MsFlags::MS_REC | MsFlags::MS_BIND,
            None,
        )
        .context("cannot mount /proc")?;
    Ok(())
}

/// Applies the user-requested bind mounts in declaration order, so later
/// entries may shadow earlier ones.
fn apply_user_mounts(config: &Config, syscall: &dyn Syscall) -> Result<()> {
    for mount in &config.mounts {
        let metadata = fs::metadata(&mount.source).with_context(|| {
            format!("mount source {} is not accessible", mount.source.display())
        })?;

        if mount.source == mount.target {
            log::debug!("mount: {}", mount.source.display());
        } else {
            log::debug!(
                "mount: {} -> <sandbox>{} ({})",
                mount.source.display(),
                mount.target.display(),
                if mount.writable { "rw" } else { "ro" }
            );
        }

        let target = config.sandbox_root.join_absolute_path(&mount.target)?;
        create_target(&target, metadata.is_dir())?;
        syscall
            .mount(
                Some(mount.source.as_path()),
                &target,
                None,
                MsFlags::MS_REC | MsFlags::MS_BIND,
                None,
            )
            .with_context(|| {
                format!(
                    "cannot mount '{}' on '{}'",
                    mount.source.display(),
                    target.display()
                )
            })?;

        if !mount.writable {
            // A bind-remount that tries to clear a flag the underlying
            // mount carries is rejected by the kernel, so the inherited
            // flags are replayed alongside MS_RDONLY. Some filesystems
            // refuse the remount entirely in unprivileged contexts, which
            // only costs the read-only protection, not the mount.
            let inherited = current_mount_flags(&target)?;
            let flags = inherited
                | MsFlags::MS_REC
                | MsFlags::MS_BIND
                | MsFlags::MS_REMOUNT
                | MsFlags::MS_RDONLY;
            if let Err(errno) = syscall.mount(Some(mount.source.as_path()), &target, None, flags, None)
            {
                log::warn!(
                    "remounting {} read only failed: {}",
                    target.display(),
                    errno
                );
            }
        }
    }
    Ok(())
}

/// Recursively creates the file or directory at `path` together with its
/// parent directories. Creating something that already exists with the
/// right kind succeeds; the wrong kind is an error.
fn create_target(path: &Path, is_directory: bool) -> Result<()> {
    let path = if path.as_os_str().is_empty() {
        Path::new(".")
    } else {
        path
    };

    match fs::metadata(path) {
        Ok(metadata) => {
            return if is_directory && metadata.is_dir() {
                Ok(())
            } else if !is_directory && metadata.is_file() {
                Ok(())
            } else {
                let errno = if is_directory {
                    Errno::ENOTDIR
                } else {
                    Errno::EEXIST
                };
                Err(errno).with_context(|| format!("cannot create {}", path.display()))
            };
        }
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("cannot stat {}", path.display()));
        }
    }

    if let Some(parent) = path.parent() {
        create_target(parent, true)?;
    }

    if is_directory {
        DirBuilder::new()
            .mode(0o755)
            .create(path)
            .with_context(|| format!("cannot create {}", path.display()))?;
    } else {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o666)
            .open(path)
            .with_context(|| format!("cannot create {}", path.display()))?;
    }
    Ok(())
}

fn current_mount_flags(target: &Path) -> Result<MsFlags> {
    let mount_infos = Process::myself()
        .context("cannot open /proc/self")?
        .mountinfo()
        .context("cannot read the mount table")?;
    Ok(inherited_mount_flags(&mount_infos.0, target))
}

/// The nodev/nosuid/noexec flags the mount under `target` was created
/// with. The last matching mount point wins: later mounts shadow earlier
/// ones at the same path.
fn inherited_mount_flags(mounts: &[MountInfo], target: &Path) -> MsFlags {
    let mut flags = MsFlags::empty();
    match mounts.iter().rev().find(|mi| mi.mount_point == target) {
        Some(entry) => {
            for (option, flag) in [
                ("nodev", MsFlags::MS_NODEV),
                ("nosuid", MsFlags::MS_NOSUID),
                ("noexec", MsFlags::MS_NOEXEC),
            ] {
                if entry.mount_options.contains_key(option) {
                    flags |= flag;
                }
            }
            log::debug!(
                "inferred mount options for {}: {:?}",
                target.display(),
                flags
            );
        }
        None => log::debug!("could not find mount path: {}", target.display()),
    }
    flags
}

/// Makes sure the home directory of the inner identity exists. The
/// sandbox's own passwd database is consulted first; $HOME is the
/// fallback. A user mount may already serve the path, which is why this
/// runs after them.
fn setup_home(root: &Path, inner_uid: u32) -> Result<()> {
    let homedir = match home_from_passwd(&root.join("etc/passwd"), inner_uid)? {
        Some(dir) => Some(dir),
        None => env::var_os("HOME").map(PathBuf::from),
    };

    if let Some(homedir) = homedir {
        if !homedir.is_absolute() {
            bail!(
                "home directory must be an absolute path, but is {}",
                homedir.display()
            );
        }
        log::debug!("createdir: {}", homedir.display());
        create_target(&root.join_absolute_path(&homedir)?, true)?;
        env::set_var("HOME", &homedir);
    }
    Ok(())
}

/// Streams the passwd file and returns the home directory of the first
/// entry matching `uid`. An unreadable file just means there is nothing
/// to consult; malformed lines are skipped.
fn home_from_passwd(path: &Path, uid: u32) -> Result<Option<PathBuf>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(_) => {
            log::debug!(
                "{} not found or unreadable, falling back to $HOME",
                path.display()
            );
            return Ok(None);
        }
    };

    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("cannot read {}", path.display()))?;
        let fields: Vec<&str> = line.splitn(7, ':').collect();
        if fields.len() < 6 {
            continue;
        }
        if fields[2].parse::<u32>() == Ok(uid) {
            return Ok(Some(PathBuf::from(fields[5])));
        }
    }
    Ok(None)
}
