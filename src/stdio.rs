//! Redirection of the child's stdout/stderr into files. This happens
//! before any namespace work so the opens are performed with the final
//! effective identity, and the descriptors survive the exec.

use std::os::unix::io::RawFd;
use std::path::Path;

use anyhow::{Context, Result};
use nix::fcntl::{open, OFlag};
use nix::sys::stat::Mode;
use nix::unistd::{close, dup2};

const STDOUT: RawFd = 1;
const STDERR: RawFd = 2;

pub fn redirect_stdout(target: Option<&Path>) -> Result<()> {
    redirect(target, STDOUT)
}

pub fn redirect_stderr(target: Option<&Path>) -> Result<()> {
    redirect(target, STDERR)
}

fn redirect(target: Option<&Path>, fd: RawFd) -> Result<()> {
    let target = match target {
        Some(target) => target,
        None => return Ok(()),
    };
    let file_fd = open(
        target,
        OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC | OFlag::O_APPEND,
        Mode::from_bits_truncate(0o666),
    )
    .with_context(|| format!("cannot open {}", target.display()))?;
    dup2(file_fd, fd).with_context(|| format!("cannot redirect fd {}", fd))?;
    close(file_fd).context("failed to close redirect source fd")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_redirect_replaces_fd() {
        let dir = tempfile::tempdir().unwrap();
        let scratch = dir.path().join("scratch");
        let target = dir.path().join("target");

        // Take a disposable fd instead of 1/2 so the test harness output
        // stays intact.
        let fd = open(
            &scratch,
            OFlag::O_WRONLY | OFlag::O_CREAT,
            Mode::from_bits_truncate(0o666),
        )
        .unwrap();

        redirect(Some(&target), fd).unwrap();
        let payload = b"redirected";
        let wrote =
            unsafe { libc::write(fd, payload.as_ptr() as *const libc::c_void, payload.len()) };
        assert_eq!(wrote, payload.len() as isize);
        close(fd).unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), "redirected");
        assert_eq!(fs::read_to_string(&scratch).unwrap(), "");
    }

    #[test]
    fn test_no_target_is_a_noop() {
        redirect(None, 42).unwrap();
    }
}
