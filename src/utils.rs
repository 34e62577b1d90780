//! Utility functionality

use std::ffi::CString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use nix::sys::stat::{umask, Mode};
use nix::unistd;

pub trait PathExt {
    /// Appends an absolute path below `self` by plain concatenation, the
    /// way mount targets are addressed relative to the sandbox root.
    fn join_absolute_path(&self, p: &Path) -> Result<PathBuf>;
}

impl PathExt for Path {
    fn join_absolute_path(&self, p: &Path) -> Result<PathBuf> {
        if !p.is_absolute() && !p.as_os_str().is_empty() {
            bail!(
                "cannot join {:?} because it is not an absolute path",
                p.display()
            )
        }
        Ok(PathBuf::from(format!("{}{}", self.display(), p.display())))
    }
}

pub fn write_file<P: AsRef<Path>, C: AsRef<[u8]>>(path: P, contents: C) -> Result<()> {
    let path = path.as_ref();
    fs::write(path, contents).with_context(|| format!("failed to write to {:?}", path))?;
    Ok(())
}

/// Replaces the process image with the given command. The umask is forced
/// to include read and execute for everyone first, to make output
/// permissions predictable. Does not return unless something went wrong.
pub fn do_exec(args: &[String]) -> Result<()> {
    for arg in args {
        log::debug!("arg: {}", arg);
    }

    umask(Mode::from_bits_truncate(0o022));

    let path = CString::new(args[0].as_str())
        .with_context(|| format!("invalid command name {:?}", args[0]))?;
    let argv: Vec<CString> = args
        .iter()
        .map(|s| CString::new(s.as_str()))
        .collect::<Result<_, _>>()
        .context("argument contains an interior nul byte")?;
    unistd::execvp(&path, &argv).with_context(|| format!("cannot execute {}", args[0]))?;
    Ok(())
}
