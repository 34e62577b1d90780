//! Entry point: parses the command line and walks the sandbox pipeline
//! in its one valid order — switch identity, redirect stdio, create
//! namespaces, build the filesystem, map identities, set the hostname,
//! pivot the root, exec the command. On success this process becomes the
//! sandboxed command; on failure the kernel reclaims every
//! partially-built namespace when we exit.

use std::env;
use std::path::Path;
use std::process;

use anyhow::Result;

use nsbox::config::{self, Invocation};
use nsbox::syscall::create_syscall;
use nsbox::{idmap, logger, namespaces, net, pivot, rootfs, stdio, utils};

fn main() -> Result<()> {
    let config = match config::parse(env::args())? {
        Invocation::Probe => match namespaces::probe() {
            Ok(()) => process::exit(0),
            Err(err) => {
                eprintln!("nsbox: {:#}", err);
                process::exit(1);
            }
        },
        Invocation::Run(config) => config,
    };

    if let Err(err) = logger::init(config.debug) {
        eprintln!("log init failed: {:?}", err);
    }

    let syscall = create_syscall();

    let (outer_uid, outer_gid) = idmap::switch_to_effective_ids()?;

    stdio::redirect_stdout(config.stdout_path.as_deref())?;
    stdio::redirect_stderr(config.stderr_path.as_deref())?;

    log::debug!("sandbox root is {}", config.sandbox_root.display());
    log::debug!(
        "working dir is {}",
        config
            .working_dir
            .as_ref()
            .map(|dir| dir.display().to_string())
            .unwrap_or_else(|| "/ (default)".to_string())
    );

    namespaces::create(syscall.as_ref(), config.create_netns)?;
    if config.create_netns {
        // Some applications expect at least a loopback to talk to.
        net::bring_up_loopback()?;
    }

    rootfs::prepare_rootfs(&config, syscall.as_ref())?;
    idmap::setup_user_namespace(
        syscall.as_ref(),
        Path::new("/proc/self"),
        (outer_uid, outer_gid),
        (config.inner_uid, config.inner_gid),
    )?;
    if let Some(host_name) = &config.host_name {
        syscall.set_hostname(host_name)?;
    }
    pivot::change_root(syscall.as_ref(), config.working_dir.as_deref())?;

    utils::do_exec(&config.argv)
}
