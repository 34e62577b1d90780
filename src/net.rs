//! Brings up the loopback interface inside a fresh network namespace,
//! where even `lo` starts out down. Plain SIOCGIFFLAGS/SIOCSIFFLAGS on a
//! throwaway datagram socket; no netlink needed for a single interface.

use std::mem;
use std::os::fd::AsRawFd;

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};

const LOOPBACK: &[u8] = b"lo";

pub fn bring_up_loopback() -> Result<()> {
    let socket = socket(
        AddressFamily::Inet,
        SockType::Datagram,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("socket(AF_INET, SOCK_DGRAM) failed")?;

    let mut ifreq: libc::ifreq = unsafe { mem::zeroed() };
    for (dst, src) in ifreq.ifr_name.iter_mut().zip(LOOPBACK.iter()) {
        *dst = *src as libc::c_char;
    }

    let res = unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCGIFFLAGS, &mut ifreq) };
    Errno::result(res).context("ioctl(SIOCGIFFLAGS) on lo failed")?;

    unsafe {
        ifreq.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
    }
    let res = unsafe { libc::ioctl(socket.as_raw_fd(), libc::SIOCSIFFLAGS, &ifreq) };
    Errno::result(res).context("ioctl(SIOCSIFFLAGS) on lo failed")?;

    Ok(())
}
