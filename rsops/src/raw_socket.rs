use std::ffi::CString;
use std::mem;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd};

use log::debug;

use crate::error::SocketError;

/// `AF_PACKET` raw socket bound to one interface, used as the attach point of
/// the flow counting socket filter. Nothing ever reads from it.
#[derive(Debug)]
pub struct RawSocket {
    fd: OwnedFd,
    ifindex: u32,
}

impl RawSocket {
    pub fn bind(iface: &str) -> Result<Self, SocketError> {
        let ifindex = ifindex(iface)?;
        let protocol = (libc::ETH_P_ALL as u16).to_be();

        let fd = unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_RAW | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                protocol as libc::c_int,
            )
        };
        if fd < 0 {
            return Err(SocketError::last_os_error("socket"));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::c_ushort;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = ifindex as libc::c_int;

        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret != 0 {
            return Err(SocketError::last_os_error("bind"));
        }

        debug!("raw socket fd {} bound to {iface} (ifindex {ifindex})", fd.as_raw_fd());
        Ok(Self { fd, ifindex })
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }
}

impl AsFd for RawSocket {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

fn ifindex(iface: &str) -> Result<u32, SocketError> {
    let name = CString::new(iface).map_err(|_| SocketError::InvalidName(iface.to_string()))?;
    match unsafe { libc::if_nametoindex(name.as_ptr()) } {
        0 => Err(SocketError::UnknownInterface(iface.to_string())),
        index => Ok(index),
    }
}
