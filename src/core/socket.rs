use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use nix::{
    errno::Errno,
    sys::socket::{
        bind, connect, recv, send, socket, AddressFamily, MsgFlags, NetlinkAddr, SockFlag,
        SockProtocol, SockType,
    },
};

use crate::error::Result;

pub const RECV_BUF_SIZE: usize = 65536;

/// A netlink socket bound to the kernel.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    pub fn new(proto: SockProtocol) -> Result<Self> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_CLOEXEC,
            proto,
        )?;

        let kernel = NetlinkAddr::new(0, 0);
        bind(fd.as_raw_fd(), &kernel)?;
        connect(fd.as_raw_fd(), &kernel)?;

        Ok(Self { fd })
    }

    pub fn send(&self, buf: &[u8]) -> Result<()> {
        let n = send(self.fd.as_raw_fd(), buf, MsgFlags::empty())?;
        if n < buf.len() {
            return Err(Errno::EMSGSIZE.into());
        }
        Ok(())
    }

    pub fn recv(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; RECV_BUF_SIZE];
        let n = recv(self.fd.as_raw_fd(), &mut buf, MsgFlags::empty())?;
        buf.truncate(n);
        Ok(buf)
    }

    /// Looks at the next pending datagram without blocking or consuming it.
    /// Returns `None` when nothing is queued.
    pub fn peek(&self, len: usize) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; len];
        match recv(
            self.fd.as_raw_fd(),
            &mut buf,
            MsgFlags::MSG_PEEK | MsgFlags::MSG_DONTWAIT,
        ) {
            Ok(n) => {
                buf.truncate(n);
                Ok(Some(buf))
            }
            Err(Errno::EAGAIN) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
