use nix::{errno::Errno, sys::socket::SockProtocol};
use tracing::{error, warn};

use crate::{
    core::{message::Message, socket::Socket},
    error::{Error, Result},
    types::message::{Attribute, RouteMessage},
};

use super::{link::LinkHandle, route::RouteHandle, rule::RuleHandle};

/// Every rule and route operation covers IPv4 first, then IPv6.
pub const FAMILIES: [u8; 2] = [libc::AF_INET as u8, libc::AF_INET6 as u8];

/// Something that can carry a netlink request to the kernel.
///
/// With `res_type == 0` the request waits for a single ACK. Otherwise it is a
/// dump and every payload of type `res_type` is returned, up to NLMSG_DONE.
pub trait Netlink: Send + Sync {
    fn request(&self, msg: &mut Message, res_type: u16) -> Result<Vec<Vec<u8>>>;
}

impl dyn Netlink + '_ {
    pub fn handle_rule(&self) -> RuleHandle<'_> {
        RuleHandle::from(self)
    }

    pub fn handle_route(&self) -> RouteHandle<'_> {
        RouteHandle::from(self)
    }

    pub fn handle_link(&self) -> LinkHandle<'_> {
        LinkHandle::from(self)
    }
}

pub struct SocketHandle {
    pub seq: u32,
    pub socket: Socket,
}

impl SocketHandle {
    pub fn new(proto: SockProtocol) -> Result<Self> {
        Ok(Self {
            seq: 0,
            socket: Socket::new(proto)?,
        })
    }

    /// Stamps the next sequence number and writes the message.
    pub fn send(&mut self, msg: &mut Message) -> Result<()> {
        self.seq = self.seq.wrapping_add(1);
        msg.header.nlmsg_seq = self.seq;
        self.socket.send(&msg.serialize()?)
    }

    /// Reads replies to the last request until NLMSG_DONE or an NLMSG_ERROR,
    /// handing every payload of type `res_type` to `f`.
    pub fn recv_with<F>(&mut self, res_type: u16, mut f: F) -> Result<()>
    where
        F: FnMut(&[u8]) -> Result<()>,
    {
        loop {
            let buf = self.socket.recv()?;

            for m in Message::split(&buf)? {
                if m.header.nlmsg_seq != self.seq {
                    return Err(Error::Malformed(format!(
                        "wrong sequence number {}, expected {}",
                        m.header.nlmsg_seq, self.seq
                    )));
                }

                match m.header.nlmsg_type as i32 {
                    libc::NLMSG_DONE | libc::NLMSG_ERROR => {
                        let code = m.error_code()?;
                        if code == 0 {
                            return Ok(());
                        }
                        return Err(Errno::from_raw(-code).into());
                    }
                    _ if m.header.nlmsg_type == res_type => f(m.payload())?,
                    _ => {}
                }
            }
        }
    }

    pub fn request(&mut self, msg: &mut Message, res_type: u16) -> Result<Vec<Vec<u8>>> {
        self.send(msg)?;

        let mut res = vec![];
        self.recv_with(res_type, |payload| {
            res.push(payload.to_vec());
            Ok(())
        })?;

        Ok(res)
    }
}

/// Opens a fresh NETLINK_ROUTE socket for every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelNetlink;

impl Netlink for KernelNetlink {
    fn request(&self, msg: &mut Message, res_type: u16) -> Result<Vec<Vec<u8>>> {
        SocketHandle::new(SockProtocol::NetlinkRoute)?.request(msg, res_type)
    }
}

/// Dumps with `get` in both families and deletes, with `del`, every entry
/// `should_delete` selects. Entries already gone are skipped; other delete
/// failures are logged and do not stop the flush. A failed dump does.
pub fn flush<F>(netlink: &dyn Netlink, get: u16, del: u16, what: &str, should_delete: F) -> Result<()>
where
    F: Fn(&[u8]) -> bool,
{
    for family in FAMILIES {
        let mut req = Message::new(get, libc::NLM_F_DUMP);
        req.add(
            &RouteMessage {
                family,
                ..Default::default()
            }
            .serialize()?,
        );

        // Dump replies carry the RTM_NEW* type two below RTM_GET*.
        let entries = netlink.request(&mut req, get - 2).map_err(|e| {
            error!("Error dumping {}: {}", what, e);
            e
        })?;

        for entry in entries.iter().filter(|entry| should_delete(entry)) {
            let mut req = Message::new(del, libc::NLM_F_ACK);
            req.add(entry);

            match netlink.request(&mut req, 0) {
                Ok(_) => {}
                Err(e) if e.is(Errno::ENOENT) => {}
                Err(e) => warn!("Error deleting {}: {}", what, e),
            }
        }
    }

    Ok(())
}
