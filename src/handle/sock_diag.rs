use std::{collections::BTreeSet, net::IpAddr, time::Instant};

use nix::{errno::Errno, sys::socket::SockProtocol};
use tracing::{error, info};

use crate::{
    core::message::{Header, Message, NLMSG_HDRLEN},
    error::{Error, Result},
    types::{
        fwmark::Permission,
        message::Attribute,
        sock_diag::{
            Bytecode, InetDiagTcpResp, SockDiag, SockDiagReq, ALL_STATES_BUT_TIME_WAIT,
            LIVE_STATES, SOCK_DESTROY, SOCK_DIAG_BY_FAMILY,
        },
        uid_range::UidRanges,
    },
};

use super::handle::{SocketHandle, FAMILIES};

/// nlmsghdr followed by struct nlmsgerr without the echoed request.
const NLMSG_ERROR_LEN: usize = NLMSG_HDRLEN + 4 + NLMSG_HDRLEN;

/// Dumps sockets and destroys the ones a filter selects.
///
/// Dumps go out on one socket and destroy requests on another, so a destroy
/// can be issued while the dump that produced it is still being read.
#[derive(Default)]
pub struct SockDiagHandle {
    read: Option<SocketHandle>,
    write: Option<SocketHandle>,
}

impl SockDiagHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.read.is_some() && self.write.is_some()
    }

    pub fn open(&mut self) -> Result<()> {
        if self.is_open() {
            return Err(Error::AlreadyOpen);
        }

        let read = SocketHandle::new(SockProtocol::NetlinkSockDiag)?;
        let write = SocketHandle::new(SockProtocol::NetlinkSockDiag)?;
        self.read = Some(read);
        self.write = Some(write);
        Ok(())
    }

    pub fn close(&mut self) {
        self.read = None;
        self.write = None;
    }

    /// Consumes a pending NLMSG_ERROR, if any, and returns its error.
    /// Anything else queued on the socket is left in place.
    fn check_error(socket: &mut SocketHandle) -> Result<()> {
        let Some(peeked) = socket.socket.peek(NLMSG_ERROR_LEN)? else {
            return Ok(());
        };
        if peeked.len() < NLMSG_ERROR_LEN {
            return Ok(());
        }

        let header = Header::deserialize(&peeked)?;
        if header.nlmsg_type as i32 != libc::NLMSG_ERROR {
            return Ok(());
        }

        let buf = socket.socket.recv()?;
        let code = match Message::split(&buf)?.first() {
            Some(msg) => msg.error_code()?,
            None => return Ok(()),
        };

        if code == 0 {
            return Ok(());
        }
        Err(Errno::from_raw(-code).into())
    }

    pub fn send_dump_request(
        &mut self,
        proto: u8,
        family: u8,
        ext: u8,
        states: u32,
        filter: &[u8],
    ) -> Result<()> {
        let read = self.read.as_mut().ok_or(Error::NotOpen)?;

        let mut req = Message::new(SOCK_DIAG_BY_FAMILY, libc::NLM_F_DUMP);
        req.add(&SockDiagReq::dump(proto, family, ext, states).serialize()?);
        req.add(filter);

        read.send(&mut req)?;
        Self::check_error(read)
    }

    fn sock_destroy(write: &mut SocketHandle, proto: u8, msg: &SockDiag) -> Result<()> {
        let mut req = Message::new(SOCK_DESTROY, 0);
        req.add(&SockDiagReq::destroy(proto, msg).serialize()?);

        write.send(&mut req)?;
        Self::check_error(write)
    }

    /// Reads the dump in flight and destroys every socket `should_destroy`
    /// accepts. Sockets that cannot be destroyed are skipped.
    pub fn read_diag_msg<F>(&mut self, proto: u8, mut should_destroy: F) -> Result<u32>
    where
        F: FnMut(&SockDiag) -> bool,
    {
        let (Some(read), Some(write)) = (self.read.as_mut(), self.write.as_mut()) else {
            return Err(Error::NotOpen);
        };

        let mut destroyed = 0;
        read.recv_with(SOCK_DIAG_BY_FAMILY, |payload| {
            let msg = SockDiag::deserialize(payload)?;
            if should_destroy(&msg) && Self::sock_destroy(write, proto, &msg).is_ok() {
                destroyed += 1;
            }
            Ok(())
        })?;

        Ok(destroyed)
    }

    fn destroy_live_sockets<F>(
        &mut self,
        what: &str,
        filter: impl Fn(u8) -> Result<Vec<u8>>,
        states: u32,
        families: &[u8],
        mut should_destroy: F,
    ) -> Result<u32>
    where
        F: FnMut(&SockDiag) -> bool,
    {
        let start = Instant::now();
        let proto = libc::IPPROTO_TCP as u8;
        let mut destroyed = 0;

        for &family in families {
            let res = filter(family)
                .and_then(|filter| self.send_dump_request(proto, family, 0, states, &filter))
                .and_then(|_| self.read_diag_msg(proto, &mut should_destroy));

            match res {
                Ok(n) => destroyed += n,
                Err(e) => {
                    error!("Failed to destroy sockets {}: {}", what, e);
                    return Err(e);
                }
            }
        }

        info!(
            "Destroyed {} sockets {} in {:.1} ms",
            destroyed,
            what,
            start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(destroyed)
    }

    /// Destroys every TCP socket bound to `addr`, except those in TIME_WAIT.
    /// IPv4 addresses are also matched against IPv4-mapped IPv6 sockets.
    pub fn destroy_sockets_by_addr(&mut self, addr: &str) -> Result<u32> {
        let ip: IpAddr = addr
            .parse()
            .map_err(|_| Error::InvalidAddress(addr.to_string()))?;

        let families: &[u8] = match ip {
            IpAddr::V4(_) => &FAMILIES,
            IpAddr::V6(_) => &FAMILIES[1..],
        };

        self.destroy_live_sockets(
            &format!("on {}", addr),
            |family| Bytecode::match_source(family, ip)?.to_attr(),
            ALL_STATES_BUT_TIME_WAIT,
            families,
            |_| true,
        )
    }

    pub fn destroy_sockets_for_uid(&mut self, uid: u32, exclude_loopback: bool) -> Result<u32> {
        self.destroy_live_sockets(
            &format!("for UID {}", uid),
            |_| Ok(vec![]),
            LIVE_STATES,
            &FAMILIES,
            |msg| msg.uid == uid && !(exclude_loopback && msg.is_loopback()),
        )
    }

    /// Destroys the live sockets of every uid in `ranges` but those in `skip`.
    pub fn destroy_sockets_for_uids(
        &mut self,
        ranges: &UidRanges,
        skip: &BTreeSet<u32>,
        exclude_loopback: bool,
    ) -> Result<u32> {
        self.destroy_live_sockets(
            &format!("for UIDs {}", ranges),
            |_| Ok(vec![]),
            LIVE_STATES,
            &FAMILIES,
            |msg| {
                ranges.has_uid(msg.uid)
                    && !skip.contains(&msg.uid)
                    && !(exclude_loopback && msg.is_loopback())
            },
        )
    }

    /// Destroys the sockets on `net_id` that will no longer be allowed to use
    /// it once it requires `permission`. The kernel does the selection.
    pub fn destroy_sockets_lacking_permission(
        &mut self,
        net_id: u32,
        permission: Permission,
        exclude_loopback: bool,
    ) -> Result<u32> {
        let filter = Bytecode::lacking_permission(net_id, permission);

        self.destroy_live_sockets(
            &format!("on netId {} lacking {}", net_id, permission),
            |_| filter.to_attr(),
            LIVE_STATES,
            &FAMILIES,
            |msg| !(exclude_loopback && msg.is_loopback()),
        )
    }

    pub fn tcp_info(&mut self, family: u8) -> Result<Vec<InetDiagTcpResp>> {
        let read = self.read.as_mut().ok_or(Error::NotOpen)?;

        let mut req = Message::new(SOCK_DIAG_BY_FAMILY, libc::NLM_F_DUMP);
        req.add(&SockDiagReq::request_tcp_info(family).serialize()?);
        read.send(&mut req)?;

        let mut resp = vec![];
        read.recv_with(SOCK_DIAG_BY_FAMILY, |payload| {
            resp.push(InetDiagTcpResp::try_from(payload)?);
            Ok(())
        })?;

        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io::{Read, Write},
        net::{TcpListener, TcpStream},
        os::fd::AsRawFd,
        time::Duration,
    };

    use nix::{
        sched::{unshare, CloneFlags},
        sys::socket::{setsockopt, sockopt},
        unistd::{fchown, Uid},
    };

    use crate::{
        handle::handle::{KernelNetlink, Netlink},
        types::uid_range::UidRange,
    };

    use super::*;

    fn loopback_netns() -> anyhow::Result<()> {
        unshare(CloneFlags::CLONE_NEWNET)?;
        let index = nix::net::if_::if_nametoindex("lo")?;
        (&KernelNetlink as &dyn Netlink).handle_link().up(index)?;
        Ok(())
    }

    /// A connected pair, client end first. Reads time out instead of hanging.
    fn connected(listener: &TcpListener) -> anyhow::Result<(TcpStream, TcpStream)> {
        let client = TcpStream::connect(listener.local_addr()?)?;
        let (server, _) = listener.accept()?;
        for stream in [&client, &server] {
            stream.set_read_timeout(Some(Duration::from_secs(1)))?;
        }
        Ok((client, server))
    }

    /// Destroyed sockets report ECONNABORTED; their peers see the RST as
    /// ECONNRESET.
    fn is_torn_down(stream: &mut TcpStream) -> bool {
        let mut buf = [0u8; 1];
        matches!(
            stream.read(&mut buf).map_err(|e| e.raw_os_error()),
            Err(Some(libc::ECONNABORTED | libc::ECONNRESET))
        )
    }

    fn still_connected(client: &mut TcpStream, server: &mut TcpStream) -> bool {
        let mut buf = [0u8; 1];
        client.write_all(b"x").is_ok() && matches!(server.read(&mut buf), Ok(1))
    }

    #[test]
    fn test_closed_handle() {
        let mut handle = SockDiagHandle::new();

        assert!(matches!(
            handle.destroy_sockets_for_uid(10000, false),
            Err(Error::NotOpen)
        ));
        assert!(matches!(handle.tcp_info(libc::AF_INET as u8), Err(Error::NotOpen)));
        assert!(matches!(
            handle.read_diag_msg(libc::IPPROTO_TCP as u8, |_| true),
            Err(Error::NotOpen)
        ));
    }

    #[test]
    fn test_invalid_address() {
        let mut handle = SockDiagHandle::new();

        let err = handle.destroy_sockets_by_addr("not-an-ip").unwrap_err();
        assert!(matches!(err, Error::InvalidAddress(_)));
        assert_eq!(err.code(), -libc::EINVAL);
    }

    #[test]
    #[ignore = "needs a sock_diag capable kernel"]
    fn test_open_twice() {
        let mut handle = SockDiagHandle::new();
        handle.open().unwrap();

        assert!(matches!(handle.open(), Err(Error::AlreadyOpen)));

        handle.close();
        assert!(!handle.is_open());
        handle.open().unwrap();
    }

    #[test]
    #[ignore = "needs CAP_SYS_ADMIN and CONFIG_INET_DIAG_DESTROY"]
    fn test_destroy_by_addr() -> anyhow::Result<()> {
        loopback_netns()?;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let (mut client, mut server) = connected(&listener)?;
        let elsewhere = TcpListener::bind("127.0.0.2:0")?;

        let mut handle = SockDiagHandle::new();
        handle.open()?;

        let destroyed = handle.destroy_sockets_by_addr("127.0.0.1")?;
        assert!(destroyed >= 2, "destroyed {}", destroyed);
        assert!(is_torn_down(&mut client));
        assert!(is_torn_down(&mut server));

        // bound to another address: still accepting
        let (mut client, mut server) = connected(&elsewhere)?;
        assert!(still_connected(&mut client, &mut server));
        Ok(())
    }

    #[test]
    #[ignore = "needs CAP_SYS_ADMIN and CONFIG_INET_DIAG_DESTROY"]
    fn test_destroy_for_uids_excludes_loopback() -> anyhow::Result<()> {
        loopback_netns()?;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let (mut client, mut server) = connected(&listener)?;

        let uid = nix::unistd::getuid().as_raw();
        let ranges = UidRanges::from(vec![UidRange::new(uid, uid)]);

        let mut handle = SockDiagHandle::new();
        handle.open()?;

        assert_eq!(handle.destroy_sockets_for_uids(&ranges, &BTreeSet::new(), true)?, 0);
        assert_eq!(handle.destroy_sockets_for_uids(&ranges, &[uid].into(), false)?, 0);

        // The first end destroyed resets its peer out of the live states, so
        // the dump may or may not still see it.
        let destroyed = handle.destroy_sockets_for_uids(&ranges, &BTreeSet::new(), false)?;
        assert!(destroyed >= 1, "destroyed {}", destroyed);
        assert!(is_torn_down(&mut client));
        assert!(is_torn_down(&mut server));
        Ok(())
    }

    #[test]
    #[ignore = "needs CAP_SYS_ADMIN and CONFIG_INET_DIAG_DESTROY"]
    fn test_destroy_for_uid_spares_other_users() -> anyhow::Result<()> {
        loopback_netns()?;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let (target, other) = (Uid::from_raw(10001), Uid::from_raw(10002));

        let mut owned = vec![];
        for _ in 0..2 {
            let (client, server) = connected(&listener)?;
            fchown(client.as_raw_fd(), Some(target), None)?;
            fchown(server.as_raw_fd(), Some(other), None)?;
            owned.push((client, server));
        }
        let (mut bystander, mut bystander_peer) = connected(&listener)?;
        fchown(bystander.as_raw_fd(), Some(other), None)?;
        fchown(bystander_peer.as_raw_fd(), Some(other), None)?;

        let mut handle = SockDiagHandle::new();
        handle.open()?;

        assert_eq!(handle.destroy_sockets_for_uid(target.as_raw(), false)?, 2);
        for (client, _) in &mut owned {
            assert!(is_torn_down(client));
        }
        assert!(still_connected(&mut bystander, &mut bystander_peer));
        Ok(())
    }

    #[test]
    #[ignore = "needs CAP_NET_ADMIN, CAP_SYS_ADMIN and CONFIG_INET_DIAG_DESTROY"]
    fn test_destroy_sockets_lacking_permission() -> anyhow::Result<()> {
        loopback_netns()?;

        let listener = TcpListener::bind("127.0.0.1:0")?;
        let marked = |mark: u32| -> anyhow::Result<(TcpStream, TcpStream)> {
            let (client, server) = connected(&listener)?;
            setsockopt(&client, sockopt::Mark, &mark)?;
            Ok((client, server))
        };

        // netId 42: implicit, implicit with NETWORK, explicit without NETWORK
        let mut doomed = [0x2a, 0x4002a, 0x1002a]
            .into_iter()
            .map(&marked)
            .collect::<anyhow::Result<Vec<_>>>()?;
        // explicit with NETWORK or SYSTEM, and another netId
        let mut spared = [0x5002a, 0xd002a, 0x2b, 0x5002b]
            .into_iter()
            .map(&marked)
            .collect::<anyhow::Result<Vec<_>>>()?;

        let mut handle = SockDiagHandle::new();
        handle.open()?;

        assert_eq!(
            handle.destroy_sockets_lacking_permission(42, Permission::Network, false)?,
            3
        );
        for (client, _) in &mut doomed {
            assert!(is_torn_down(client));
        }
        for (client, server) in &mut spared {
            assert!(still_connected(client, server));
        }
        Ok(())
    }

    #[test]
    #[ignore = "needs a sock_diag capable kernel"]
    fn test_tcp_info() -> anyhow::Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let port = listener.local_addr()?.port();

        let mut handle = SockDiagHandle::new();
        handle.open()?;

        let resp = handle.tcp_info(libc::AF_INET as u8)?;
        assert!(resp
            .iter()
            .any(|r| r.msg.id.src_port == port && r.msg.family == libc::AF_INET as u8));
        Ok(())
    }
}
