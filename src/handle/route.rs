use std::ops::Deref;

use crate::{
    core::message::Message,
    error::Result,
    types::{
        message::{Attribute, RouteMessage},
        route::Route,
    },
};

use super::handle::{flush, Netlink};

pub struct RouteHandle<'a> {
    pub netlink: &'a dyn Netlink,
}

impl<'a> Deref for RouteHandle<'a> {
    type Target = dyn Netlink + 'a;

    fn deref(&self) -> &Self::Target {
        self.netlink
    }
}

impl<'a> From<&'a dyn Netlink> for RouteHandle<'a> {
    fn from(netlink: &'a dyn Netlink) -> Self {
        Self { netlink }
    }
}

impl RouteHandle<'_> {
    fn handle(&self, route: &Route, proto: u16, flags: i32) -> Result<()> {
        let mut req = Message::new(proto, flags);

        req.add(&route.header().serialize()?);
        for attr in route.attributes() {
            req.add(&attr.serialize()?);
        }

        self.request(&mut req, 0)?;
        Ok(())
    }

    /// Link-local IPv6 routes are added without NLM_F_EXCL: every interface
    /// installs the same fe80::/64 route into the shared local_network table.
    pub fn add(&self, route: &Route) -> Result<()> {
        let mut flags = libc::NLM_F_ACK | libc::NLM_F_CREATE;
        if !route.is_link_local_v6() {
            flags |= libc::NLM_F_EXCL;
        }
        self.handle(route, libc::RTM_NEWROUTE, flags)
    }

    pub fn del(&self, route: &Route) -> Result<()> {
        self.handle(route, libc::RTM_DELROUTE, libc::NLM_F_ACK)
    }

    /// Deletes every IPv4 and IPv6 route in `table`.
    pub fn flush(&self, table: u32) -> Result<()> {
        flush(
            self.netlink,
            libc::RTM_GETROUTE,
            libc::RTM_DELROUTE,
            "routes",
            |payload| {
                let Ok((_, attrs)) = RouteMessage::parse(payload) else {
                    return false;
                };
                attrs.get(libc::RTA_TABLE).and_then(|a| a.u32()) == Some(table)
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use nix::errno::Errno;

    use crate::{
        handle::handle::Netlink,
        testutil::{decode_route, encode_route, RecordingNetlink},
        types::route::Route,
    };

    #[test]
    fn test_route_add_flags() {
        let netlink = RecordingNetlink::new();
        let handle = (&netlink as &dyn Netlink).handle_route();

        handle.add(&Route::new(1003, "10.0.0.0/8", None).unwrap()).unwrap();
        handle.add(&Route::new(97, "fe80::/64", None).unwrap()).unwrap();

        let sent = netlink.sent();
        let base = libc::NLM_F_REQUEST | libc::NLM_F_ACK | libc::NLM_F_CREATE;
        assert_eq!(sent[0].header.nlmsg_flags, (base | libc::NLM_F_EXCL) as u16);
        assert_eq!(sent[1].header.nlmsg_flags, base as u16);
    }

    #[test]
    fn test_unreachable_route_has_no_interface() {
        let netlink = RecordingNetlink::new();
        let mut route = Route::new(1003, "0.0.0.0/0", Some("unreachable")).unwrap();
        route.oif = Some(3);

        (&netlink as &dyn Netlink).handle_route().add(&route).unwrap();

        let (header, attrs) = decode_route(netlink.sent()[0].payload());
        assert_eq!(header.route_type, libc::RTN_UNREACHABLE);
        assert!(attrs.get(libc::RTA_OIF).is_none());
        assert!(attrs.get(libc::RTA_GATEWAY).is_none());
        assert_eq!(attrs.get(libc::RTA_TABLE).and_then(|a| a.u32()), Some(1003));
    }

    #[test]
    fn test_route_error_propagates() {
        let netlink = RecordingNetlink::new();
        netlink.fail_when(|_| Some(Errno::EEXIST));

        let err = (&netlink as &dyn Netlink)
            .handle_route()
            .add(&Route::new(1003, "10.0.0.0/8", None).unwrap())
            .unwrap_err();
        assert!(err.is(Errno::EEXIST));
    }

    #[test]
    fn test_route_flush_by_table() {
        let netlink = RecordingNetlink::new();
        let route = |table, dst: &str| encode_route(&Route::new(table, dst, None).unwrap());
        netlink.set_dump(
            libc::RTM_GETROUTE,
            libc::AF_INET as u8,
            vec![route(1003, "10.0.0.0/8"), route(254, "0.0.0.0/0")],
        );
        netlink.set_dump(
            libc::RTM_GETROUTE,
            libc::AF_INET6 as u8,
            vec![route(1003, "2001:db8::/64"), route(1004, "::/0")],
        );
        netlink.fail_when(|m| {
            (m.header.nlmsg_type == libc::RTM_DELROUTE && m.payload()[0] == libc::AF_INET6 as u8)
                .then_some(Errno::ENOENT)
        });

        (&netlink as &dyn Netlink).handle_route().flush(1003).unwrap();

        let deleted: Vec<_> = netlink
            .sent()
            .iter()
            .filter(|m| m.header.nlmsg_type == libc::RTM_DELROUTE)
            .map(|m| decode_route(m.payload()).1.get(libc::RTA_DST).unwrap().payload.clone())
            .collect();
        assert_eq!(deleted.len(), 2);
        assert_eq!(deleted[0], vec![10, 0, 0, 0]);
        assert_eq!(deleted[1][..4], [0x20, 0x01, 0x0d, 0xb8]);
    }

    #[test]
    fn test_route_flush_fails_on_dump_error() {
        let netlink = RecordingNetlink::new();
        netlink.fail_when(|m| (m.header.nlmsg_type == libc::RTM_GETROUTE).then_some(Errno::EBUSY));

        let err = (&netlink as &dyn Netlink).handle_route().flush(1003).unwrap_err();
        assert!(err.is(Errno::EBUSY));
    }
}
