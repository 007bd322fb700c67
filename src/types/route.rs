use std::net::IpAddr;

use ipnet::IpNet;

use crate::error::{Error, Result};

use super::message::{rta_align, Attribute, RouteAttr, RouteMessage, RTA_HDRLEN};

/// Priority given to default throw routes so they never outrank more specific
/// routes configured without a priority.
pub const PRIO_THROW: u32 = 100000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextHop {
    /// Directly connected, no gateway.
    Link,
    Gateway(IpAddr),
    Unreachable,
    Throw,
}

impl NextHop {
    /// Parses `"unreachable"`, `"throw"` or an address of the destination's family.
    pub fn parse(nexthop: Option<&str>, destination: &IpNet) -> Result<Self> {
        let Some(nexthop) = nexthop else {
            return Ok(NextHop::Link);
        };

        match nexthop {
            "unreachable" => Ok(NextHop::Unreachable),
            "throw" => Ok(NextHop::Throw),
            _ => {
                let invalid = || Error::InvalidNexthop(nexthop.to_string());
                let gateway: IpAddr = nexthop.parse().map_err(|_| invalid())?;
                if gateway.is_ipv4() != destination.addr().is_ipv4() {
                    return Err(invalid());
                }
                Ok(NextHop::Gateway(gateway))
            }
        }
    }

    pub fn route_type(&self) -> u8 {
        match self {
            NextHop::Unreachable => libc::RTN_UNREACHABLE,
            NextHop::Throw => libc::RTN_THROW,
            NextHop::Link | NextHop::Gateway(_) => libc::RTN_UNICAST,
        }
    }

    /// Unreachable and throw routes may carry neither an interface nor a gateway.
    pub fn is_special(&self) -> bool {
        matches!(self, NextHop::Unreachable | NextHop::Throw)
    }
}

/// An IPv4 or IPv6 route in a specific table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub table: u32,
    pub destination: IpNet,
    pub next_hop: NextHop,
    pub oif: Option<u32>,
}

impl Route {
    pub fn new(table: u32, destination: &str, nexthop: Option<&str>) -> Result<Self> {
        let destination: IpNet = destination
            .parse()
            .map_err(|_| Error::InvalidPrefix(destination.to_string()))?;
        let next_hop = NextHop::parse(nexthop, &destination)?;

        Ok(Self {
            table,
            destination,
            next_hop,
            oif: None,
        })
    }

    pub fn family(&self) -> u8 {
        match self.destination {
            IpNet::V4(_) => libc::AF_INET as u8,
            IpNet::V6(_) => libc::AF_INET6 as u8,
        }
    }

    pub fn is_default_throw(&self) -> bool {
        self.next_hop == NextHop::Throw && self.destination.prefix_len() == 0
    }

    /// fe80::/10 destinations.
    pub fn is_link_local_v6(&self) -> bool {
        match self.destination {
            IpNet::V6(net) => net.addr().segments()[0] & 0xffc0 == 0xfe80,
            IpNet::V4(_) => false,
        }
    }

    pub fn header(&self) -> RouteMessage {
        let scope = match self.next_hop {
            NextHop::Gateway(_) => libc::RT_SCOPE_UNIVERSE,
            _ => libc::RT_SCOPE_LINK,
        };

        RouteMessage {
            family: self.family(),
            dst_len: self.destination.prefix_len(),
            protocol: libc::RTPROT_STATIC,
            scope,
            route_type: self.next_hop.route_type(),
            ..Default::default()
        }
    }

    pub fn attributes(&self) -> Vec<RouteAttribute> {
        let mut attrs = vec![
            RouteAttribute::Table(self.table),
            RouteAttribute::Dst(self.destination.addr()),
        ];

        if !self.next_hop.is_special() {
            if let Some(oif) = self.oif {
                attrs.push(RouteAttribute::Oif(oif));
            }
            if let NextHop::Gateway(gateway) = self.next_hop {
                attrs.push(RouteAttribute::Gateway(gateway));
            }
        }
        if self.is_default_throw() {
            attrs.push(RouteAttribute::Priority(PRIO_THROW));
        }

        attrs
    }
}

/// Route attributes with their payload types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteAttribute {
    Table(u32),
    Dst(IpAddr),
    Oif(u32),
    Gateway(IpAddr),
    Priority(u32),
}

fn addr_octets(addr: &IpAddr) -> Vec<u8> {
    match addr {
        IpAddr::V4(ip) => ip.octets().to_vec(),
        IpAddr::V6(ip) => ip.octets().to_vec(),
    }
}

impl RouteAttribute {
    pub fn rta_type(&self) -> u16 {
        match self {
            RouteAttribute::Table(_) => libc::RTA_TABLE,
            RouteAttribute::Dst(_) => libc::RTA_DST,
            RouteAttribute::Oif(_) => libc::RTA_OIF,
            RouteAttribute::Gateway(_) => libc::RTA_GATEWAY,
            RouteAttribute::Priority(_) => libc::RTA_PRIORITY,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            RouteAttribute::Table(v) | RouteAttribute::Oif(v) | RouteAttribute::Priority(v) => {
                v.to_ne_bytes().to_vec()
            }
            RouteAttribute::Dst(addr) | RouteAttribute::Gateway(addr) => addr_octets(addr),
        }
    }
}

impl Attribute for RouteAttribute {
    fn len(&self) -> usize {
        rta_align(RTA_HDRLEN + self.payload().len())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        RouteAttr::new(self.rta_type(), &self.payload()).serialize()
    }
}
