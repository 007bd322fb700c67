//! Networks as the daemon tracks them, and how each kind applies itself to
//! the routing policy.

pub mod controller;
pub mod local;
pub mod physical;
pub mod vpn;

use std::{collections::BTreeSet, fmt};

use tracing::error;

use crate::{
    controller::RouteController,
    error::{Error, Result},
    handle::sock_diag::SockDiagHandle,
    types::{fwmark::Permission, uid_range::UidRanges},
};

pub use self::{
    local::{DummyNetwork, LocalNetwork},
    physical::PhysicalNetwork,
    vpn::VirtualNetwork,
};

/// Kills sockets that must not survive a routing change.
pub trait SocketDestroyer: Send + Sync {
    fn destroy_sockets_lacking_permission(
        &self,
        net_id: u32,
        permission: Permission,
        exclude_loopback: bool,
    ) -> Result<u32>;

    fn destroy_sockets_for_uids(
        &self,
        ranges: &UidRanges,
        skip: &BTreeSet<u32>,
        exclude_loopback: bool,
    ) -> Result<u32>;

    fn destroy_sockets_for_uid(&self, uid: u32, exclude_loopback: bool) -> Result<u32>;

    fn destroy_sockets_by_addr(&self, addr: &str) -> Result<u32>;
}

/// Opens a fresh pair of sock_diag sockets for every request.
#[derive(Debug, Default, Clone, Copy)]
pub struct SockDiagDestroyer;

impl SockDiagDestroyer {
    fn with_handle<T>(f: impl FnOnce(&mut SockDiagHandle) -> Result<T>) -> Result<T> {
        let mut handle = SockDiagHandle::new();
        handle.open().map_err(|e| {
            error!("Error opening sock_diag sockets: {}", e);
            e
        })?;
        f(&mut handle)
    }
}

impl SocketDestroyer for SockDiagDestroyer {
    fn destroy_sockets_lacking_permission(
        &self,
        net_id: u32,
        permission: Permission,
        exclude_loopback: bool,
    ) -> Result<u32> {
        Self::with_handle(|h| {
            h.destroy_sockets_lacking_permission(net_id, permission, exclude_loopback)
        })
    }

    fn destroy_sockets_for_uids(
        &self,
        ranges: &UidRanges,
        skip: &BTreeSet<u32>,
        exclude_loopback: bool,
    ) -> Result<u32> {
        Self::with_handle(|h| h.destroy_sockets_for_uids(ranges, skip, exclude_loopback))
    }

    fn destroy_sockets_for_uid(&self, uid: u32, exclude_loopback: bool) -> Result<u32> {
        Self::with_handle(|h| h.destroy_sockets_for_uid(uid, exclude_loopback))
    }

    fn destroy_sockets_by_addr(&self, addr: &str) -> Result<u32> {
        Self::with_handle(|h| h.destroy_sockets_by_addr(addr))
    }
}

/// What a network applies its changes through.
pub struct NetworkContext<'a> {
    pub routes: &'a RouteController,
    pub destroyer: &'a dyn SocketDestroyer,
    /// Every VPN currently configured; each one falls through to the default
    /// network's interfaces.
    pub vpn_net_ids: &'a [u32],
}

impl NetworkContext<'_> {
    pub fn add_fallthrough(&self, physical_interface: &str, permission: Permission) -> Result<()> {
        for &vpn_net_id in self.vpn_net_ids {
            self.routes
                .add_virtual_network_fallthrough(vpn_net_id, physical_interface, permission)
                .map_err(|e| {
                    error!(
                        "failed to add fallthrough to {} for VPN netId {}",
                        physical_interface, vpn_net_id
                    );
                    e
                })?;
        }
        Ok(())
    }

    pub fn remove_fallthrough(
        &self,
        physical_interface: &str,
        permission: Permission,
    ) -> Result<()> {
        for &vpn_net_id in self.vpn_net_ids {
            self.routes
                .remove_virtual_network_fallthrough(vpn_net_id, physical_interface, permission)
                .map_err(|e| {
                    error!(
                        "failed to remove fallthrough to {} for VPN netId {}",
                        physical_interface, vpn_net_id
                    );
                    e
                })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkKind {
    Local,
    Physical,
    Virtual,
    Dummy,
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            NetworkKind::Local => "LOCAL",
            NetworkKind::Physical => "PHYSICAL",
            NetworkKind::Virtual => "VIRTUAL",
            NetworkKind::Dummy => "DUMMY",
        })
    }
}

#[derive(Debug)]
pub enum Network {
    Local(LocalNetwork),
    Physical(PhysicalNetwork),
    Virtual(VirtualNetwork),
    Dummy(DummyNetwork),
}

impl Network {
    pub fn kind(&self) -> NetworkKind {
        match self {
            Network::Local(_) => NetworkKind::Local,
            Network::Physical(_) => NetworkKind::Physical,
            Network::Virtual(_) => NetworkKind::Virtual,
            Network::Dummy(_) => NetworkKind::Dummy,
        }
    }

    pub fn net_id(&self) -> u32 {
        match self {
            Network::Local(n) => n.net_id(),
            Network::Physical(n) => n.net_id(),
            Network::Virtual(n) => n.net_id(),
            Network::Dummy(n) => n.net_id(),
        }
    }

    pub fn interfaces(&self) -> &BTreeSet<String> {
        match self {
            Network::Local(n) => n.interfaces(),
            Network::Physical(n) => n.interfaces(),
            Network::Virtual(n) => n.interfaces(),
            Network::Dummy(n) => n.interfaces(),
        }
    }

    pub fn has_interface(&self, interface: &str) -> bool {
        self.interfaces().contains(interface)
    }

    pub fn add_interface(&mut self, ctx: &NetworkContext<'_>, interface: &str) -> Result<()> {
        match self {
            Network::Local(n) => n.add_interface(ctx.routes, interface),
            Network::Physical(n) => n.add_interface(ctx, interface),
            Network::Virtual(n) => n.add_interface(ctx.routes, interface),
            Network::Dummy(n) => n.add_interface(interface),
        }
    }

    pub fn remove_interface(&mut self, ctx: &NetworkContext<'_>, interface: &str) -> Result<()> {
        match self {
            Network::Local(n) => n.remove_interface(ctx.routes, interface),
            Network::Physical(n) => n.remove_interface(ctx, interface),
            Network::Virtual(n) => n.remove_interface(ctx.routes, interface),
            Network::Dummy(n) => n.remove_interface(interface),
        }
    }

    /// Removes every interface, stopping at the first failure.
    pub fn clear_interfaces(&mut self, ctx: &NetworkContext<'_>) -> Result<()> {
        while let Some(interface) = self.interfaces().first().cloned() {
            self.remove_interface(ctx, &interface)?;
        }
        Ok(())
    }

    pub fn as_physical(&self) -> Option<&PhysicalNetwork> {
        match self {
            Network::Physical(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_physical_mut(&mut self) -> Option<&mut PhysicalNetwork> {
        match self {
            Network::Physical(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_virtual(&self) -> Option<&VirtualNetwork> {
        match self {
            Network::Virtual(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_virtual_mut(&mut self) -> Option<&mut VirtualNetwork> {
        match self {
            Network::Virtual(n) => Some(n),
            _ => None,
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.net_id(), self.kind())?;
        if let Network::Virtual(vpn) = self {
            write!(f, " {}", if vpn.is_secure() { "SECURE" } else { "BYPASSABLE" })?;
        }
        write!(f, " [")?;
        for (i, interface) in self.interfaces().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", interface)?;
        }
        write!(f, "]")
    }
}

/// Adding an interface a network already has, or removing one it lacks, is
/// a no-op for every kind of network.
fn unchanged(interfaces: &BTreeSet<String>, interface: &str, adding: bool) -> bool {
    interfaces.contains(interface) == adding
}

fn invalid(what: &str) -> Error {
    Error::InvalidOperation(what.to_string())
}
