use std::collections::BTreeSet;

use tracing::error;

use crate::{
    controller::{RouteController, TableType},
    error::Result,
    types::fwmark::Permission,
};

use super::{unchanged, NetworkContext};

/// A network backed by real interfaces: Wi-Fi, cellular, ethernet.
#[derive(Debug)]
pub struct PhysicalNetwork {
    net_id: u32,
    interfaces: BTreeSet<String>,
    permission: Permission,
    is_default: bool,
}

impl PhysicalNetwork {
    pub fn new(net_id: u32, permission: Permission) -> Self {
        Self {
            net_id,
            interfaces: BTreeSet::new(),
            permission,
            is_default: false,
        }
    }

    pub fn net_id(&self) -> u32 {
        self.net_id
    }

    pub fn interfaces(&self) -> &BTreeSet<String> {
        &self.interfaces
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn is_default(&self) -> bool {
        self.is_default
    }

    fn add_to_default(
        ctx: &NetworkContext<'_>,
        interface: &str,
        permission: Permission,
    ) -> Result<()> {
        ctx.routes
            .add_interface_to_default_network(interface, permission)
            .map_err(|e| {
                error!("failed to add interface {} to default network: {}", interface, e);
                e
            })?;
        ctx.add_fallthrough(interface, permission)
    }

    fn remove_from_default(
        ctx: &NetworkContext<'_>,
        interface: &str,
        permission: Permission,
    ) -> Result<()> {
        ctx.routes
            .remove_interface_from_default_network(interface, permission)
            .map_err(|e| {
                error!("failed to remove interface {} from default network: {}", interface, e);
                e
            })?;
        ctx.remove_fallthrough(interface, permission)
    }

    pub fn add_interface(&mut self, ctx: &NetworkContext<'_>, interface: &str) -> Result<()> {
        if unchanged(&self.interfaces, interface, true) {
            return Ok(());
        }

        ctx.routes
            .add_interface_to_physical_network(self.net_id, interface, self.permission)
            .map_err(|e| {
                error!("failed to add interface {} to netId {}: {}", interface, self.net_id, e);
                e
            })?;
        if self.is_default {
            Self::add_to_default(ctx, interface, self.permission)?;
        }

        self.interfaces.insert(interface.to_string());
        Ok(())
    }

    /// Leaves the default network first; removing from the physical network
    /// flushes the interface's table and forgets it, so that goes last.
    pub fn remove_interface(&mut self, ctx: &NetworkContext<'_>, interface: &str) -> Result<()> {
        if unchanged(&self.interfaces, interface, false) {
            return Ok(());
        }

        if self.is_default {
            Self::remove_from_default(ctx, interface, self.permission)?;
        }
        ctx.routes
            .remove_interface_from_physical_network(self.net_id, interface, self.permission)
            .map_err(|e| {
                error!(
                    "failed to remove interface {} from netId {}: {}",
                    interface, self.net_id, e
                );
                e
            })?;

        self.interfaces.remove(interface);
        Ok(())
    }

    pub fn add_as_default(&mut self, ctx: &NetworkContext<'_>) -> Result<()> {
        if self.is_default {
            return Ok(());
        }
        for interface in &self.interfaces {
            Self::add_to_default(ctx, interface, self.permission)?;
        }
        self.is_default = true;
        Ok(())
    }

    pub fn remove_as_default(&mut self, ctx: &NetworkContext<'_>) -> Result<()> {
        if !self.is_default {
            return Ok(());
        }
        for interface in &self.interfaces {
            Self::remove_from_default(ctx, interface, self.permission)?;
        }
        self.is_default = false;
        Ok(())
    }

    fn destroy_sockets_lacking_permission(&self, ctx: &NetworkContext<'_>, permission: Permission) {
        if permission == Permission::None {
            return;
        }
        if let Err(e) =
            ctx.destroyer
                .destroy_sockets_lacking_permission(self.net_id, permission, true)
        {
            error!(
                "Failed to destroy sockets on netId {} lacking {}: {}",
                self.net_id, permission, e
            );
        }
    }

    /// Adding and removing a throw route flushes the kernel's cached routes
    /// through the interface.
    fn invalidate_route_cache(routes: &RouteController, interface: &str) {
        for destination in ["0.0.0.0/0", "::/0"] {
            let _ = routes.add_route(interface, destination, Some("throw"), TableType::Interface);
            let _ =
                routes.remove_route(interface, destination, Some("throw"), TableType::Interface);
        }
    }

    /// Sockets that lose access are destroyed both before the rules change
    /// and after, to catch those connected in between.
    pub fn set_permission(&mut self, ctx: &NetworkContext<'_>, permission: Permission) -> Result<()> {
        if permission == self.permission {
            return Ok(());
        }
        if self.interfaces.is_empty() {
            self.permission = permission;
            return Ok(());
        }

        self.destroy_sockets_lacking_permission(ctx, permission);

        for interface in &self.interfaces {
            ctx.routes
                .modify_physical_network_permission(
                    self.net_id,
                    interface,
                    self.permission,
                    permission,
                )
                .map_err(|e| {
                    error!(
                        "failed to change permission on interface {} of netId {} from {} to {}",
                        interface, self.net_id, self.permission, permission
                    );
                    e
                })?;
            Self::invalidate_route_cache(ctx.routes, interface);
        }

        if self.is_default {
            for interface in &self.interfaces {
                Self::add_to_default(ctx, interface, permission)?;
                Self::remove_from_default(ctx, interface, self.permission)?;
            }
        }

        self.destroy_sockets_lacking_permission(ctx, permission);
        self.permission = permission;
        Ok(())
    }
}
