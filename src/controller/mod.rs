//! Policy routing: FIB rules and routes per network, layered by priority.
//!
//! Composite operations apply their steps in order and stop at the first
//! failure without undoing earlier steps. Every step is idempotent at the
//! kernel level, so callers recover by retrying.

pub mod iptables;
mod policy;
pub mod table;

use std::{fmt, sync::Arc};

use nix::errno::Errno;
use tracing::{error, info};

use crate::{
    config::Config,
    error::Result,
    handle::handle::{KernelNetlink, Netlink},
    types::{fwmark::Permission, uid_range::UidRanges},
};

use self::{
    iptables::{IptablesRestore, IptablesRestoreProcess},
    table::{
        InterfaceIndex, RouteTables, SystemInterfaces, ROUTE_TABLE_LEGACY_NETWORK,
        ROUTE_TABLE_LEGACY_SYSTEM, ROUTE_TABLE_LOCAL_NETWORK,
    },
};

pub const LOCAL_MANGLE_INPUT: &str = "routectrl_mangle_INPUT";
pub const IIF_LOOPBACK: &str = "lo";
pub const UID_ROOT: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Add,
    Del,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Action::Add => "adding",
            Action::Del => "removing",
        })
    }
}

/// Which table an explicitly added route goes into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    /// The interface's own table.
    Interface,
    LocalNetwork,
    LegacyNetwork,
    LegacySystem,
}

pub struct RouteController {
    config: Config,
    netlink: Arc<dyn Netlink>,
    iptables: Arc<dyn IptablesRestore>,
    tables: RouteTables,
}

impl RouteController {
    pub fn new(
        config: Config,
        netlink: Arc<dyn Netlink>,
        iptables: Arc<dyn IptablesRestore>,
        interfaces: Box<dyn InterfaceIndex>,
    ) -> Self {
        let tables = RouteTables::new(&config, interfaces);
        Self {
            config,
            netlink,
            iptables,
            tables,
        }
    }

    /// Talks to the running kernel and iptables.
    pub fn system(config: Config) -> Self {
        Self::new(
            config,
            Arc::new(KernelNetlink),
            Arc::new(IptablesRestoreProcess),
            Box::new(SystemInterfaces),
        )
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn tables(&self) -> &RouteTables {
        &self.tables
    }

    /// Replaces whatever rules the system booted with by the fixed skeleton:
    /// legacy, local network and unreachable rules. The dummy network is
    /// optional and its failure is only logged.
    pub fn init(&self) -> Result<()> {
        self.flush_rules()?;
        self.add_legacy_route_rules()?;
        self.add_local_network_rules(self.config.local_net_id)?;
        self.add_unreachable_rule()?;

        if let Err(e) = self.configure_dummy_network() {
            info!("dummy network not configured: {}", e);
        }

        self.tables.update_table_names_file();
        Ok(())
    }

    pub fn if_index(&self, interface: &str) -> u32 {
        let index = self.tables.if_index(interface);
        if index == 0 {
            error!("if_index: cannot find interface {}", interface);
        }
        index
    }

    pub fn add_interface_to_local_network(&self, net_id: u32, interface: &str) -> Result<()> {
        self.modify_local_network(net_id, interface, Action::Add)
    }

    pub fn remove_interface_from_local_network(&self, net_id: u32, interface: &str) -> Result<()> {
        self.modify_local_network(net_id, interface, Action::Del)
    }

    pub fn add_interface_to_physical_network(
        &self,
        net_id: u32,
        interface: &str,
        permission: Permission,
    ) -> Result<()> {
        self.modify_physical_network(net_id, interface, permission, Action::Add)?;
        self.tables.update_table_names_file();
        Ok(())
    }

    /// Rules go first, then the routes in the interface's table, then any
    /// tethering rules that still point at it.
    pub fn remove_interface_from_physical_network(
        &self,
        net_id: u32,
        interface: &str,
        permission: Permission,
    ) -> Result<()> {
        self.modify_physical_network(net_id, interface, permission, Action::Del)?;
        self.flush_routes(interface)?;
        self.clear_tethering_rules(interface)?;
        self.tables.update_table_names_file();
        Ok(())
    }

    pub fn add_interface_to_virtual_network(
        &self,
        net_id: u32,
        interface: &str,
        secure: bool,
        ranges: &UidRanges,
    ) -> Result<()> {
        self.modify_virtual_network(net_id, interface, ranges, secure, Action::Add, true)?;
        self.tables.update_table_names_file();
        Ok(())
    }

    pub fn remove_interface_from_virtual_network(
        &self,
        net_id: u32,
        interface: &str,
        secure: bool,
        ranges: &UidRanges,
    ) -> Result<()> {
        self.modify_virtual_network(net_id, interface, ranges, secure, Action::Del, true)?;
        self.flush_routes(interface)?;
        self.tables.update_table_names_file();
        Ok(())
    }

    /// Installs the rules for `new` before removing those for `old`, so
    /// traffic always has a matching rule.
    pub fn modify_physical_network_permission(
        &self,
        net_id: u32,
        interface: &str,
        old: Permission,
        new: Permission,
    ) -> Result<()> {
        self.modify_physical_network(net_id, interface, new, Action::Add)?;
        self.modify_physical_network(net_id, interface, old, Action::Del)
    }

    pub fn add_users_to_reject_non_secure_network_rule(&self, ranges: &UidRanges) -> Result<()> {
        self.modify_reject_non_secure_network_rule(ranges, Action::Add)
    }

    pub fn remove_users_from_reject_non_secure_network_rule(
        &self,
        ranges: &UidRanges,
    ) -> Result<()> {
        self.modify_reject_non_secure_network_rule(ranges, Action::Del)
    }

    pub fn add_users_to_virtual_network(
        &self,
        net_id: u32,
        interface: &str,
        secure: bool,
        ranges: &UidRanges,
    ) -> Result<()> {
        self.modify_virtual_network(net_id, interface, ranges, secure, Action::Add, false)
    }

    pub fn remove_users_from_virtual_network(
        &self,
        net_id: u32,
        interface: &str,
        secure: bool,
        ranges: &UidRanges,
    ) -> Result<()> {
        self.modify_virtual_network(net_id, interface, ranges, secure, Action::Del, false)
    }

    pub fn add_interface_to_default_network(
        &self,
        interface: &str,
        permission: Permission,
    ) -> Result<()> {
        self.modify_default_network(Action::Add, interface, permission)
    }

    pub fn remove_interface_from_default_network(
        &self,
        interface: &str,
        permission: Permission,
    ) -> Result<()> {
        self.modify_default_network(Action::Del, interface, permission)
    }

    pub fn add_route(
        &self,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table_type: TableType,
    ) -> Result<()> {
        self.modify_route(Action::Add, interface, destination, nexthop, table_type)
    }

    pub fn remove_route(
        &self,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table_type: TableType,
    ) -> Result<()> {
        self.modify_route(Action::Del, interface, destination, nexthop, table_type)
    }

    fn modify_route(
        &self,
        action: Action,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        table_type: TableType,
    ) -> Result<()> {
        let table = match table_type {
            TableType::Interface => self.tables.table_for_interface(interface)?,
            TableType::LocalNetwork => ROUTE_TABLE_LOCAL_NETWORK,
            TableType::LegacyNetwork => ROUTE_TABLE_LEGACY_NETWORK,
            TableType::LegacySystem => ROUTE_TABLE_LEGACY_SYSTEM,
        };

        match self.modify_ip_route(action, table, Some(interface), destination, nexthop) {
            Err(e) if action == Action::Add && e.is(Errno::EEXIST) => Ok(()),
            res => res,
        }
    }

    pub fn enable_tethering(&self, input_interface: &str, output_interface: &str) -> Result<()> {
        self.modify_tethered_network(Action::Add, input_interface, output_interface)
    }

    /// A rule that is already gone counts as disabled.
    pub fn disable_tethering(&self, input_interface: &str, output_interface: &str) -> Result<()> {
        match self.modify_tethered_network(Action::Del, input_interface, output_interface) {
            Err(e) if e.is(Errno::ENOENT) => Ok(()),
            res => res,
        }
    }

    pub fn add_virtual_network_fallthrough(
        &self,
        vpn_net_id: u32,
        physical_interface: &str,
        permission: Permission,
    ) -> Result<()> {
        self.modify_vpn_fallthrough_rule(Action::Add, vpn_net_id, physical_interface, permission)
    }

    pub fn remove_virtual_network_fallthrough(
        &self,
        vpn_net_id: u32,
        physical_interface: &str,
        permission: Permission,
    ) -> Result<()> {
        self.modify_vpn_fallthrough_rule(Action::Del, vpn_net_id, physical_interface, permission)
    }

    pub fn flush_routes_in_table(&self, table: u32) -> Result<()> {
        self.netlink.handle_route().flush(table)
    }

    /// Flushes the interface's table and, once that succeeded, forgets the
    /// interface. On failure the mapping is kept so the caller can retry.
    pub fn flush_routes(&self, interface: &str) -> Result<()> {
        let table = self.tables.table_for_interface(interface)?;

        self.flush_routes_in_table(table)?;
        self.tables.forget(interface);
        Ok(())
    }
}
