//! The individual rules that make up a network's routing policy. Each helper
//! installs or removes one policy; none of them roll back on failure.

use nix::errno::Errno;
use tracing::error;

use crate::{
    error::{Error, Result},
    types::{
        fwmark::{Fwmark, Permission, FWMARK_NET_ID_MASK, NETID_UNSET},
        route::Route,
        rule::{Rule, RuleAction, RuleBuilder, RulePriority},
        uid_range::{UidRanges, INVALID_UID},
    },
};

use super::{
    iptables::IptablesTarget,
    table::{ROUTE_TABLE_LEGACY_NETWORK, ROUTE_TABLE_LEGACY_SYSTEM, ROUTE_TABLE_LOCAL_NETWORK},
    Action, RouteController, IIF_LOOPBACK, LOCAL_MANGLE_INPUT, UID_ROOT,
};

impl RouteController {
    pub(super) fn modify_rule(&self, action: Action, rule: &Rule) -> Result<()> {
        let handle = self.netlink.handle_rule();
        match action {
            Action::Add => handle.add(rule),
            Action::Del => handle.del(rule),
        }
    }

    pub(super) fn modify_ip_route(
        &self,
        action: Action,
        table: u32,
        interface: Option<&str>,
        destination: &str,
        nexthop: Option<&str>,
    ) -> Result<()> {
        let mut route = Route::new(table, destination, nexthop).map_err(|e| {
            error!("cannot parse route {} -> {:?}: {}", destination, nexthop, e);
            e
        })?;

        if !route.next_hop.is_special() {
            if let Some(interface) = interface {
                let index = self.tables.ifindex(interface).ok_or_else(|| {
                    error!("cannot find interface {}", interface);
                    Error::NoSuchInterface(interface.to_string())
                })?;
                route.oif = Some(index);
            }
        }

        let handle = self.netlink.handle_route();
        let res = match action {
            Action::Add => handle.add(&route),
            Action::Del => handle.del(&route),
        };
        if let Err(e) = &res {
            error!(
                "Error {} route {} -> {:?} {:?} to table {}: {}",
                action, destination, nexthop, interface, table, e
            );
        }
        res
    }

    /// Marks packets arriving on `interface` with the network's netId so that
    /// replies and accepted connections stay on the same network.
    pub(super) fn modify_incoming_packet_mark(
        &self,
        net_id: u32,
        interface: &str,
        permission: Permission,
        action: Action,
    ) -> Result<()> {
        let fwmark = Fwmark {
            net_id,
            explicitly_selected: true,
            protected_from_vpn: true,
            permission,
            ..Default::default()
        };
        let mask = !Fwmark::uid_billing_mask();

        let cmd = format!(
            "{} {} -i {} -j MARK --set-mark {:#x}/{:#x}",
            match action {
                Action::Add => "-A",
                Action::Del => "-D",
            },
            LOCAL_MANGLE_INPUT,
            interface,
            fwmark.int_value(),
            mask
        );

        self.iptables
            .exec(IptablesTarget::V4V6, "mangle", &cmd)
            .map_err(|e| {
                error!("failed to change iptables rule that sets incoming packet mark: {}", e);
                Error::Iptables(cmd)
            })
    }

    /// Replies from the local network forwarded through the VPN come back out
    /// of the tunnel and must find the local_network table.
    pub(super) fn modify_vpn_output_to_local_rule(
        &self,
        vpn_interface: &str,
        action: Action,
    ) -> Result<()> {
        let rule = RuleBuilder::default()
            .priority(RulePriority::VpnOutputToLocal)
            .table(ROUTE_TABLE_LOCAL_NETWORK)
            .iif_name(vpn_interface)
            .build()?;
        self.modify_rule(action, &rule)
    }

    /// Sends a uid range through the VPN regardless of the socket's netId,
    /// unless the socket is protected (or, for bypassable VPNs, explicitly
    /// bound elsewhere).
    pub(super) fn modify_vpn_uid_range_rule(
        &self,
        table: u32,
        uid_start: u32,
        uid_end: u32,
        secure: bool,
        action: Action,
    ) -> Result<()> {
        let mask = Fwmark {
            protected_from_vpn: true,
            explicitly_selected: !secure,
            ..Default::default()
        };
        let priority = if secure {
            RulePriority::SecureVpn
        } else {
            RulePriority::BypassableVpn
        };

        let rule = RuleBuilder::default()
            .priority(priority)
            .table(table)
            .mask(mask.int_value())
            .iif_name(IIF_LOOPBACK)
            .uid_start(uid_start)
            .uid_end(uid_end)
            .build()?;
        self.modify_rule(action, &rule)
    }

    /// Lets SYSTEM sockets use the VPN whatever their uid, so that the DNS
    /// proxy can resolve on behalf of VPN users.
    pub(super) fn modify_vpn_system_permission_rule(
        &self,
        net_id: u32,
        table: u32,
        secure: bool,
        action: Action,
    ) -> Result<()> {
        let fwmark = Fwmark {
            net_id,
            permission: Permission::System,
            ..Default::default()
        };
        let mask = Fwmark {
            net_id: FWMARK_NET_ID_MASK,
            permission: Permission::System,
            ..Default::default()
        };

        let rule = RuleBuilder::default()
            .priority(if secure {
                RulePriority::SecureVpn
            } else {
                RulePriority::BypassableVpn
            })
            .table(table)
            .fwmark(fwmark.int_value())
            .mask(mask.int_value())
            .build()?;
        self.modify_rule(action, &rule)
    }

    /// Sockets explicitly bound to `net_id` use its table, provided they hold
    /// the network's permission.
    pub(super) fn modify_explicit_network_rule(
        &self,
        net_id: u32,
        table: u32,
        permission: Permission,
        uid_start: u32,
        uid_end: u32,
        action: Action,
    ) -> Result<()> {
        let fwmark = Fwmark {
            net_id,
            explicitly_selected: true,
            permission,
            ..Default::default()
        };
        let mask = Fwmark {
            net_id: FWMARK_NET_ID_MASK,
            explicitly_selected: true,
            permission,
            ..Default::default()
        };

        let rule = RuleBuilder::default()
            .priority(RulePriority::ExplicitNetwork)
            .table(table)
            .fwmark(fwmark.int_value())
            .mask(mask.int_value())
            .iif_name(IIF_LOOPBACK)
            .uid_start(uid_start)
            .uid_end(uid_end)
            .build()?;
        self.modify_rule(action, &rule)
    }

    /// Sockets bound to `interface` use its table. Without a uid range, root
    /// also gets a rule above the VPN rules.
    pub(super) fn modify_output_interface_rules(
        &self,
        interface: &str,
        table: u32,
        permission: Permission,
        uid_start: u32,
        uid_end: u32,
        action: Action,
    ) -> Result<()> {
        let fwmark = Fwmark {
            permission,
            ..Default::default()
        };

        if uid_start == INVALID_UID && uid_end == INVALID_UID {
            let root = RuleBuilder::default()
                .priority(RulePriority::VpnOverrideOif)
                .table(table)
                .iif_name(IIF_LOOPBACK)
                .oif_name(interface)
                .uid_start(UID_ROOT)
                .uid_end(UID_ROOT)
                .build()?;
            self.modify_rule(action, &root)?;
        }

        let rule = RuleBuilder::default()
            .priority(RulePriority::OutputInterface)
            .table(table)
            .fwmark(fwmark.int_value())
            .mask(fwmark.int_value())
            .iif_name(IIF_LOOPBACK)
            .oif_name(interface)
            .uid_start(uid_start)
            .uid_end(uid_end)
            .build()?;
        self.modify_rule(action, &rule)
    }

    /// Sockets connected while `net_id` was the default keep using it even
    /// after the default changes.
    pub(super) fn modify_implicit_network_rule(
        &self,
        net_id: u32,
        table: u32,
        action: Action,
    ) -> Result<()> {
        let fwmark = Fwmark {
            net_id,
            explicitly_selected: false,
            permission: Permission::None,
            ..Default::default()
        };
        let mask = Fwmark {
            net_id: FWMARK_NET_ID_MASK,
            explicitly_selected: true,
            permission: Permission::None,
            ..Default::default()
        };

        let rule = RuleBuilder::default()
            .priority(RulePriority::ImplicitNetwork)
            .table(table)
            .fwmark(fwmark.int_value())
            .mask(mask.int_value())
            .iif_name(IIF_LOOPBACK)
            .build()?;
        self.modify_rule(action, &rule)
    }

    /// Traffic marked for the VPN that finds no route in the VPN's table falls
    /// through to the physical network, if it holds that network's permission.
    pub(super) fn modify_vpn_fallthrough_rule(
        &self,
        action: Action,
        vpn_net_id: u32,
        physical_interface: &str,
        permission: Permission,
    ) -> Result<()> {
        let table = self.tables.table_for_interface(physical_interface)?;

        let fwmark = Fwmark {
            net_id: vpn_net_id,
            permission,
            ..Default::default()
        };
        let mask = Fwmark {
            net_id: FWMARK_NET_ID_MASK,
            permission,
            ..Default::default()
        };

        let rule = RuleBuilder::default()
            .priority(RulePriority::VpnFallthrough)
            .table(table)
            .fwmark(fwmark.int_value())
            .mask(mask.int_value())
            .build()?;
        self.modify_rule(action, &rule)
    }

    /// Routes added through the legacy per-host API override the default
    /// network, and for SYSTEM sockets any VPN too.
    pub(super) fn add_legacy_route_rules(&self) -> Result<()> {
        let mut fwmark = Fwmark {
            explicitly_selected: false,
            ..Default::default()
        };
        let mut mask = Fwmark {
            explicitly_selected: true,
            ..Default::default()
        };

        for (priority, table) in [
            (RulePriority::LegacySystem, ROUTE_TABLE_LEGACY_SYSTEM),
            (RulePriority::LegacyNetwork, ROUTE_TABLE_LEGACY_NETWORK),
        ] {
            let rule = RuleBuilder::default()
                .priority(priority)
                .table(table)
                .fwmark(fwmark.int_value())
                .mask(mask.int_value())
                .build()?;
            self.modify_rule(Action::Add, &rule)?;
        }

        fwmark.permission = Permission::System;
        mask.permission = Permission::System;

        let rule = RuleBuilder::default()
            .priority(RulePriority::VpnOverrideSystem)
            .table(ROUTE_TABLE_LEGACY_SYSTEM)
            .fwmark(fwmark.int_value())
            .mask(mask.int_value())
            .build()?;
        self.modify_rule(Action::Add, &rule)
    }

    pub(super) fn add_local_network_rules(&self, local_net_id: u32) -> Result<()> {
        self.modify_explicit_network_rule(
            local_net_id,
            ROUTE_TABLE_LOCAL_NETWORK,
            Permission::None,
            INVALID_UID,
            INVALID_UID,
            Action::Add,
        )?;

        let fwmark = Fwmark {
            explicitly_selected: false,
            ..Default::default()
        };
        let mask = Fwmark {
            explicitly_selected: true,
            ..Default::default()
        };

        let rule = RuleBuilder::default()
            .priority(RulePriority::LocalNetwork)
            .table(ROUTE_TABLE_LOCAL_NETWORK)
            .fwmark(fwmark.int_value())
            .mask(mask.int_value())
            .build()?;
        self.modify_rule(Action::Add, &rule)
    }

    /// Anything unmatched so far is unreachable. The kernel's own "from all
    /// lookup main" rule is flushed at startup and must not be relied upon.
    pub(super) fn add_unreachable_rule(&self) -> Result<()> {
        let rule = RuleBuilder::default()
            .priority(RulePriority::Unreachable)
            .action(RuleAction::Unreachable)
            .build()?;
        self.modify_rule(Action::Add, &rule)
    }

    /// Brings up the dummy interface and routes everything through it, so that
    /// sockets bound to the dummy network fail fast instead of hanging.
    pub(super) fn configure_dummy_network(&self) -> Result<()> {
        let interface = self.config.dummy_interface.as_str();
        let table = self.tables.table_for_interface(interface)?;

        let index = self.tables.if_index(interface);
        self.netlink.handle_link().up(index).map_err(|e| {
            error!("Can't bring up {}: {}", interface, e);
            e
        })?;

        self.modify_output_interface_rules(
            interface,
            table,
            Permission::None,
            INVALID_UID,
            INVALID_UID,
            Action::Add,
        )
        .map_err(|e| {
            error!("Can't create oif rules for {}: {}", interface, e);
            e
        })?;

        self.modify_ip_route(Action::Add, table, Some(interface), "0.0.0.0/0", None)?;
        self.modify_ip_route(Action::Add, table, Some(interface), "::/0", None)
    }

    pub(super) fn modify_local_network(
        &self,
        net_id: u32,
        interface: &str,
        action: Action,
    ) -> Result<()> {
        self.modify_incoming_packet_mark(net_id, interface, Permission::None, action)?;
        self.modify_output_interface_rules(
            interface,
            ROUTE_TABLE_LOCAL_NETWORK,
            Permission::None,
            INVALID_UID,
            INVALID_UID,
            action,
        )
    }

    pub(super) fn modify_physical_network(
        &self,
        net_id: u32,
        interface: &str,
        permission: Permission,
        action: Action,
    ) -> Result<()> {
        let table = self.tables.table_for_interface(interface)?;

        self.modify_incoming_packet_mark(net_id, interface, permission, action)?;
        self.modify_explicit_network_rule(
            net_id,
            table,
            permission,
            INVALID_UID,
            INVALID_UID,
            action,
        )?;
        self.modify_output_interface_rules(
            interface,
            table,
            permission,
            INVALID_UID,
            INVALID_UID,
            action,
        )?;

        // Networks that require a permission are only reachable by explicitly
        // selected sockets, so they get no implicit rule.
        if permission == Permission::None {
            return self.modify_implicit_network_rule(net_id, table, action);
        }
        Ok(())
    }

    pub(super) fn modify_reject_non_secure_network_rule(
        &self,
        ranges: &UidRanges,
        action: Action,
    ) -> Result<()> {
        let mask = Fwmark {
            protected_from_vpn: true,
            ..Default::default()
        };

        for range in ranges.ranges() {
            let rule = RuleBuilder::default()
                .priority(RulePriority::ProhibitNonVpn)
                .action(RuleAction::Prohibit)
                .mask(mask.int_value())
                .iif_name(IIF_LOOPBACK)
                .uid_start(range.start)
                .uid_end(range.stop)
                .build()?;
            self.modify_rule(action, &rule)?;
        }

        Ok(())
    }

    pub(super) fn modify_virtual_network(
        &self,
        net_id: u32,
        interface: &str,
        ranges: &UidRanges,
        secure: bool,
        action: Action,
        modify_non_uid_based_rules: bool,
    ) -> Result<()> {
        let table = self.tables.table_for_interface(interface)?;

        for range in ranges.ranges() {
            self.modify_vpn_uid_range_rule(table, range.start, range.stop, secure, action)?;
            self.modify_explicit_network_rule(
                net_id,
                table,
                Permission::None,
                range.start,
                range.stop,
                action,
            )?;
            self.modify_output_interface_rules(
                interface,
                table,
                Permission::None,
                range.start,
                range.stop,
                action,
            )?;
        }

        if modify_non_uid_based_rules {
            self.modify_incoming_packet_mark(net_id, interface, Permission::None, action)?;
            self.modify_vpn_output_to_local_rule(interface, action)?;
            self.modify_vpn_system_permission_rule(net_id, table, secure, action)?;
            return self.modify_explicit_network_rule(
                net_id,
                table,
                Permission::None,
                UID_ROOT,
                UID_ROOT,
                action,
            );
        }

        Ok(())
    }

    pub(super) fn modify_default_network(
        &self,
        action: Action,
        interface: &str,
        permission: Permission,
    ) -> Result<()> {
        let table = self.tables.table_for_interface(interface)?;

        let fwmark = Fwmark {
            net_id: NETID_UNSET,
            permission,
            ..Default::default()
        };
        let mask = Fwmark {
            net_id: FWMARK_NET_ID_MASK,
            permission,
            ..Default::default()
        };

        let rule = RuleBuilder::default()
            .priority(RulePriority::DefaultNetwork)
            .table(table)
            .fwmark(fwmark.int_value())
            .mask(mask.int_value())
            .iif_name(IIF_LOOPBACK)
            .build()?;
        self.modify_rule(action, &rule)
    }

    pub(super) fn modify_tethered_network(
        &self,
        action: Action,
        input_interface: &str,
        output_interface: &str,
    ) -> Result<()> {
        let table = self.tables.table_for_interface(output_interface)?;

        let rule = RuleBuilder::default()
            .priority(RulePriority::Tethering)
            .table(table)
            .iif_name(input_interface)
            .build()?;
        self.modify_rule(action, &rule)
    }

    /// Deletes tethering rules from `input_interface` until none are left.
    pub(super) fn clear_tethering_rules(&self, input_interface: &str) -> Result<()> {
        let rule = RuleBuilder::default()
            .priority(RulePriority::Tethering)
            .iif_name(input_interface)
            .build()?;

        loop {
            match self.modify_rule(Action::Del, &rule) {
                Ok(()) => continue,
                Err(e) if e.is(Errno::ENOENT) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    pub(super) fn flush_rules(&self) -> Result<()> {
        self.netlink.handle_rule().flush()
    }
}
