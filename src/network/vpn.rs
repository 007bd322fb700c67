use std::collections::BTreeSet;

use tracing::error;

use crate::{
    controller::RouteController,
    error::Result,
    types::uid_range::UidRanges,
};

use super::{unchanged, NetworkContext, SocketDestroyer};

/// A VPN. Secure VPNs capture their users' traffic unconditionally;
/// bypassable ones only claim sockets not explicitly bound elsewhere.
#[derive(Debug)]
pub struct VirtualNetwork {
    net_id: u32,
    interfaces: BTreeSet<String>,
    secure: bool,
    uid_ranges: UidRanges,
}

impl VirtualNetwork {
    pub fn new(net_id: u32, secure: bool) -> Self {
        Self {
            net_id,
            interfaces: BTreeSet::new(),
            secure,
            uid_ranges: UidRanges::new(),
        }
    }

    pub fn net_id(&self) -> u32 {
        self.net_id
    }

    pub fn interfaces(&self) -> &BTreeSet<String> {
        &self.interfaces
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    pub fn uid_ranges(&self) -> &UidRanges {
        &self.uid_ranges
    }

    pub fn applies_to_user(&self, uid: u32) -> bool {
        self.uid_ranges.has_uid(uid)
    }

    pub fn add_interface(&mut self, routes: &RouteController, interface: &str) -> Result<()> {
        if unchanged(&self.interfaces, interface, true) {
            return Ok(());
        }

        routes
            .add_interface_to_virtual_network(self.net_id, interface, self.secure, &self.uid_ranges)
            .map_err(|e| {
                error!("failed to add interface {} to VPN netId {}: {}", interface, self.net_id, e);
                e
            })?;

        self.interfaces.insert(interface.to_string());
        Ok(())
    }

    pub fn remove_interface(&mut self, routes: &RouteController, interface: &str) -> Result<()> {
        if unchanged(&self.interfaces, interface, false) {
            return Ok(());
        }

        routes
            .remove_interface_from_virtual_network(
                self.net_id,
                interface,
                self.secure,
                &self.uid_ranges,
            )
            .map_err(|e| {
                error!(
                    "failed to remove interface {} from VPN netId {}: {}",
                    interface, self.net_id, e
                );
                e
            })?;

        self.interfaces.remove(interface);
        Ok(())
    }

    /// Users moving in or out of a secure VPN lose their open connections,
    /// except protectable users and loopback traffic. Failure is logged only.
    fn maybe_close_sockets(
        &self,
        destroyer: &dyn SocketDestroyer,
        adding: bool,
        ranges: &UidRanges,
        protectable_users: &BTreeSet<u32>,
    ) {
        if !self.secure {
            return;
        }

        if let Err(e) = destroyer.destroy_sockets_for_uids(ranges, protectable_users, true) {
            error!(
                "Failed to close sockets while {} {} {} VPN netId {}: {}",
                if adding { "adding" } else { "removing" },
                ranges,
                if adding { "to" } else { "from" },
                self.net_id,
                e
            );
        }
    }

    pub fn add_users(
        &mut self,
        ctx: &NetworkContext<'_>,
        ranges: &UidRanges,
        protectable_users: &BTreeSet<u32>,
    ) -> Result<()> {
        self.maybe_close_sockets(ctx.destroyer, true, ranges, protectable_users);

        for interface in &self.interfaces {
            ctx.routes
                .add_users_to_virtual_network(self.net_id, interface, self.secure, ranges)
                .map_err(|e| {
                    error!("failed to add users on interface {} of netId {}", interface, self.net_id);
                    e
                })?;
        }

        self.uid_ranges.add(ranges);
        Ok(())
    }

    pub fn remove_users(
        &mut self,
        ctx: &NetworkContext<'_>,
        ranges: &UidRanges,
        protectable_users: &BTreeSet<u32>,
    ) -> Result<()> {
        self.maybe_close_sockets(ctx.destroyer, false, ranges, protectable_users);

        for interface in &self.interfaces {
            ctx.routes
                .remove_users_from_virtual_network(self.net_id, interface, self.secure, ranges)
                .map_err(|e| {
                    error!(
                        "failed to remove users on interface {} of netId {}",
                        interface, self.net_id
                    );
                    e
                })?;
        }

        self.uid_ranges.remove(ranges);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::{
        config::Config,
        testutil::{
            DestroyCall, Event, Journal, RecordingDestroyer, RecordingIptables, RecordingNetlink,
            StaticInterfaces,
        },
    };

    use super::*;

    struct Fixture {
        routes: RouteController,
        netlink: Arc<RecordingNetlink>,
        destroyer: RecordingDestroyer,
        journal: Journal,
    }

    fn fixture() -> Fixture {
        let journal = Journal::default();
        let netlink = Arc::new(RecordingNetlink::with_journal(&journal));
        let routes = RouteController::new(
            Config {
                table_names_path: "/nonexistent/rt_tables".into(),
                ..Default::default()
            },
            netlink.clone(),
            Arc::new(RecordingIptables::new()),
            Box::new(StaticInterfaces::new(&[("tun0", 9)])),
        );

        Fixture {
            routes,
            netlink,
            destroyer: RecordingDestroyer::with_journal(&journal),
            journal,
        }
    }

    impl Fixture {
        fn ctx(&self) -> NetworkContext<'_> {
            NetworkContext {
                routes: &self.routes,
                destroyer: &self.destroyer,
                vpn_net_ids: &[],
            }
        }
    }

    #[test]
    fn test_secure_vpn_closes_sockets_before_rules() {
        let f = fixture();
        let mut vpn = VirtualNetwork::new(200, true);
        vpn.add_interface(&f.routes, "tun0").unwrap();
        f.journal.clear();

        let ranges = UidRanges::parse_from(["10000-10999"]).unwrap();
        let protectable = BTreeSet::from([1016]);
        vpn.add_users(&f.ctx(), &ranges, &protectable).unwrap();

        let events = f.journal.events();
        assert!(matches!(
            &events[0],
            Event::Destroy(DestroyCall::ForUids { ranges: r, skip }) if *r == ranges && *skip == protectable
        ));
        assert_eq!(events.len(), 1 + 2 * 3);
        assert!(vpn.applies_to_user(10500));
        assert!(!vpn.applies_to_user(11000));

        vpn.remove_users(&f.ctx(), &ranges, &protectable).unwrap();
        assert!(!vpn.applies_to_user(10500));
        assert_eq!(f.destroyer.calls().len(), 2);
    }

    #[test]
    fn test_bypassable_vpn_keeps_sockets() {
        let f = fixture();
        let mut vpn = VirtualNetwork::new(200, false);

        let ranges = UidRanges::parse_from(["10000"]).unwrap();
        vpn.add_users(&f.ctx(), &ranges, &BTreeSet::new()).unwrap();

        assert!(f.destroyer.calls().is_empty());
        // no interfaces yet: nothing to install
        assert!(f.netlink.sent().is_empty());
        assert!(vpn.applies_to_user(10000));
    }

    #[test]
    fn test_interface_carries_existing_users() {
        let f = fixture();
        let mut vpn = VirtualNetwork::new(200, false);
        let ranges = UidRanges::parse_from(["10000-10099"]).unwrap();
        vpn.add_users(&f.ctx(), &ranges, &BTreeSet::new()).unwrap();

        vpn.add_interface(&f.routes, "tun0").unwrap();

        let rules = f.netlink.rules();
        assert_eq!(rules[0].1.uid_start, 10000);
        assert_eq!(rules[0].1.uid_end, 10099);
        assert_eq!(rules[0].1.table, 1009);
    }
}
