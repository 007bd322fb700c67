use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    fmt::Write as _,
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use tracing::{debug, error};

use crate::{
    config::Config,
    controller::{RouteController, TableType},
    error::{Error, Result},
    types::{
        fwmark::{Permission, NETID_UNSET},
        uid_range::{UidRanges, INVALID_UID},
    },
};

use super::{
    DummyNetwork, LocalNetwork, Network, NetworkContext, NetworkKind, PhysicalNetwork,
    SockDiagDestroyer, SocketDestroyer, VirtualNetwork,
};

pub const MIN_NET_ID: u32 = 100;
pub const MAX_NET_ID: u32 = 65535;
pub const MIN_OEM_ID: u32 = 1;
pub const MAX_OEM_ID: u32 = 50;

#[derive(Debug, Default)]
struct State {
    networks: BTreeMap<u32, Network>,
    default_net_id: u32,
    users: HashMap<u32, Permission>,
    protectable_users: BTreeSet<u32>,
    ifindex_to_last_net_id: BTreeMap<u32, u32>,
    address_to_ifindices: BTreeMap<String, HashSet<u32>>,
}

impl State {
    fn network(&self, net_id: u32) -> Result<&Network> {
        self.networks.get(&net_id).ok_or_else(|| {
            error!("no such netId {}", net_id);
            Error::NoSuchNetwork(net_id)
        })
    }

    fn network_mut(&mut self, net_id: u32) -> Result<&mut Network> {
        self.networks.get_mut(&net_id).ok_or_else(|| {
            error!("no such netId {}", net_id);
            Error::NoSuchNetwork(net_id)
        })
    }

    fn vpn_net_ids(&self) -> Vec<u32> {
        self.networks
            .values()
            .filter(|n| n.kind() == NetworkKind::Virtual)
            .map(Network::net_id)
            .collect()
    }

    fn network_for_interface(&self, interface: &str) -> u32 {
        self.networks
            .values()
            .find(|n| n.has_interface(interface))
            .map_or(NETID_UNSET, Network::net_id)
    }

    fn virtual_network_for_user(&self, uid: u32) -> Option<&VirtualNetwork> {
        self.networks
            .values()
            .filter_map(Network::as_virtual)
            .find(|vpn| vpn.applies_to_user(uid))
    }

    fn permission_for_user(&self, uid: u32, first_application_uid: u32) -> Permission {
        match self.users.get(&uid) {
            Some(permission) => *permission,
            None if uid < first_application_uid => Permission::System,
            None => Permission::None,
        }
    }
}

/// The daemon's view of every network, and the entry point for changing them.
///
/// All state sits behind one reader/writer lock. Mutations hold the write
/// lock for their whole multi-step rule sequence, so they never interleave.
pub struct NetworkController {
    config: Config,
    routes: RouteController,
    destroyer: Arc<dyn SocketDestroyer>,
    state: RwLock<State>,
}

impl NetworkController {
    /// The local and dummy networks exist from the start.
    pub fn new(routes: RouteController, destroyer: Arc<dyn SocketDestroyer>) -> Self {
        let config = routes.config().clone();

        let mut state = State {
            protectable_users: config.protectable_users.iter().copied().collect(),
            ..Default::default()
        };
        state.networks.insert(
            config.local_net_id,
            Network::Local(LocalNetwork::new(config.local_net_id)),
        );
        state.networks.insert(
            config.dummy_net_id,
            Network::Dummy(DummyNetwork::new(config.dummy_net_id, &config.dummy_interface)),
        );

        Self {
            config,
            routes,
            destroyer,
            state: RwLock::new(state),
        }
    }

    pub fn system(config: Config) -> Self {
        Self::new(RouteController::system(config), Arc::new(SockDiagDestroyer))
    }

    pub fn init(&self) -> Result<()> {
        self.routes.init()
    }

    pub fn routes(&self) -> &RouteController {
        &self.routes
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ctx<'a>(&'a self, vpn_net_ids: &'a [u32]) -> NetworkContext<'a> {
        NetworkContext {
            routes: &self.routes,
            destroyer: self.destroyer.as_ref(),
            vpn_net_ids,
        }
    }

    pub fn default_network(&self) -> u32 {
        self.read().default_net_id
    }

    /// Switches the default network. The new one is installed before the old
    /// one is removed. `NETID_UNSET` clears it.
    pub fn set_default_network(&self, net_id: u32) -> Result<()> {
        let mut guard = self.write();
        let state = &mut *guard;

        if net_id == state.default_net_id {
            return Ok(());
        }

        let vpns = state.vpn_net_ids();
        let ctx = self.ctx(&vpns);

        if net_id != NETID_UNSET {
            let network = state
                .network_mut(net_id)?
                .as_physical_mut()
                .ok_or_else(|| {
                    error!("cannot set default to non-physical network with netId {}", net_id);
                    Error::InvalidOperation(format!("netId {} is not a physical network", net_id))
                })?;
            network.add_as_default(&ctx)?;
        }

        let old = state.default_net_id;
        if old != NETID_UNSET {
            let network = state
                .networks
                .get_mut(&old)
                .and_then(Network::as_physical_mut)
                .ok_or_else(|| {
                    error!("cannot find previously set default network with netId {}", old);
                    Error::StaleDefault(old)
                })?;
            network.remove_as_default(&ctx)?;
        }

        state.default_net_id = net_id;
        Ok(())
    }

    /// The VPN that applies to `uid`, or else the default network.
    pub fn network_for_user(&self, uid: u32) -> u32 {
        let state = self.read();
        state
            .virtual_network_for_user(uid)
            .map_or(state.default_net_id, VirtualNetwork::net_id)
    }

    /// The netId a socket is marked with on connect(): a bypassable VPN that
    /// applies to `uid`, or the default network. Secure VPNs capture traffic
    /// through their uid rules whatever the mark says.
    pub fn network_for_connect(&self, uid: u32) -> u32 {
        let state = self.read();
        match state.virtual_network_for_user(uid) {
            Some(vpn) if !vpn.is_secure() => vpn.net_id(),
            _ => state.default_net_id,
        }
    }

    pub fn network_for_interface(&self, interface: &str) -> u32 {
        self.read().network_for_interface(interface)
    }

    pub fn is_virtual_network(&self, net_id: u32) -> bool {
        self.read()
            .networks
            .get(&net_id)
            .is_some_and(|n| n.kind() == NetworkKind::Virtual)
    }

    fn create_physical_network_locked(
        state: &mut State,
        net_id: u32,
        permission: Permission,
    ) -> Result<()> {
        if !((MIN_NET_ID..=MAX_NET_ID).contains(&net_id)
            || (MIN_OEM_ID..=MAX_OEM_ID).contains(&net_id))
        {
            error!("invalid netId {}", net_id);
            return Err(Error::InvalidNetId(net_id));
        }
        if state.networks.contains_key(&net_id) {
            error!("duplicate netId {}", net_id);
            return Err(Error::DuplicateNetwork(net_id));
        }

        state.networks.insert(
            net_id,
            Network::Physical(PhysicalNetwork::new(net_id, permission)),
        );
        Ok(())
    }

    pub fn create_physical_network(&self, net_id: u32, permission: Permission) -> Result<()> {
        Self::create_physical_network_locked(&mut self.write(), net_id, permission)
    }

    /// Creates a physical network on the lowest free OEM netId and returns it.
    pub fn create_physical_oem_network(&self, permission: Permission) -> Result<u32> {
        let mut state = self.write();

        let net_id = (MIN_OEM_ID..=MAX_OEM_ID)
            .find(|id| !state.networks.contains_key(id))
            .ok_or_else(|| {
                error!("No free network ID");
                Error::NoFreeNetId
            })?;

        Self::create_physical_network_locked(&mut state, net_id, permission)?;
        Ok(net_id)
    }

    /// Points the VPN at every interface of the default network, or takes it
    /// away again.
    fn modify_fallthrough(&self, state: &State, vpn_net_id: u32, add: bool) -> Result<()> {
        if state.default_net_id == NETID_UNSET {
            return Ok(());
        }

        let default = state.networks.get(&state.default_net_id).ok_or_else(|| {
            error!(
                "cannot find previously set default network with netId {}",
                state.default_net_id
            );
            Error::StaleDefault(state.default_net_id)
        })?;
        let physical = default.as_physical().ok_or_else(|| {
            error!("default network {} is not a physical network", state.default_net_id);
            Error::InvalidOperation("default network must be a physical network".into())
        })?;

        for interface in physical.interfaces() {
            if add {
                self.routes.add_virtual_network_fallthrough(
                    vpn_net_id,
                    interface,
                    physical.permission(),
                )?;
            } else {
                self.routes.remove_virtual_network_fallthrough(
                    vpn_net_id,
                    interface,
                    physical.permission(),
                )?;
            }
        }
        Ok(())
    }

    pub fn create_virtual_network(&self, net_id: u32, secure: bool) -> Result<()> {
        let mut state = self.write();

        if !(MIN_NET_ID..=MAX_NET_ID).contains(&net_id) {
            error!("invalid netId {}", net_id);
            return Err(Error::InvalidNetId(net_id));
        }
        if state.networks.contains_key(&net_id) {
            error!("duplicate netId {}", net_id);
            return Err(Error::DuplicateNetwork(net_id));
        }

        self.modify_fallthrough(&state, net_id, true)?;
        state
            .networks
            .insert(net_id, Network::Virtual(VirtualNetwork::new(net_id, secure)));
        Ok(())
    }

    /// Tears the network down as far as possible even when steps fail, and
    /// reports the first failure. The network is forgotten either way.
    pub fn destroy_network(&self, net_id: u32) -> Result<()> {
        let mut guard = self.write();
        let state = &mut *guard;

        if net_id == self.config.local_net_id {
            error!("cannot destroy local network");
            return Err(Error::InvalidOperation("cannot destroy local network".into()));
        }

        let vpns = state.vpn_net_ids();
        let ctx = self.ctx(&vpns);

        let mut network = state.networks.remove(&net_id).ok_or_else(|| {
            error!("no such netId {}", net_id);
            Error::NoSuchNetwork(net_id)
        })?;

        let mut first_err = network.clear_interfaces(&ctx).err();

        if state.default_net_id == net_id {
            if let Some(physical) = network.as_physical_mut() {
                if let Err(e) = physical.remove_as_default(&ctx) {
                    error!("failed to remove netId {} as default: {}", net_id, e);
                    first_err.get_or_insert(e);
                }
            }
            state.default_net_id = NETID_UNSET;
        } else if network.kind() == NetworkKind::Virtual {
            if let Err(e) = self.modify_fallthrough(state, net_id, false) {
                first_err.get_or_insert(e);
            }
        }

        state.ifindex_to_last_net_id.retain(|_, last| *last != net_id);

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// An interface belongs to at most one network.
    pub fn add_interface_to_network(&self, net_id: u32, interface: &str) -> Result<()> {
        let mut guard = self.write();
        let state = &mut *guard;

        state.network(net_id)?;

        let existing = state.network_for_interface(interface);
        if existing != NETID_UNSET && existing != net_id {
            error!("interface {} already assigned to netId {}", interface, existing);
            return Err(Error::InterfaceBusy {
                interface: interface.to_string(),
                net_id: existing,
            });
        }

        let vpns = state.vpn_net_ids();
        state
            .network_mut(net_id)?
            .add_interface(&self.ctx(&vpns), interface)?;

        match self.routes.tables().if_index(interface) {
            0 => debug!("no route table for interface {}", interface),
            ifindex => {
                state.ifindex_to_last_net_id.insert(ifindex, net_id);
            }
        }
        Ok(())
    }

    pub fn remove_interface_from_network(&self, net_id: u32, interface: &str) -> Result<()> {
        let mut guard = self.write();
        let state = &mut *guard;

        let vpns = state.vpn_net_ids();
        state
            .network_mut(net_id)?
            .remove_interface(&self.ctx(&vpns), interface)
    }

    /// Users below the first application uid hold SYSTEM unless set otherwise.
    pub fn permission_for_user(&self, uid: u32) -> Permission {
        self.read()
            .permission_for_user(uid, self.config.first_application_uid)
    }

    pub fn set_permission_for_users(&self, permission: Permission, uids: &[u32]) {
        let mut state = self.write();
        for &uid in uids {
            state.users.insert(uid, permission);
        }
    }

    /// Whether `uid` may explicitly select `net_id`.
    pub fn check_user_network_access(&self, uid: u32, net_id: u32) -> Result<()> {
        let state = self.read();
        let network = state.networks.get(&net_id).ok_or(Error::NoSuchNetwork(net_id))?;

        if uid == INVALID_UID {
            return Err(Error::UnknownUid);
        }

        let user = state.permission_for_user(uid, self.config.first_application_uid);
        if user.covers(Permission::System) {
            return Ok(());
        }

        if let Some(vpn) = network.as_virtual() {
            return match vpn.applies_to_user(uid) {
                true => Ok(()),
                false => Err(Error::NotPermitted { uid, net_id }),
            };
        }

        if let Some(vpn) = state.virtual_network_for_user(uid) {
            if vpn.is_secure() && !state.protectable_users.contains(&uid) {
                return Err(Error::NotPermitted { uid, net_id });
            }
        }

        let required = network
            .as_physical()
            .map_or(Permission::None, PhysicalNetwork::permission);
        match user.covers(required) {
            true => Ok(()),
            false => Err(Error::AccessDenied { uid, net_id }),
        }
    }

    /// Stops at the first network that fails.
    pub fn set_permission_for_networks(&self, permission: Permission, net_ids: &[u32]) -> Result<()> {
        let mut guard = self.write();
        let state = &mut *guard;
        let vpns = state.vpn_net_ids();
        let ctx = self.ctx(&vpns);

        for &net_id in net_ids {
            let physical = state.network_mut(net_id)?.as_physical_mut().ok_or_else(|| {
                error!("cannot set permissions on non-physical network with netId {}", net_id);
                Error::InvalidOperation(format!("netId {} is not a physical network", net_id))
            })?;
            physical.set_permission(&ctx, permission)?;
        }
        Ok(())
    }

    fn virtual_network_mut<'s>(
        state: &'s mut State,
        net_id: u32,
        what: &str,
    ) -> Result<&'s mut VirtualNetwork> {
        state.network_mut(net_id)?.as_virtual_mut().ok_or_else(|| {
            error!("cannot {} non-virtual network with netId {}", what, net_id);
            Error::InvalidOperation(format!("netId {} is not a virtual network", net_id))
        })
    }

    pub fn add_users_to_network(&self, net_id: u32, ranges: &UidRanges) -> Result<()> {
        let mut guard = self.write();
        let state = &mut *guard;
        let vpns = state.vpn_net_ids();

        let protectable = state.protectable_users.clone();
        Self::virtual_network_mut(state, net_id, "add users to")?.add_users(
            &self.ctx(&vpns),
            ranges,
            &protectable,
        )
    }

    pub fn remove_users_from_network(&self, net_id: u32, ranges: &UidRanges) -> Result<()> {
        let mut guard = self.write();
        let state = &mut *guard;
        let vpns = state.vpn_net_ids();

        let protectable = state.protectable_users.clone();
        Self::virtual_network_mut(state, net_id, "remove users from")?.remove_users(
            &self.ctx(&vpns),
            ranges,
            &protectable,
        )
    }

    pub fn add_route(
        &self,
        net_id: u32,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        legacy: bool,
        uid: u32,
    ) -> Result<()> {
        self.modify_route(net_id, interface, destination, nexthop, true, legacy, uid)
    }

    pub fn remove_route(
        &self,
        net_id: u32,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        legacy: bool,
        uid: u32,
    ) -> Result<()> {
        self.modify_route(net_id, interface, destination, nexthop, false, legacy, uid)
    }

    /// Routes on the local network go to local_network. Legacy routes go to
    /// legacy_system for SYSTEM users and legacy_network for the rest.
    /// Everything else goes to the interface's own table.
    #[allow(clippy::too_many_arguments)]
    fn modify_route(
        &self,
        net_id: u32,
        interface: &str,
        destination: &str,
        nexthop: Option<&str>,
        add: bool,
        legacy: bool,
        uid: u32,
    ) -> Result<()> {
        let state = self.read();

        state.network(net_id)?;

        match state.network_for_interface(interface) {
            NETID_UNSET => {
                error!("interface {} not assigned to any netId", interface);
                return Err(Error::NoSuchInterface(interface.to_string()));
            }
            existing if existing != net_id => {
                error!(
                    "interface {} assigned to netId {}, not {}",
                    interface, existing, net_id
                );
                return Err(Error::InterfaceNotInNetwork {
                    interface: interface.to_string(),
                    net_id,
                });
            }
            _ => {}
        }

        let table_type = if net_id == self.config.local_net_id {
            TableType::LocalNetwork
        } else if legacy {
            match state
                .permission_for_user(uid, self.config.first_application_uid)
                .covers(Permission::System)
            {
                true => TableType::LegacySystem,
                false => TableType::LegacyNetwork,
            }
        } else {
            TableType::Interface
        };

        match add {
            true => self.routes.add_route(interface, destination, nexthop, table_type),
            false => self.routes.remove_route(interface, destination, nexthop, table_type),
        }
    }

    pub fn add_interface_address(&self, ifindex: u32, address: &str) {
        if ifindex == 0 {
            error!("Attempting to add address {} without ifindex", address);
            return;
        }
        self.write()
            .address_to_ifindices
            .entry(address.to_string())
            .or_default()
            .insert(ifindex);
    }

    /// Forgets `address` on `ifindex` and returns whether sockets bound to it
    /// should be destroyed. They survive only when the address is still
    /// configured on another interface of the same VPN.
    pub fn remove_interface_address(&self, ifindex: u32, address: &str) -> bool {
        let mut guard = self.write();
        let state = &mut *guard;

        let Some(ifindices) = state.address_to_ifindices.get_mut(address) else {
            error!("Removing unknown address {} from ifindex {}", address, ifindex);
            return true;
        };
        if !ifindices.remove(&ifindex) {
            error!("No record of address {} on interface {}", address, ifindex);
            return true;
        }
        if ifindices.is_empty() {
            state.address_to_ifindices.remove(address);
            return true;
        }

        let Some(&last_net_id) = state.ifindex_to_last_net_id.get(&ifindex) else {
            error!("Interface index {} was never in a currently-connected netId", ifindex);
            return true;
        };

        let is_vpn = state
            .networks
            .get(&last_net_id)
            .is_some_and(|n| n.kind() == NetworkKind::Virtual);
        let still_on_network = ifindices
            .iter()
            .any(|idx| state.ifindex_to_last_net_id.get(idx) == Some(&last_net_id));

        !(is_vpn && still_on_network)
    }

    /// SYSTEM users and protectable users may exempt sockets from VPNs.
    pub fn can_protect(&self, uid: u32) -> bool {
        let state = self.read();
        state
            .permission_for_user(uid, self.config.first_application_uid)
            .covers(Permission::System)
            || state.protectable_users.contains(&uid)
    }

    pub fn allow_protect(&self, uids: &[u32]) {
        self.write().protectable_users.extend(uids.iter().copied());
    }

    pub fn deny_protect(&self, uids: &[u32]) {
        let mut state = self.write();
        for uid in uids {
            state.protectable_users.remove(uid);
        }
    }

    pub fn enable_tethering(&self, input_interface: &str, output_interface: &str) -> Result<()> {
        self.routes.enable_tethering(input_interface, output_interface)
    }

    pub fn disable_tethering(&self, input_interface: &str, output_interface: &str) -> Result<()> {
        self.routes.disable_tethering(input_interface, output_interface)
    }

    pub fn add_users_to_reject_non_secure_network(&self, ranges: &UidRanges) -> Result<()> {
        self.routes.add_users_to_reject_non_secure_network_rule(ranges)
    }

    pub fn remove_users_from_reject_non_secure_network(&self, ranges: &UidRanges) -> Result<()> {
        self.routes
            .remove_users_from_reject_non_secure_network_rule(ranges)
    }

    pub fn destroy_sockets_by_addr(&self, address: &str) -> Result<u32> {
        self.destroyer.destroy_sockets_by_addr(address)
    }

    pub fn destroy_sockets_for_uid(&self, uid: u32) -> Result<u32> {
        self.destroyer.destroy_sockets_for_uid(uid, true)
    }

    pub fn destroy_sockets_for_uids(&self, ranges: &UidRanges, skip: &BTreeSet<u32>) -> Result<u32> {
        self.destroyer.destroy_sockets_for_uids(ranges, skip, true)
    }

    pub fn destroy_sockets_lacking_permission(
        &self,
        net_id: u32,
        permission: Permission,
    ) -> Result<u32> {
        self.destroyer
            .destroy_sockets_lacking_permission(net_id, permission, true)
    }

    pub fn dump(&self) -> String {
        let state = self.read();
        let mut out = String::new();

        let _ = writeln!(out, "NetworkController");
        let _ = writeln!(out, "  Default network: {}", state.default_net_id);
        let _ = writeln!(out, "  Networks:");
        for network in state.networks.values() {
            let _ = writeln!(out, "    {}", network);
            if let Some(physical) = network.as_physical() {
                let _ = writeln!(out, "      Required permission: {}", physical.permission());
            }
        }
        let _ = writeln!(out, "  Interface <-> last network map:");
        for (ifindex, net_id) in &state.ifindex_to_last_net_id {
            let _ = writeln!(out, "    Ifindex: {} NetId: {}", ifindex, net_id);
        }
        let _ = writeln!(out, "  Interface addresses:");
        for (address, ifindices) in &state.address_to_ifindices {
            let mut ifindices: Vec<_> = ifindices.iter().collect();
            ifindices.sort();
            let _ = writeln!(out, "    address: {} ifindices: {:?}", address, ifindices);
        }

        out
    }
}
