//! In-process stand-ins for the kernel, the packet filter and the socket
//! killer, recording what the routing code asks of them.

use std::{
    collections::{BTreeSet, HashMap},
    net::IpAddr,
    sync::{Arc, Mutex},
};

use nix::errno::Errno;

use crate::{
    controller::{
        iptables::{IptablesRestore, IptablesTarget},
        table::InterfaceIndex,
    },
    core::message::Message,
    error::{Error, Result},
    handle::handle::Netlink,
    network::SocketDestroyer,
    types::{
        fwmark::Permission,
        message::{Attribute, RouteAttrs, RouteMessage},
        route::Route,
        rule::{
            Rule, RuleAction, RuleAttribute, RulePriority, FRA_FWMARK, FRA_FWMASK, FRA_IIFNAME, FRA_OIFNAME,
            FRA_PRIORITY, FRA_TABLE, FRA_UID_RANGE, FR_ACT_PROHIBIT, FR_ACT_UNREACHABLE,
        },
        uid_range::UidRanges,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyCall {
    LackingPermission {
        net_id: u32,
        permission: Permission,
    },
    ForUids {
        ranges: UidRanges,
        skip: BTreeSet<u32>,
    },
    ForUid(u32),
    ByAddr(String),
}

#[derive(Debug, Clone)]
pub enum Event {
    Netlink(Message),
    Destroy(DestroyCall),
}

/// Ordered log shared by the recording collaborators.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Event>>>);

impl Journal {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

type FailFn = Box<dyn Fn(&Message) -> Option<Errno> + Send + Sync>;

#[derive(Default)]
pub struct RecordingNetlink {
    journal: Journal,
    fail: Mutex<Option<FailFn>>,
    dumps: Mutex<HashMap<(u16, u8), Vec<Vec<u8>>>>,
}

impl RecordingNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_journal(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
            ..Default::default()
        }
    }

    /// Fails every request for which `f` returns an errno.
    pub fn fail_when<F>(&self, f: F)
    where
        F: Fn(&Message) -> Option<Errno> + Send + Sync + 'static,
    {
        *self.fail.lock().unwrap() = Some(Box::new(f));
    }

    pub fn succeed(&self) {
        *self.fail.lock().unwrap() = None;
    }

    /// Payloads returned by a `get` dump in `family`.
    pub fn set_dump(&self, get: u16, family: u8, payloads: Vec<Vec<u8>>) {
        self.dumps.lock().unwrap().insert((get, family), payloads);
    }

    pub fn sent(&self) -> Vec<Message> {
        self.journal
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Netlink(m) => Some(m),
                Event::Destroy(_) => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.journal.clear();
    }

    /// `(added, rule)` for every IPv4 rule message sent; the IPv6 copy is
    /// identical apart from the family.
    pub fn rules(&self) -> Vec<(bool, Rule)> {
        self.sent()
            .iter()
            .filter(|m| {
                matches!(m.header.nlmsg_type, libc::RTM_NEWRULE | libc::RTM_DELRULE)
                    && m.payload()[0] == libc::AF_INET as u8
            })
            .map(|m| {
                (
                    m.header.nlmsg_type == libc::RTM_NEWRULE,
                    decode_rule(m.payload()).1,
                )
            })
            .collect()
    }

    pub fn routes(&self) -> Vec<(bool, RouteMessage, RouteAttrs)> {
        self.sent()
            .iter()
            .filter(|m| matches!(m.header.nlmsg_type, libc::RTM_NEWROUTE | libc::RTM_DELROUTE))
            .map(|m| {
                let (header, attrs) = decode_route(m.payload());
                (m.header.nlmsg_type == libc::RTM_NEWROUTE, header, attrs)
            })
            .collect()
    }
}

impl Netlink for RecordingNetlink {
    fn request(&self, msg: &mut Message, _res_type: u16) -> Result<Vec<Vec<u8>>> {
        self.journal.push(Event::Netlink(msg.clone()));

        if let Some(errno) = self.fail.lock().unwrap().as_ref().and_then(|f| f(msg)) {
            return Err(Error::Kernel(errno));
        }

        if msg.header.nlmsg_flags & libc::NLM_F_DUMP as u16 != 0 {
            let family = msg.payload().first().copied().unwrap_or(0);
            return Ok(self
                .dumps
                .lock()
                .unwrap()
                .get(&(msg.header.nlmsg_type, family))
                .cloned()
                .unwrap_or_default());
        }

        Ok(vec![])
    }
}

/// Fails tethering rule deletions with ENOENT, as the kernel does once no
/// tethering rule is left. Interface removal deletes them until that happens.
pub fn no_tethering_rules(msg: &Message) -> Option<Errno> {
    (msg.header.nlmsg_type == libc::RTM_DELRULE
        && decode_rule(msg.payload()).1.priority == RulePriority::Tethering as u32)
        .then_some(Errno::ENOENT)
}

/// A rule message payload as the kernel would dump it.
pub fn encode_rule(family: u8, rule: &Rule, with_priority: bool) -> Vec<u8> {
    let mut buf = rule.header(family).serialize().unwrap();
    for attr in rule.attributes() {
        if !with_priority && matches!(attr, RuleAttribute::Priority(_)) {
            continue;
        }
        buf.extend(attr.serialize().unwrap());
    }
    buf
}

pub fn decode_rule(payload: &[u8]) -> (u8, Rule) {
    let (header, attrs) = RouteMessage::parse(payload).unwrap();
    let u32_attr = |t| attrs.get(t).and_then(|a| a.u32());
    let name_attr = |t| {
        attrs.get(t).map(|a| {
            assert_eq!(a.payload.last(), Some(&0), "interface name not NUL-terminated");
            String::from_utf8(a.payload[..a.payload.len() - 1].to_vec()).unwrap()
        })
    };

    let mut rule = Rule::new();
    rule.action = match header.route_type {
        FR_ACT_UNREACHABLE => RuleAction::Unreachable,
        FR_ACT_PROHIBIT => RuleAction::Prohibit,
        _ => RuleAction::ToTable,
    };
    rule.priority = u32_attr(FRA_PRIORITY).unwrap_or(0);
    rule.table = u32_attr(FRA_TABLE).unwrap_or(0);
    rule.fwmark = u32_attr(FRA_FWMARK).unwrap_or(0);
    rule.mask = u32_attr(FRA_FWMASK).unwrap_or(0);
    rule.iif_name = name_attr(FRA_IIFNAME);
    rule.oif_name = name_attr(FRA_OIFNAME);
    if let Some(uids) = attrs.get(FRA_UID_RANGE) {
        rule.uid_start = u32::from_ne_bytes(uids.payload[0..4].try_into().unwrap());
        rule.uid_end = u32::from_ne_bytes(uids.payload[4..8].try_into().unwrap());
    }

    (header.family, rule)
}

pub fn encode_route(route: &Route) -> Vec<u8> {
    let mut buf = route.header().serialize().unwrap();
    for attr in route.attributes() {
        buf.extend(attr.serialize().unwrap());
    }
    buf
}

pub fn decode_route(payload: &[u8]) -> (RouteMessage, RouteAttrs) {
    RouteMessage::parse(payload).unwrap()
}

pub fn route_dst(attrs: &RouteAttrs) -> IpAddr {
    let payload = &attrs.get(libc::RTA_DST).unwrap().payload;
    match payload.len() {
        4 => IpAddr::from(<[u8; 4]>::try_from(payload.as_slice()).unwrap()),
        _ => IpAddr::from(<[u8; 16]>::try_from(payload.as_slice()).unwrap()),
    }
}

#[derive(Default)]
pub struct RecordingIptables {
    commands: Mutex<Vec<(IptablesTarget, String, String)>>,
    fail: Mutex<bool>,
}

impl RecordingIptables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(_, _, cmd)| cmd.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<(IptablesTarget, String, String)> {
        self.commands.lock().unwrap().clone()
    }
}

impl IptablesRestore for RecordingIptables {
    fn exec(&self, target: IptablesTarget, table: &str, command: &str) -> Result<()> {
        self.commands
            .lock()
            .unwrap()
            .push((target, table.to_string(), command.to_string()));
        if *self.fail.lock().unwrap() {
            return Err(Error::Iptables("exit status 1".into()));
        }
        Ok(())
    }
}

/// A mutable name → ifindex map.
#[derive(Default)]
pub struct StaticInterfaces(Mutex<HashMap<String, u32>>);

impl StaticInterfaces {
    pub fn new(entries: &[(&str, u32)]) -> Self {
        Self(Mutex::new(
            entries.iter().map(|(n, i)| (n.to_string(), *i)).collect(),
        ))
    }

    pub fn set(&self, name: &str, index: u32) {
        self.0.lock().unwrap().insert(name.to_string(), index);
    }

    pub fn remove(&self, name: &str) {
        self.0.lock().unwrap().remove(name);
    }
}

impl InterfaceIndex for StaticInterfaces {
    fn index(&self, name: &str) -> Option<u32> {
        self.0.lock().unwrap().get(name).copied()
    }
}

#[derive(Default)]
pub struct RecordingDestroyer {
    journal: Journal,
}

impl RecordingDestroyer {
    pub fn with_journal(journal: &Journal) -> Self {
        Self {
            journal: journal.clone(),
        }
    }

    pub fn calls(&self) -> Vec<DestroyCall> {
        self.journal
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Destroy(call) => Some(call),
                Event::Netlink(_) => None,
            })
            .collect()
    }
}

impl SocketDestroyer for RecordingDestroyer {
    fn destroy_sockets_lacking_permission(
        &self,
        net_id: u32,
        permission: Permission,
        _exclude_loopback: bool,
    ) -> Result<u32> {
        self.journal.push(Event::Destroy(DestroyCall::LackingPermission {
            net_id,
            permission,
        }));
        Ok(0)
    }

    fn destroy_sockets_for_uids(
        &self,
        ranges: &UidRanges,
        skip: &BTreeSet<u32>,
        _exclude_loopback: bool,
    ) -> Result<u32> {
        self.journal.push(Event::Destroy(DestroyCall::ForUids {
            ranges: ranges.clone(),
            skip: skip.clone(),
        }));
        Ok(0)
    }

    fn destroy_sockets_for_uid(&self, uid: u32, _exclude_loopback: bool) -> Result<u32> {
        self.journal.push(Event::Destroy(DestroyCall::ForUid(uid)));
        Ok(0)
    }

    fn destroy_sockets_by_addr(&self, addr: &str) -> Result<u32> {
        self.journal.push(Event::Destroy(DestroyCall::ByAddr(addr.to_string())));
        Ok(0)
    }
}
