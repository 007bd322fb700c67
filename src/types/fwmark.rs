use std::fmt;

use serde::{Deserialize, Serialize};

pub const NETID_UNSET: u32 = 0;
pub const MARK_UNSET: u32 = 0;
pub const FWMARK_NET_ID_MASK: u32 = 0xffff;

/// Permission a network requires of the sockets that use it. The values are
/// the bits stored in the fwmark; SYSTEM is a superset of NETWORK.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    #[default]
    None,
    Network,
    System,
}

impl Permission {
    pub fn bits(self) -> u32 {
        match self {
            Permission::None => 0x0,
            Permission::Network => 0x1,
            Permission::System => 0x3,
        }
    }

    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0x3 => Permission::System,
            0x1 => Permission::Network,
            _ => Permission::None,
        }
    }

    /// Whether holding `self` satisfies a requirement of `required`.
    pub fn covers(self, required: Permission) -> bool {
        self.bits() & required.bits() == required.bits()
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Permission::None => "NONE",
            Permission::Network => "NETWORK",
            Permission::System => "SYSTEM",
        };
        f.write_str(name)
    }
}

/// The socket mark layout shared with the socket-marking side of the daemon:
///
/// | bits  | field              |
/// |-------|--------------------|
/// | 0-15  | netId              |
/// | 16    | explicitlySelected |
/// | 17    | protectedFromVpn   |
/// | 18-19 | permission         |
/// | 20    | uidBillingDone     |
///
/// The same struct doubles as a mask: set a field to all-ones to match on it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Fwmark {
    pub net_id: u32,
    pub explicitly_selected: bool,
    pub protected_from_vpn: bool,
    pub permission: Permission,
    pub uid_billing_done: bool,
}

impl Fwmark {
    pub fn int_value(&self) -> u32 {
        (self.net_id & FWMARK_NET_ID_MASK)
            | (self.explicitly_selected as u32) << 16
            | (self.protected_from_vpn as u32) << 17
            | self.permission.bits() << 18
            | (self.uid_billing_done as u32) << 20
    }

    pub fn from_int(value: u32) -> Self {
        Self {
            net_id: value & FWMARK_NET_ID_MASK,
            explicitly_selected: value & (1 << 16) != 0,
            protected_from_vpn: value & (1 << 17) != 0,
            permission: Permission::from_bits(value >> 18),
            uid_billing_done: value & (1 << 20) != 0,
        }
    }

    pub fn uid_billing_mask() -> u32 {
        Fwmark {
            uid_billing_done: true,
            ..Default::default()
        }
        .int_value()
    }
}

impl From<Fwmark> for u32 {
    fn from(mark: Fwmark) -> u32 {
        mark.int_value()
    }
}
