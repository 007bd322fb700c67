use derive_builder::Builder;

use crate::error::{Error, Result, IFNAMSIZ};

use super::{
    message::{rta_align, Attribute, RouteAttr, RouteMessage, RTA_HDRLEN},
    uid_range::INVALID_UID,
};

pub const FR_ACT_TO_TBL: u8 = 1;
pub const FR_ACT_UNREACHABLE: u8 = 7;
pub const FR_ACT_PROHIBIT: u8 = 8;

pub const FRA_IIFNAME: u16 = 3;
pub const FRA_PRIORITY: u16 = 6;
pub const FRA_FWMARK: u16 = 10;
pub const FRA_TABLE: u16 = 15;
pub const FRA_FWMASK: u16 = 16;
pub const FRA_OIFNAME: u16 = 17;
pub const FRA_UID_RANGE: u16 = 20;

/// Priority bands, lowest value evaluated first.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RulePriority {
    VpnOverrideSystem = 10000,
    VpnOverrideOif = 10500,
    VpnOutputToLocal = 11000,
    SecureVpn = 12000,
    ProhibitNonVpn = 12500,
    ExplicitNetwork = 13000,
    OutputInterface = 14000,
    LegacySystem = 15000,
    LegacyNetwork = 16000,
    LocalNetwork = 17000,
    Tethering = 18000,
    ImplicitNetwork = 19000,
    BypassableVpn = 20000,
    VpnFallthrough = 21000,
    DefaultNetwork = 22000,
    Unreachable = 32000,
}

impl From<RulePriority> for u32 {
    fn from(priority: RulePriority) -> u32 {
        priority as u32
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    #[default]
    ToTable,
    Unreachable,
    Prohibit,
}

impl RuleAction {
    pub fn code(self) -> u8 {
        match self {
            RuleAction::ToTable => FR_ACT_TO_TBL,
            RuleAction::Unreachable => FR_ACT_UNREACHABLE,
            RuleAction::Prohibit => FR_ACT_PROHIBIT,
        }
    }
}

/// A FIB rule, family-agnostic; the rule handle installs it for IPv4 and IPv6.
///
/// + A `table` of 0 leaves the table unspecified, which is only valid when deleting.
/// + A `mask` of 0 means the rule does not match on fwmark and `fwmark` is ignored.
/// + `uid_start`/`uid_end` must both be [`INVALID_UID`] (all uids) or both be set.
#[derive(Builder, Debug, Clone, PartialEq, Eq)]
#[builder(default)]
pub struct Rule {
    #[builder(setter(into))]
    pub priority: u32,
    pub action: RuleAction,
    pub table: u32,
    pub fwmark: u32,
    pub mask: u32,
    #[builder(setter(into, strip_option))]
    pub iif_name: Option<String>,
    #[builder(setter(into, strip_option))]
    pub oif_name: Option<String>,
    pub uid_start: u32,
    pub uid_end: u32,
}

impl Rule {
    pub fn new() -> Self {
        Self {
            priority: 0,
            action: RuleAction::ToTable,
            table: libc::RT_TABLE_UNSPEC as u32,
            fwmark: 0,
            mask: 0,
            iif_name: None,
            oif_name: None,
            uid_start: INVALID_UID,
            uid_end: INVALID_UID,
        }
    }

    pub fn is_uid_rule(&self) -> bool {
        self.uid_start != INVALID_UID
    }

    /// Checks everything that can be rejected before talking to the kernel.
    pub fn validate(&self, deleting: bool) -> Result<()> {
        // Every bit set in the fwmark must be selected by the mask.
        if self.fwmark & !self.mask != 0 {
            return Err(Error::MarkOutsideMask {
                fwmark: self.fwmark,
                mask: self.mask,
            });
        }

        for name in [&self.iif_name, &self.oif_name].into_iter().flatten() {
            if name.len() + 1 > IFNAMSIZ {
                return Err(Error::InterfaceNameTooLong(name.len() + 1));
            }
        }

        if (self.uid_start == INVALID_UID) != (self.uid_end == INVALID_UID) {
            return Err(Error::UidRangeMismatch {
                start: self.uid_start,
                end: self.uid_end,
            });
        }

        // Table 0 is the local table; as a delete selector it is a wildcard.
        if self.table == libc::RT_TABLE_UNSPEC as u32
            && self.action == RuleAction::ToTable
            && !deleting
        {
            return Err(Error::UnspecifiedTable);
        }

        Ok(())
    }

    pub fn header(&self, family: u8) -> RouteMessage {
        RouteMessage {
            family,
            route_type: self.action.code(),
            ..Default::default()
        }
    }

    /// Attributes in the order the kernel is sent them.
    pub fn attributes(&self) -> Vec<RuleAttribute> {
        let mut attrs = vec![RuleAttribute::Priority(self.priority)];

        if self.table != libc::RT_TABLE_UNSPEC as u32 {
            attrs.push(RuleAttribute::Table(self.table));
        }
        if self.mask != 0 {
            attrs.push(RuleAttribute::FwMark(self.fwmark));
            attrs.push(RuleAttribute::FwMask(self.mask));
        }
        if self.is_uid_rule() {
            attrs.push(RuleAttribute::UidRange {
                start: self.uid_start,
                end: self.uid_end,
            });
        }
        if let Some(iif) = &self.iif_name {
            attrs.push(RuleAttribute::IifName(iif.clone()));
        }
        if let Some(oif) = &self.oif_name {
            attrs.push(RuleAttribute::OifName(oif.clone()));
        }

        attrs
    }
}

impl Default for Rule {
    fn default() -> Self {
        Self::new()
    }
}

/// FIB rule attributes with their payload types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAttribute {
    Priority(u32),
    Table(u32),
    FwMark(u32),
    FwMask(u32),
    UidRange { start: u32, end: u32 },
    IifName(String),
    OifName(String),
}

impl RuleAttribute {
    pub fn rta_type(&self) -> u16 {
        match self {
            RuleAttribute::Priority(_) => FRA_PRIORITY,
            RuleAttribute::Table(_) => FRA_TABLE,
            RuleAttribute::FwMark(_) => FRA_FWMARK,
            RuleAttribute::FwMask(_) => FRA_FWMASK,
            RuleAttribute::UidRange { .. } => FRA_UID_RANGE,
            RuleAttribute::IifName(_) => FRA_IIFNAME,
            RuleAttribute::OifName(_) => FRA_OIFNAME,
        }
    }

    /// Interface names carry exactly one terminating NUL; older kernels refuse
    /// to delete rules whose names are padded differently.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            RuleAttribute::Priority(v)
            | RuleAttribute::Table(v)
            | RuleAttribute::FwMark(v)
            | RuleAttribute::FwMask(v) => v.to_ne_bytes().to_vec(),
            RuleAttribute::UidRange { start, end } => {
                let mut b = Vec::with_capacity(8);
                b.extend_from_slice(&start.to_ne_bytes());
                b.extend_from_slice(&end.to_ne_bytes());
                b
            }
            RuleAttribute::IifName(name) | RuleAttribute::OifName(name) => {
                let mut b = Vec::with_capacity(name.len() + 1);
                b.extend_from_slice(name.as_bytes());
                b.push(0);
                b
            }
        }
    }
}

impl Attribute for RuleAttribute {
    fn len(&self) -> usize {
        rta_align(RTA_HDRLEN + self.payload().len())
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        RouteAttr::new(self.rta_type(), &self.payload()).serialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_builder_defaults() {
        let rule = RuleBuilder::default()
            .priority(RulePriority::Tethering)
            .table(1042u32)
            .iif_name("wlan0")
            .build()
            .unwrap();

        assert_eq!(rule.priority, 18000);
        assert_eq!(rule.uid_start, INVALID_UID);
        assert_eq!(rule.uid_end, INVALID_UID);
        assert_eq!(rule.iif_name.as_deref(), Some("wlan0"));
        assert!(rule.oif_name.is_none());
    }

    #[test]
    fn test_rule_rejects_mark_outside_mask() {
        let rule = RuleBuilder::default()
            .table(1000u32)
            .fwmark(0x3u32)
            .mask(0x1u32)
            .build()
            .unwrap();

        let err = rule.validate(false).unwrap_err();
        assert_eq!(err.code(), -libc::ERANGE);
    }

    #[test]
    fn test_rule_rejects_half_uid_range() {
        let rule = RuleBuilder::default()
            .table(1000u32)
            .uid_start(10000u32)
            .build()
            .unwrap();
        assert_eq!(rule.validate(false).unwrap_err().code(), -libc::EUSERS);

        let rule = RuleBuilder::default()
            .table(1000u32)
            .uid_end(10000u32)
            .build()
            .unwrap();
        assert_eq!(rule.validate(true).unwrap_err().code(), -libc::EUSERS);
    }

    #[test]
    fn test_rule_unspecified_table_only_for_delete() {
        let rule = Rule::new();
        assert_eq!(rule.validate(false).unwrap_err().code(), -libc::ENOTUNIQ);
        assert!(rule.validate(true).is_ok());

        let unreachable = RuleBuilder::default()
            .action(RuleAction::Unreachable)
            .build()
            .unwrap();
        assert!(unreachable.validate(false).is_ok());
    }

    #[test]
    fn test_rule_rejects_long_interface_name() {
        let rule = RuleBuilder::default()
            .table(1000u32)
            .oif_name("a_very_long_name")
            .build()
            .unwrap();
        assert_eq!(rule.validate(false).unwrap_err().code(), -libc::ENAMETOOLONG);
    }

    #[test]
    fn test_rule_attribute_order() {
        let rule = RuleBuilder::default()
            .priority(RulePriority::OutputInterface)
            .table(1005u32)
            .fwmark(0x10000u32)
            .mask(0x10000u32)
            .iif_name("lo")
            .oif_name("wlan0")
            .uid_start(0u32)
            .uid_end(0u32)
            .build()
            .unwrap();

        let kinds: Vec<u16> = rule.attributes().iter().map(|a| a.rta_type()).collect();
        assert_eq!(
            kinds,
            vec![
                FRA_PRIORITY,
                FRA_TABLE,
                FRA_FWMARK,
                FRA_FWMASK,
                FRA_UID_RANGE,
                FRA_IIFNAME,
                FRA_OIFNAME
            ]
        );
    }

    #[test]
    fn test_interface_name_encoding() {
        let attr = RuleAttribute::IifName("lo".into());
        let buf = attr.serialize().unwrap();

        // 4 byte header + "lo\0", padded to 8.
        assert_eq!(buf.len(), 8);
        assert_eq!(&buf[0..2], &7u16.to_ne_bytes());
        assert_eq!(&buf[2..4], &FRA_IIFNAME.to_ne_bytes());
        assert_eq!(&buf[4..], &[b'l', b'o', 0, 0]);
        assert_eq!(attr.len(), 8);

        let attr = RuleAttribute::OifName("rmnet0".into());
        let buf = attr.serialize().unwrap();
        assert_eq!(u16::from_ne_bytes([buf[0], buf[1]]), 11);
        assert_eq!(buf.len(), 12);
        assert_eq!(buf[11], 0);
    }
}
