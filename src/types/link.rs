use serde::{Deserialize, Serialize};

use crate::error::Result;

use super::message::Attribute;

/// struct ifinfomsg
#[repr(C)]
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IfInfoMessage {
    pub family: u8,
    pub pad: u8,
    pub link_type: u16,
    pub index: i32,
    pub flags: u32,
    pub change: u32,
}

impl IfInfoMessage {
    pub const LEN: usize = 16;

    pub fn up(index: u32) -> Self {
        Self {
            family: libc::AF_UNSPEC as u8,
            index: index as i32,
            flags: libc::IFF_UP as u32,
            change: libc::IFF_UP as u32,
            ..Default::default()
        }
    }
}

impl Attribute for IfInfoMessage {
    fn len(&self) -> usize {
        Self::LEN
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifinfo_up() {
        let buf = Attribute::serialize(&IfInfoMessage::up(4)).unwrap();
        assert_eq!(buf.len(), IfInfoMessage::LEN);
        assert_eq!(i32::from_ne_bytes(buf[4..8].try_into().unwrap()), 4);
        assert_eq!(
            u32::from_ne_bytes(buf[8..12].try_into().unwrap()),
            libc::IFF_UP as u32
        );
        assert_eq!(
            u32::from_ne_bytes(buf[12..16].try_into().unwrap()),
            libc::IFF_UP as u32
        );
    }
}
