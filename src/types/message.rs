use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const RTA_ALIGNTO: usize = 4;
pub const RTA_HDRLEN: usize = 4;

pub fn rta_align(len: usize) -> usize {
    (len + RTA_ALIGNTO - 1) & !(RTA_ALIGNTO - 1)
}

/// Something that lowers itself to netlink wire bytes.
pub trait Attribute {
    fn len(&self) -> usize;
    fn serialize(&self) -> Result<Vec<u8>>;
}

/// struct rtattr (identical in layout to struct nlattr)
#[repr(C)]
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RtAttr {
    pub rta_len: u16,
    pub rta_type: u16,
}

/// A single raw attribute. `serialize` always emits the RTA-aligned length,
/// with the header's `rta_len` covering only header and payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteAttr {
    pub header: RtAttr,
    pub payload: Vec<u8>,
}

impl RouteAttr {
    pub fn new(rta_type: u16, payload: &[u8]) -> Self {
        Self {
            header: RtAttr {
                rta_len: (RTA_HDRLEN + payload.len()) as u16,
                rta_type,
            },
            payload: payload.to_vec(),
        }
    }

    pub fn u32(&self) -> Option<u32> {
        self.payload
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .map(u32::from_ne_bytes)
    }
}

impl Attribute for RouteAttr {
    fn len(&self) -> usize {
        rta_align(self.header.rta_len as usize)
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = bincode::serialize(&self.header)?;
        buf.extend_from_slice(&self.payload);
        buf.resize(self.len(), 0);
        Ok(buf)
    }
}

/// The attributes trailing a fixed message header.
#[derive(Debug, Default)]
pub struct RouteAttrs(Vec<RouteAttr>);

impl RouteAttrs {
    pub fn get(&self, rta_type: u16) -> Option<&RouteAttr> {
        self.0.iter().find(|attr| attr.header.rta_type == rta_type)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&[u8]> for RouteAttrs {
    fn from(buf: &[u8]) -> Self {
        let mut attrs = vec![];
        let mut pos = 0;

        while pos + RTA_HDRLEN <= buf.len() {
            let rta_len = u16::from_ne_bytes([buf[pos], buf[pos + 1]]) as usize;
            let rta_type = u16::from_ne_bytes([buf[pos + 2], buf[pos + 3]]);

            if rta_len < RTA_HDRLEN || pos + rta_len > buf.len() {
                break;
            }

            attrs.push(RouteAttr {
                header: RtAttr {
                    rta_len: rta_len as u16,
                    rta_type,
                },
                payload: buf[pos + RTA_HDRLEN..pos + rta_len].to_vec(),
            });

            pos += rta_align(rta_len);
        }

        Self(attrs)
    }
}

impl IntoIterator for RouteAttrs {
    type Item = RouteAttr;
    type IntoIter = std::vec::IntoIter<RouteAttr>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// struct rtmsg. struct fib_rule_hdr has the same layout, with
/// `protocol`/`scope` reserved and `route_type` holding the rule action.
#[repr(C)]
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteMessage {
    pub family: u8,
    pub dst_len: u8,
    pub src_len: u8,
    pub tos: u8,
    pub table: u8,
    pub protocol: u8,
    pub scope: u8,
    pub route_type: u8,
    pub flags: u32,
}

impl RouteMessage {
    pub const LEN: usize = 12;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::Malformed(format!("rtmsg short read: {}", buf.len())));
        }
        Ok(bincode::deserialize(&buf[..Self::LEN])?)
    }

    /// Splits a RTM_*ROUTE / RTM_*RULE payload into header and attributes.
    pub fn parse(buf: &[u8]) -> Result<(Self, RouteAttrs)> {
        let msg = Self::deserialize(buf)?;
        Ok((msg, RouteAttrs::from(&buf[Self::LEN..])))
    }
}

impl Attribute for RouteMessage {
    fn len(&self) -> usize {
        Self::LEN
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }
}
