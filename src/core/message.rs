use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const NLMSG_ALIGNTO: usize = 4;
pub const NLMSG_HDRLEN: usize = 16;

pub fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// struct nlmsghdr
#[repr(C)]
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub nlmsg_len: u32,
    pub nlmsg_type: u16,
    pub nlmsg_flags: u16,
    pub nlmsg_seq: u32,
    pub nlmsg_pid: u32,
}

impl Header {
    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < NLMSG_HDRLEN {
            return Err(Error::Malformed(format!(
                "netlink header short read: {}",
                buf.len()
            )));
        }
        Ok(bincode::deserialize(&buf[..NLMSG_HDRLEN])?)
    }
}

/// A netlink message: header plus the already-serialized body.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub header: Header,
    data: Vec<u8>,
}

impl Message {
    pub fn new(proto: u16, flags: i32) -> Self {
        Self {
            header: Header {
                nlmsg_len: NLMSG_HDRLEN as u32,
                nlmsg_type: proto,
                nlmsg_flags: (libc::NLM_F_REQUEST | flags) as u16,
                nlmsg_seq: 0,
                nlmsg_pid: 0,
            },
            data: vec![],
        }
    }

    pub fn add(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
        self.header.nlmsg_len = (NLMSG_HDRLEN + self.data.len()) as u32;
    }

    pub fn payload(&self) -> &[u8] {
        &self.data
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = bincode::serialize(&self.header)?;
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Splits a datagram received from the kernel into its messages.
    pub fn split(buf: &[u8]) -> Result<Vec<Message>> {
        let mut msgs = vec![];
        let mut pos = 0;

        while pos + NLMSG_HDRLEN <= buf.len() {
            let header = Header::deserialize(&buf[pos..])?;
            let len = header.nlmsg_len as usize;

            if len < NLMSG_HDRLEN || pos + len > buf.len() {
                return Err(Error::Malformed(format!(
                    "bad message length {} at offset {}",
                    len, pos
                )));
            }

            msgs.push(Message {
                header,
                data: buf[pos + NLMSG_HDRLEN..pos + len].to_vec(),
            });

            pos += nlmsg_align(len);
        }

        Ok(msgs)
    }

    /// The errno carried by an NLMSG_ERROR message; 0 is a plain ACK.
    pub fn error_code(&self) -> Result<i32> {
        let bytes: [u8; 4] = self
            .data
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| Error::Malformed("truncated NLMSG_ERROR".into()))?;
        Ok(i32::from_ne_bytes(bytes))
    }
}
