use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Deserialize;

use crate::error::{Error, Result};

use super::{
    fwmark::{Fwmark, Permission, FWMARK_NET_ID_MASK},
    message::{Attribute, RouteAttr, RouteAttrs},
};

pub const SOCK_DIAG_BY_FAMILY: u16 = 20;
pub const SOCK_DESTROY: u16 = 21;

pub const INET_DIAG_REQ_BYTECODE: u16 = 1;

pub const INET_DIAG_MEMINFO: u8 = 1;
pub const INET_DIAG_INFO: u8 = 2;
pub const INET_DIAG_VEGASINFO: u8 = 3;
pub const INET_DIAG_MARK: u8 = 15;

pub const INET_DIAG_BC_JMP: u8 = 1;
pub const INET_DIAG_BC_S_COND: u8 = 7;
pub const INET_DIAG_BC_MARK_COND: u8 = 10;

pub const TCP_ESTABLISHED: u8 = 1;
pub const TCP_SYN_SENT: u8 = 2;
pub const TCP_SYN_RECV: u8 = 3;
pub const TCP_TIME_WAIT: u8 = 6;

/// Sockets that can still carry traffic.
pub const LIVE_STATES: u32 =
    (1 << TCP_ESTABLISHED) | (1 << TCP_SYN_SENT) | (1 << TCP_SYN_RECV);
pub const ALL_STATES_BUT_TIME_WAIT: u32 = !(1 << TCP_TIME_WAIT);

/// struct inet_diag_sockid. Ports are network order; IPv4 addresses occupy
/// the first four bytes of the address fields.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SockDiagId {
    pub src_port: u16,
    pub dst_port: u16,
    pub src: [u8; 16],
    pub dst: [u8; 16],
    pub interface: u32,
    pub cookie: [u32; 2],
}

impl SockDiagId {
    pub const LEN: usize = 48;

    fn serialize_into(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.src_port.to_be_bytes());
        buf.extend_from_slice(&self.dst_port.to_be_bytes());
        buf.extend_from_slice(&self.src);
        buf.extend_from_slice(&self.dst);
        buf.extend_from_slice(&self.interface.to_ne_bytes());
        buf.extend_from_slice(&self.cookie[0].to_ne_bytes());
        buf.extend_from_slice(&self.cookie[1].to_ne_bytes());
    }
}

/// struct inet_diag_req_v2
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SockDiagReq {
    pub family: u8,
    pub protocol: u8,
    pub ext: u8,
    pub pad: u8,
    pub states: u32,
    pub id: SockDiagId,
}

impl Attribute for SockDiagReq {
    fn len(&self) -> usize {
        Self::LEN
    }

    fn serialize(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(Self::LEN);

        buf.push(self.family);
        buf.push(self.protocol);
        buf.push(self.ext);
        buf.push(self.pad);
        buf.extend_from_slice(&self.states.to_ne_bytes());
        self.id.serialize_into(&mut buf);

        Ok(buf)
    }
}

impl SockDiagReq {
    pub const LEN: usize = SockDiagId::LEN + 8;

    pub fn dump(protocol: u8, family: u8, ext: u8, states: u32) -> Self {
        Self {
            family,
            protocol,
            ext,
            states,
            ..Default::default()
        }
    }

    /// Targets exactly the socket described by `msg`.
    pub fn destroy(protocol: u8, msg: &SockDiag) -> Self {
        Self {
            family: msg.family,
            protocol,
            states: 1 << msg.state,
            id: msg.id,
            ..Default::default()
        }
    }

    pub fn request_tcp_info(family: u8) -> Self {
        Self::dump(
            libc::IPPROTO_TCP as u8,
            family,
            (1 << (INET_DIAG_VEGASINFO - 1)) | (1 << (INET_DIAG_INFO - 1)),
            0xfff,
        )
    }
}

struct ReadBuffer<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ReadBuffer<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn read(&mut self) -> u8 {
        let c = self.buf[self.pos];
        self.pos += 1;
        c
    }

    fn read_n<const N: usize>(&mut self) -> [u8; N] {
        let mut s = [0u8; N];
        s.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        s
    }
}

/// struct inet_diag_msg
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SockDiag {
    pub family: u8,
    pub state: u8,
    pub timer: u8,
    pub retrans: u8,
    pub id: SockDiagId,
    pub expires: u32,
    pub rqueue: u32,
    pub wqueue: u32,
    pub uid: u32,
    pub inode: u32,
}

impl SockDiag {
    pub const LEN: usize = SockDiagId::LEN + 24;

    pub fn deserialize(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::LEN {
            return Err(Error::Malformed(format!(
                "socket data short read: {}",
                buf.len()
            )));
        }

        let mut rb = ReadBuffer::new(buf);

        Ok(SockDiag {
            family: rb.read(),
            state: rb.read(),
            timer: rb.read(),
            retrans: rb.read(),
            id: SockDiagId {
                src_port: u16::from_be_bytes(rb.read_n::<2>()),
                dst_port: u16::from_be_bytes(rb.read_n::<2>()),
                src: rb.read_n::<16>(),
                dst: rb.read_n::<16>(),
                interface: u32::from_ne_bytes(rb.read_n::<4>()),
                cookie: [
                    u32::from_ne_bytes(rb.read_n::<4>()),
                    u32::from_ne_bytes(rb.read_n::<4>()),
                ],
            },
            expires: u32::from_ne_bytes(rb.read_n::<4>()),
            rqueue: u32::from_ne_bytes(rb.read_n::<4>()),
            wqueue: u32::from_ne_bytes(rb.read_n::<4>()),
            uid: u32::from_ne_bytes(rb.read_n::<4>()),
            inode: u32::from_ne_bytes(rb.read_n::<4>()),
        })
    }

    fn addr(&self, raw: &[u8; 16]) -> Option<IpAddr> {
        match self.family as i32 {
            libc::AF_INET => Some(IpAddr::V4(Ipv4Addr::new(raw[0], raw[1], raw[2], raw[3]))),
            libc::AF_INET6 => Some(IpAddr::V6(Ipv6Addr::from(*raw))),
            _ => None,
        }
    }

    pub fn src_addr(&self) -> Option<IpAddr> {
        self.addr(&self.id.src)
    }

    pub fn dst_addr(&self) -> Option<IpAddr> {
        self.addr(&self.id.dst)
    }

    /// Loopback if either end is a loopback address (IPv4, IPv6, or
    /// IPv4-mapped), or if source equals destination. The last case covers
    /// connections on a local dummy/tap network whose ends differ by port only.
    pub fn is_loopback(&self) -> bool {
        let (src, dst) = (&self.id.src, &self.id.dst);

        match self.family as i32 {
            // Old kernels only fill the first four bytes for IPv4.
            libc::AF_INET => src[0] == 127 || dst[0] == 127 || src[..4] == dst[..4],
            libc::AF_INET6 => {
                let src6 = Ipv6Addr::from(*src);
                let dst6 = Ipv6Addr::from(*dst);
                let mapped_loopback =
                    |ip: &Ipv6Addr| ip.to_ipv4_mapped().is_some_and(|v4| v4.is_loopback());

                mapped_loopback(&src6)
                    || mapped_loopback(&dst6)
                    || src6.is_loopback()
                    || dst6.is_loopback()
                    || src == dst
            }
            _ => false,
        }
    }
}

/// The leading fields of struct tcp_info.
#[derive(Deserialize, Default, Debug, Clone, Copy)]
pub struct TcpInfo {
    pub state: u8,
    pub ca_state: u8,
    pub retransmits: u8,
    pub probes: u8,
    pub backoff: u8,
    pub options: u8,
    pub scales: u8,
    pub rate_limit_and_fast_open: u8,
    pub rto: u32,
    pub ato: u32,
    pub snd_mss: u32,
    pub rcv_mss: u32,
    pub unacked: u32,
    pub sacked: u32,
    pub lost: u32,
    pub retrans: u32,
    pub fackets: u32,
    pub last_data_send: u32,
    pub last_ack_sent: u32,
    pub last_data_recv: u32,
    pub last_ack_recv: u32,
    pub pmtu: u32,
    pub rcv_ssthresh: u32,
    pub rtt: u32,
    pub rttvar: u32,
    pub snd_ssthresh: u32,
    pub snd_cwnd: u32,
    pub advmss: u32,
    pub reordering: u32,
    pub rcv_rtt: u32,
    pub rcv_space: u32,
    pub total_retrans: u32,
}

/// A dumped TCP socket with the extensions the kernel attached to it.
#[derive(Default, Debug)]
pub struct InetDiagTcpResp {
    pub msg: SockDiag,
    pub tcp_info: Option<TcpInfo>,
    pub mark: Option<u32>,
}

impl TryFrom<&[u8]> for InetDiagTcpResp {
    type Error = Error;

    fn try_from(buf: &[u8]) -> Result<Self> {
        let msg = SockDiag::deserialize(buf)?;
        let mut resp = InetDiagTcpResp {
            msg,
            ..Default::default()
        };

        for attr in RouteAttrs::from(&buf[SockDiag::LEN..]) {
            match attr.header.rta_type as u8 {
                INET_DIAG_INFO => resp.tcp_info = bincode::deserialize(&attr.payload).ok(),
                INET_DIAG_MARK => resp.mark = attr.u32(),
                _ => {}
            }
        }

        Ok(resp)
    }
}

/// One sock_diag filter instruction. `yes`/`no` are byte offsets from the
/// start of the instruction; landing exactly on the end of the program
/// accepts the socket, landing past it rejects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BcOp {
    /// Always takes the `no` branch.
    Jmp { yes: u8, no: u16 },
    SourceCond {
        yes: u8,
        no: u16,
        family: u8,
        prefix_len: u8,
        port: i32,
        addr: Vec<u8>,
    },
    MarkCond {
        yes: u8,
        no: u16,
        mark: u32,
        mask: u32,
    },
}

const BC_OP_LEN: usize = 4;
const HOSTCOND_LEN: usize = 8;
const MARKCOND_LEN: usize = 8;

impl BcOp {
    pub fn len(&self) -> usize {
        match self {
            BcOp::Jmp { .. } => BC_OP_LEN,
            BcOp::SourceCond { addr, .. } => BC_OP_LEN + HOSTCOND_LEN + addr.len(),
            BcOp::MarkCond { .. } => BC_OP_LEN + MARKCOND_LEN,
        }
    }

    fn serialize_into(&self, buf: &mut Vec<u8>) {
        let (code, yes, no) = match self {
            BcOp::Jmp { yes, no } => (INET_DIAG_BC_JMP, *yes, *no),
            BcOp::SourceCond { yes, no, .. } => (INET_DIAG_BC_S_COND, *yes, *no),
            BcOp::MarkCond { yes, no, .. } => (INET_DIAG_BC_MARK_COND, *yes, *no),
        };
        buf.push(code);
        buf.push(yes);
        buf.extend_from_slice(&no.to_ne_bytes());

        match self {
            BcOp::Jmp { .. } => {}
            BcOp::SourceCond {
                family,
                prefix_len,
                port,
                addr,
                ..
            } => {
                buf.push(*family);
                buf.push(*prefix_len);
                buf.extend_from_slice(&[0, 0]);
                buf.extend_from_slice(&port.to_ne_bytes());
                buf.extend_from_slice(addr);
            }
            BcOp::MarkCond { mark, mask, .. } => {
                buf.extend_from_slice(&mark.to_ne_bytes());
                buf.extend_from_slice(&mask.to_ne_bytes());
            }
        }
    }
}

/// A sock_diag filter program, carried in an INET_DIAG_REQ_BYTECODE attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bytecode(pub Vec<BcOp>);

impl Bytecode {
    pub fn len(&self) -> usize {
        self.0.iter().map(BcOp::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn program(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.len());
        for op in &self.0 {
            op.serialize_into(&mut buf);
        }
        buf
    }

    pub fn to_attr(&self) -> Result<Vec<u8>> {
        RouteAttr::new(INET_DIAG_REQ_BYTECODE, &self.program()).serialize()
    }

    /// Accepts sockets whose source address is exactly `addr`, any port.
    /// IPv4 addresses in an AF_INET6 dump are matched in their mapped form.
    pub fn match_source(family: u8, addr: IpAddr) -> Result<Self> {
        let octets = match (addr, family as i32) {
            (IpAddr::V4(v4), libc::AF_INET) => v4.octets().to_vec(),
            (IpAddr::V4(v4), libc::AF_INET6) => v4.to_ipv6_mapped().octets().to_vec(),
            (IpAddr::V6(v6), libc::AF_INET6) => v6.octets().to_vec(),
            _ => return Err(Error::AddressFamily(addr.to_string())),
        };

        let yes = (BC_OP_LEN + HOSTCOND_LEN + octets.len()) as u8;
        Ok(Self(vec![BcOp::SourceCond {
            yes,
            no: yes as u16 + 4,
            family,
            prefix_len: (octets.len() * 8) as u8,
            port: -1,
            addr: octets,
        }]))
    }

    /// Accepts the live sockets on `net_id` that must go when the network
    /// starts requiring `permission`: those not explicitly selected, or
    /// explicitly selected without the permission bits.
    ///
    /// The trailing JMP never accepts anything but must stay: the verifier
    /// requires every `no` target to also be reachable through `yes` jumps,
    /// and rejects the two-instruction form.
    pub fn lacking_permission(net_id: u32, permission: Permission) -> Self {
        let net_id_mark = Fwmark {
            net_id,
            ..Default::default()
        };
        let control = Fwmark {
            explicitly_selected: true,
            permission,
            ..Default::default()
        };

        let matchlen = (BC_OP_LEN + MARKCOND_LEN) as u8;
        let jmplen = BC_OP_LEN as u8;
        let reject = (2 * matchlen + jmplen) as u16 + 4;

        Self(vec![
            // netId differs: reject.
            BcOp::MarkCond {
                yes: matchlen,
                no: reject,
                mark: net_id_mark.int_value(),
                mask: FWMARK_NET_ID_MASK,
            },
            // Explicit with the permission: on to the JMP, which rejects.
            // Otherwise: jump to the end and accept.
            BcOp::MarkCond {
                yes: matchlen,
                no: (matchlen + jmplen) as u16,
                mark: control.int_value(),
                mask: control.int_value(),
            },
            BcOp::Jmp {
                yes: jmplen,
                no: jmplen as u16 + 4,
            },
        ])
    }
}
