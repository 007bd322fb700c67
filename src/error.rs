use nix::errno::Errno;
use thiserror::Error;

use crate::types::rule::RuleBuilderError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the routing engine and the socket-diagnosis engine.
///
/// Every variant maps to an errno through [`Error::errno`]; callers that speak
/// the daemon's integer contract use [`Error::code`].
#[derive(Error, Debug)]
pub enum Error {
    #[error("mask {mask:#x} does not select all the bits set in fwmark {fwmark:#x}")]
    MarkOutsideMask { fwmark: u32, mask: u32 },

    #[error("incompatible start and end UIDs ({start} vs {end})")]
    UidRangeMismatch { start: u32, end: u32 },

    #[error("RT_TABLE_UNSPEC only allowed when deleting rules")]
    UnspecifiedTable,

    #[error("interface name too long ({0} > 16)")]
    InterfaceNameTooLong(usize),

    #[error("cannot find interface {0}")]
    NoSuchInterface(String),

    #[error("no route table for interface {0}")]
    NoRouteTable(String),

    #[error("invalid prefix {0}")]
    InvalidPrefix(String),

    #[error("invalid nexthop {0}")]
    InvalidNexthop(String),

    #[error("invalid address {0}")]
    InvalidAddress(String),

    #[error("invalid uid range {0}")]
    InvalidUidRange(String),

    #[error("address family not supported: {0}")]
    AddressFamily(String),

    #[error("iptables command failed: {0}")]
    Iptables(String),

    #[error("sock_diag sockets not open")]
    NotOpen,

    #[error("sock_diag sockets already open")]
    AlreadyOpen,

    #[error("no such netId {0}")]
    NoSuchNetwork(u32),

    #[error("invalid netId {0}")]
    InvalidNetId(u32),

    #[error("duplicate netId {0}")]
    DuplicateNetwork(u32),

    #[error("no free netId")]
    NoFreeNetId,

    #[error("cannot find previously set default network with netId {0}")]
    StaleDefault(u32),

    #[error("uid {uid} may not use netId {net_id}")]
    NotPermitted { uid: u32, net_id: u32 },

    #[error("uid {uid} lacks the permission netId {net_id} requires")]
    AccessDenied { uid: u32, net_id: u32 },

    #[error("peer uid unknown")]
    UnknownUid,

    #[error("interface {interface} already assigned to netId {net_id}")]
    InterfaceBusy { interface: String, net_id: u32 },

    #[error("interface {interface} not assigned to netId {net_id}")]
    InterfaceNotInNetwork { interface: String, net_id: u32 },

    #[error("{0}")]
    InvalidOperation(String),

    #[error("malformed netlink message: {0}")]
    Malformed(String),

    #[error("netlink: {0}")]
    Kernel(Errno),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub const IFNAMSIZ: usize = libc::IFNAMSIZ;

impl Error {
    pub fn errno(&self) -> Errno {
        match self {
            Error::MarkOutsideMask { .. } => Errno::ERANGE,
            Error::UidRangeMismatch { .. } => Errno::EUSERS,
            Error::UnspecifiedTable => Errno::ENOTUNIQ,
            Error::InterfaceNameTooLong(_) => Errno::ENAMETOOLONG,
            Error::NoSuchInterface(_) => Errno::ENODEV,
            Error::NoRouteTable(_) => Errno::ESRCH,
            Error::InvalidPrefix(_)
            | Error::InvalidNexthop(_)
            | Error::InvalidAddress(_)
            | Error::InvalidUidRange(_) => {
                Errno::EINVAL
            }
            Error::AddressFamily(_) => Errno::EAFNOSUPPORT,
            Error::Iptables(_) => Errno::EREMOTEIO,
            Error::NotOpen => Errno::EBADFD,
            Error::AlreadyOpen => Errno::EALREADY,
            Error::NoSuchNetwork(_) | Error::NoFreeNetId => Errno::ENONET,
            Error::InvalidNetId(_) | Error::InvalidOperation(_) => Errno::EINVAL,
            Error::DuplicateNetwork(_) => Errno::EEXIST,
            Error::StaleDefault(_) => Errno::ESRCH,
            Error::NotPermitted { .. } => Errno::EPERM,
            Error::AccessDenied { .. } => Errno::EACCES,
            Error::UnknownUid => Errno::EREMOTEIO,
            Error::InterfaceBusy { .. } => Errno::EBUSY,
            Error::InterfaceNotInNetwork { .. } => Errno::ENOENT,
            Error::Malformed(_) => Errno::EBADMSG,
            Error::Kernel(errno) => *errno,
            Error::Io(err) => err.raw_os_error().map_or(Errno::EIO, Errno::from_raw),
        }
    }

    /// Negative errno, the value the RPC layer reports to its callers.
    pub fn code(&self) -> i32 {
        -(self.errno() as i32)
    }

    pub fn is(&self, errno: Errno) -> bool {
        self.errno() == errno
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Kernel(errno)
    }
}

impl From<RuleBuilderError> for Error {
    fn from(err: RuleBuilderError) -> Self {
        Error::InvalidOperation(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Malformed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let err = Error::MarkOutsideMask {
            fwmark: 0x3,
            mask: 0x1,
        };
        assert_eq!(err.code(), -libc::ERANGE);
        assert_eq!(Error::NoRouteTable("wlan0".into()).code(), -libc::ESRCH);
        assert_eq!(Error::Kernel(Errno::EEXIST).code(), -libc::EEXIST);
        assert!(Error::Kernel(Errno::ENOENT).is(Errno::ENOENT));
    }

    #[test]
    fn test_io_error_keeps_os_errno() {
        let err = Error::from(std::io::Error::from_raw_os_error(libc::EPERM));
        assert_eq!(err.errno(), Errno::EPERM);
        assert_eq!(err.code(), -libc::EPERM);

        let err = Error::from(std::io::Error::new(std::io::ErrorKind::Other, "pipe"));
        assert_eq!(err.errno(), Errno::EIO);
    }
}
