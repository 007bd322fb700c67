pub mod fwmark;
pub mod link;
pub mod message;
pub mod route;
pub mod rule;
pub mod sock_diag;
pub mod uid_range;
