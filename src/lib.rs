//! Policy routing and socket teardown for a host attached to several
//! networks at once.
//!
//! [`network::controller::NetworkController`] tracks networks and users;
//! [`controller::RouteController`] turns each change into kernel rules and
//! routes over rtnetlink; [`handle::sock_diag::SockDiagHandle`] destroys
//! sockets that must not survive it.

pub mod config;
pub mod controller;
pub mod core;
pub mod error;
pub mod handle;
pub mod network;
pub mod types;

#[cfg(test)]
mod testutil;
