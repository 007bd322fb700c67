pub mod handle;
pub mod link;
pub mod route;
pub mod rule;
pub mod sock_diag;
