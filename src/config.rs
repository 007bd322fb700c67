use std::path::PathBuf;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Daemon-wide routing constants.
#[derive(Builder, Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[builder(default)]
#[serde(default)]
pub struct Config {
    /// Diagnostic file mapping table ids to names, rewritten on every change.
    #[builder(setter(into))]
    pub table_names_path: PathBuf,
    /// Added to an interface's ifindex to get its route table.
    pub table_offset: u32,
    pub local_net_id: u32,
    pub dummy_net_id: u32,
    #[builder(setter(into))]
    pub dummy_interface: String,
    /// Users allowed to protect their sockets from VPNs.
    pub protectable_users: Vec<u32>,
    /// Users below this uid get SYSTEM permission unless told otherwise.
    pub first_application_uid: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            table_names_path: PathBuf::from("/data/misc/net/rt_tables"),
            table_offset: 1000,
            local_net_id: 99,
            dummy_net_id: 51,
            dummy_interface: "dummy0".to_string(),
            protectable_users: vec![1016],
            first_application_uid: 10000,
        }
    }
}
