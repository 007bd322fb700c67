use std::collections::BTreeSet;

use tracing::error;

use crate::{controller::RouteController, error::Result};

use super::{invalid, unchanged};

/// Directly connected networks without internet access, routed through the
/// local_network table.
#[derive(Debug)]
pub struct LocalNetwork {
    net_id: u32,
    interfaces: BTreeSet<String>,
}

impl LocalNetwork {
    pub fn new(net_id: u32) -> Self {
        Self {
            net_id,
            interfaces: BTreeSet::new(),
        }
    }

    pub fn net_id(&self) -> u32 {
        self.net_id
    }

    pub fn interfaces(&self) -> &BTreeSet<String> {
        &self.interfaces
    }

    pub fn add_interface(&mut self, routes: &RouteController, interface: &str) -> Result<()> {
        if unchanged(&self.interfaces, interface, true) {
            return Ok(());
        }

        routes
            .add_interface_to_local_network(self.net_id, interface)
            .map_err(|e| {
                error!("failed to add interface {} to local netId {}: {}", interface, self.net_id, e);
                e
            })?;

        self.interfaces.insert(interface.to_string());
        Ok(())
    }

    pub fn remove_interface(&mut self, routes: &RouteController, interface: &str) -> Result<()> {
        if unchanged(&self.interfaces, interface, false) {
            return Ok(());
        }

        routes
            .remove_interface_from_local_network(self.net_id, interface)
            .map_err(|e| {
                error!(
                    "failed to remove interface {} from local netId {}: {}",
                    interface, self.net_id, e
                );
                e
            })?;

        self.interfaces.remove(interface);
        Ok(())
    }
}

/// The network whose only interface is the dummy one configured at startup.
/// Its membership is fixed.
#[derive(Debug)]
pub struct DummyNetwork {
    net_id: u32,
    interfaces: BTreeSet<String>,
}

impl DummyNetwork {
    pub fn new(net_id: u32, interface: &str) -> Self {
        Self {
            net_id,
            interfaces: BTreeSet::from([interface.to_string()]),
        }
    }

    pub fn net_id(&self) -> u32 {
        self.net_id
    }

    pub fn interfaces(&self) -> &BTreeSet<String> {
        &self.interfaces
    }

    pub fn add_interface(&mut self, _interface: &str) -> Result<()> {
        Err(invalid("cannot add interfaces to the dummy network"))
    }

    pub fn remove_interface(&mut self, _interface: &str) -> Result<()> {
        Err(invalid("cannot remove interfaces from the dummy network"))
    }
}
