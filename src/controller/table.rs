use std::{
    collections::BTreeMap,
    fmt::Write as _,
    fs,
    os::unix::fs::PermissionsExt,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use nix::net::if_::if_nametoindex;
use tracing::error;

use crate::{
    config::Config,
    error::{Error, Result},
};

pub const ROUTE_TABLE_LOCAL_NETWORK: u32 = 97;
pub const ROUTE_TABLE_LEGACY_NETWORK: u32 = 98;
pub const ROUTE_TABLE_LEGACY_SYSTEM: u32 = 99;

const FIXED_TABLES: [(u32, &str); 5] = [
    (libc::RT_TABLE_LOCAL as u32, "local"),
    (libc::RT_TABLE_MAIN as u32, "main"),
    (ROUTE_TABLE_LOCAL_NETWORK, "local_network"),
    (ROUTE_TABLE_LEGACY_NETWORK, "legacy_network"),
    (ROUTE_TABLE_LEGACY_SYSTEM, "legacy_system"),
];

/// Resolves interface names to kernel ifindexes.
pub trait InterfaceIndex: Send + Sync {
    /// `None` when the interface does not exist (any more).
    fn index(&self, name: &str) -> Option<u32>;
}

impl<T: InterfaceIndex + ?Sized> InterfaceIndex for Arc<T> {
    fn index(&self, name: &str) -> Option<u32> {
        (**self).index(name)
    }
}

/// if_nametoindex(3).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInterfaces;

impl InterfaceIndex for SystemInterfaces {
    fn index(&self, name: &str) -> Option<u32> {
        if_nametoindex(name).ok().filter(|index| *index != 0)
    }
}

/// The interface → route table registry.
///
/// A table is `ifindex + offset`, recorded on first use. The entry outlives
/// the interface so rules and routes can still be deleted after it goes away,
/// and is dropped only once a route flush of the table has succeeded.
pub struct RouteTables {
    interfaces: Box<dyn InterfaceIndex>,
    offset: u32,
    names_path: PathBuf,
    tables: Mutex<BTreeMap<String, u32>>,
}

impl RouteTables {
    pub fn new(config: &Config, interfaces: Box<dyn InterfaceIndex>) -> Self {
        Self {
            interfaces,
            offset: config.table_offset,
            names_path: config.table_names_path.clone(),
            tables: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, u32>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn ifindex(&self, interface: &str) -> Option<u32> {
        self.interfaces.index(interface)
    }

    pub fn table_for_interface(&self, interface: &str) -> Result<u32> {
        let mut tables = self.lock();

        if let Some(index) = self.interfaces.index(interface) {
            let table = index + self.offset;
            tables.insert(interface.to_string(), table);
            return Ok(table);
        }

        tables.get(interface).copied().ok_or_else(|| {
            error!("cannot find interface {}", interface);
            Error::NoRouteTable(interface.to_string())
        })
    }

    /// The ifindex the interface had when last seen, or 0.
    pub fn if_index(&self, interface: &str) -> u32 {
        self.lock()
            .get(interface)
            .map_or(0, |table| table.saturating_sub(self.offset))
    }

    pub fn forget(&self, interface: &str) {
        self.lock().remove(interface);
    }

    pub fn table_names(&self) -> String {
        let mut contents = String::new();

        for (table, name) in FIXED_TABLES {
            let _ = writeln!(contents, "{} {}", table, name);
        }
        for (name, table) in self.lock().iter() {
            let _ = writeln!(contents, "{} {}", table, name);
        }

        contents
    }

    /// Rewrites the table names file; failures are logged only.
    pub fn update_table_names_file(&self) {
        let contents = self.table_names();

        let written = fs::write(&self.names_path, contents).and_then(|_| {
            fs::set_permissions(&self.names_path, fs::Permissions::from_mode(0o644))
        });
        if let Err(e) = written {
            error!(
                "failed to write {}: {}",
                self.names_path.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::testutil::StaticInterfaces;

    use super::*;

    fn tables(interfaces: &Arc<StaticInterfaces>) -> RouteTables {
        RouteTables::new(&Config::default(), Box::new(interfaces.clone()))
    }

    #[test]
    fn test_table_allocation_is_stable() {
        let interfaces = Arc::new(StaticInterfaces::new(&[("wlan0", 5)]));
        let tables = tables(&interfaces);

        assert_eq!(tables.table_for_interface("wlan0").unwrap(), 1005);
        assert_eq!(tables.table_for_interface("wlan0").unwrap(), 1005);
        assert_eq!(tables.if_index("wlan0"), 5);
    }

    #[test]
    fn test_table_survives_interface_removal() {
        let interfaces = Arc::new(StaticInterfaces::new(&[("rmnet0", 7)]));
        let tables = tables(&interfaces);

        assert_eq!(tables.table_for_interface("rmnet0").unwrap(), 1007);
        interfaces.remove("rmnet0");
        assert_eq!(tables.table_for_interface("rmnet0").unwrap(), 1007);

        tables.forget("rmnet0");
        let err = tables.table_for_interface("rmnet0").unwrap_err();
        assert_eq!(err.code(), -libc::ESRCH);
        assert_eq!(tables.if_index("rmnet0"), 0);
    }

    #[test]
    fn test_table_follows_new_ifindex() {
        let interfaces = Arc::new(StaticInterfaces::new(&[("eth0", 3)]));
        let tables = tables(&interfaces);

        assert_eq!(tables.table_for_interface("eth0").unwrap(), 1003);
        interfaces.set("eth0", 9);
        assert_eq!(tables.table_for_interface("eth0").unwrap(), 1009);
    }

    #[test]
    fn test_table_names_file() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("rt_tables.{}", std::process::id()));
        let config = Config {
            table_names_path: path.clone(),
            ..Default::default()
        };
        let interfaces = Arc::new(StaticInterfaces::new(&[("wlan0", 5), ("eth0", 2)]));
        let tables = RouteTables::new(&config, Box::new(interfaces.clone()));

        tables.table_for_interface("wlan0")?;
        tables.table_for_interface("eth0")?;
        tables.update_table_names_file();

        let contents = fs::read_to_string(&path)?;
        assert_eq!(
            contents,
            "255 local\n254 main\n97 local_network\n98 legacy_network\n99 legacy_system\n\
             1002 eth0\n1005 wlan0\n"
        );
        assert_eq!(fs::metadata(&path)?.permissions().mode() & 0o777, 0o644);

        fs::remove_file(&path)?;
        Ok(())
    }

    #[test]
    fn test_table_names_write_failure_is_not_fatal() {
        let config = Config {
            table_names_path: PathBuf::from("/nonexistent/dir/rt_tables"),
            ..Default::default()
        };
        let tables = RouteTables::new(&config, Box::new(SystemInterfaces));
        tables.update_table_names_file();
    }
}
