use std::{
    io::Write,
    process::{Command, Stdio},
};

use tracing::debug;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IptablesTarget {
    V4,
    V6,
    V4V6,
}

/// Runs iptables-restore input against the packet filter.
pub trait IptablesRestore: Send + Sync {
    fn exec(&self, target: IptablesTarget, table: &str, command: &str) -> Result<()>;
}

/// Pipes each command into `iptables-restore --noflush` and/or
/// `ip6tables-restore --noflush`.
#[derive(Debug, Default, Clone, Copy)]
pub struct IptablesRestoreProcess;

impl IptablesRestoreProcess {
    fn run(binary: &str, input: &str) -> Result<()> {
        let mut child = Command::new(binary)
            .args(["--noflush", "-w"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes())?;
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(Error::Iptables(format!("{} exited with {}", binary, status)));
        }
        Ok(())
    }
}

impl IptablesRestore for IptablesRestoreProcess {
    fn exec(&self, target: IptablesTarget, table: &str, command: &str) -> Result<()> {
        let input = format!("*{}\n{}\nCOMMIT\n", table, command);
        debug!("iptables-restore {:?}: {}", target, command);

        let binaries: &[&str] = match target {
            IptablesTarget::V4 => &["iptables-restore"],
            IptablesTarget::V6 => &["ip6tables-restore"],
            IptablesTarget::V4V6 => &["iptables-restore", "ip6tables-restore"],
        };

        for binary in binaries {
            Self::run(binary, &input)?;
        }
        Ok(())
    }
}
