use std::ops::Deref;

use nix::errno::Errno;
use tracing::error;

use crate::{
    core::message::Message,
    error::Result,
    types::{
        message::{Attribute, RouteMessage},
        rule::{Rule, RulePriority, FRA_PRIORITY},
    },
};

use super::handle::{flush, Netlink, FAMILIES};

pub struct RuleHandle<'a> {
    pub netlink: &'a dyn Netlink,
}

impl<'a> Deref for RuleHandle<'a> {
    type Target = dyn Netlink + 'a;

    fn deref(&self) -> &Self::Target {
        self.netlink
    }
}

impl<'a> From<&'a dyn Netlink> for RuleHandle<'a> {
    fn from(netlink: &'a dyn Netlink) -> Self {
        Self { netlink }
    }
}

impl RuleHandle<'_> {
    /// Sends the rule for IPv4 and then IPv6, stopping at the first failure.
    fn handle(&self, rule: &Rule, proto: u16, flags: i32) -> Result<()> {
        let deleting = proto == libc::RTM_DELRULE;
        rule.validate(deleting)?;

        let attrs = rule.attributes();

        for family in FAMILIES {
            let mut req = Message::new(proto, flags);
            req.add(&rule.header(family).serialize()?);
            for attr in &attrs {
                req.add(&attr.serialize()?);
            }

            if let Err(e) = self.request(&mut req, 0) {
                // Tethering rules are deleted blindly on teardown.
                let quiet = deleting
                    && rule.priority == RulePriority::Tethering as u32
                    && e.is(Errno::ENOENT);
                if !quiet {
                    error!(
                        "Error {} IPv{} rule: {}",
                        if deleting { "removing" } else { "adding" },
                        if family == libc::AF_INET as u8 { 4 } else { 6 },
                        e
                    );
                }
                return Err(e);
            }
        }

        Ok(())
    }

    /// Duplicates are not an error: policy changes install the new rule
    /// before removing the old one, and the two may be identical.
    pub fn add(&self, rule: &Rule) -> Result<()> {
        self.handle(
            rule,
            libc::RTM_NEWRULE,
            libc::NLM_F_ACK | libc::NLM_F_CREATE,
        )
    }

    pub fn del(&self, rule: &Rule) -> Result<()> {
        self.handle(rule, libc::RTM_DELRULE, libc::NLM_F_ACK)
    }

    /// Deletes every rule in both families except those at priority 0.
    pub fn flush(&self) -> Result<()> {
        flush(
            self.netlink,
            libc::RTM_GETRULE,
            libc::RTM_DELRULE,
            "rules",
            |payload| {
                let Ok((_, attrs)) = RouteMessage::parse(payload) else {
                    return false;
                };
                let priority = attrs.get(FRA_PRIORITY).and_then(|a| a.u32()).unwrap_or(0);
                priority != 0
            },
        )
    }
}
