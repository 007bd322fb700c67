use std::ops::Deref;

use crate::{
    core::message::Message,
    error::Result,
    types::{link::IfInfoMessage, message::Attribute},
};

use super::handle::Netlink;

pub struct LinkHandle<'a> {
    pub netlink: &'a dyn Netlink,
}

impl<'a> Deref for LinkHandle<'a> {
    type Target = dyn Netlink + 'a;

    fn deref(&self) -> &Self::Target {
        self.netlink
    }
}

impl<'a> From<&'a dyn Netlink> for LinkHandle<'a> {
    fn from(netlink: &'a dyn Netlink) -> Self {
        Self { netlink }
    }
}

impl LinkHandle<'_> {
    pub fn up(&self, index: u32) -> Result<()> {
        let mut req = Message::new(libc::RTM_NEWLINK, libc::NLM_F_ACK);
        req.add(&IfInfoMessage::up(index).serialize()?);

        self.request(&mut req, 0)?;
        Ok(())
    }
}
