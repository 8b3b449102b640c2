/// Inbound payload demultiplexer.
///
/// Directory announcements are transport plumbing: they update the
/// [`NodeDirectory`] and are never shown to the application. Everything
/// else is handed to the registered [`ReceiveHandler`] together with the
/// sender's name, or its decimal address when the sender has not announced
/// itself yet.
use core::fmt::Write;

use crate::comm;
use crate::config;
use crate::directory::{AnnounceOutcome, NodeDirectory};
use crate::protocol::{NodeAddress, NodeName};

/// Application-level receiver for non-directory payloads.
pub trait ReceiveHandler {
    fn on_message(&mut self, sender: &str, payload: &[u8]);
}

impl<F> ReceiveHandler for F
where
    F: FnMut(&str, &[u8]),
{
    fn on_message(&mut self, sender: &str, payload: &[u8]) {
        self(sender, payload)
    }
}

/// Where an inbound payload went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    /// Directory announcement applied
    Directory(AnnounceOutcome),
    /// Directory announcement with an unusable name; dropped
    InvalidClaim,
    /// Handed to the receive handler
    Delivered,
}

pub struct MessageRouter<H> {
    handler: H,
    delivered: u32,
    directory_updates: u32,
}

impl<H: ReceiveHandler> MessageRouter<H> {
    pub const fn new(handler: H) -> Self {
        Self {
            handler,
            delivered: 0,
            directory_updates: 0,
        }
    }

    /// Dispatch one payload received from `from` at `now`.
    pub fn route(
        &mut self,
        from: NodeAddress,
        payload: &[u8],
        directory: &mut NodeDirectory,
        now: u64,
    ) -> Routed {
        if let Some(claimed) = comm::decode_announcement(payload) {
            return match config::node_name(claimed) {
                Ok(name) => {
                    self.directory_updates = self.directory_updates.wrapping_add(1);
                    Routed::Directory(directory.on_announcement(from, &name, now))
                }
                Err(e) => {
                    log::warn!("Ignoring name claim from {}: {}", from, e);
                    Routed::InvalidClaim
                }
            };
        }

        let sender = sender_label(directory, from);
        log::trace!("{} bytes from '{}'", payload.len(), sender);
        self.handler.on_message(&sender, payload);
        self.delivered = self.delivered.wrapping_add(1);
        Routed::Delivered
    }

    pub fn delivered(&self) -> u32 {
        self.delivered
    }

    pub fn directory_updates(&self) -> u32 {
        self.directory_updates
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }
}

/// Directory name of `address`, or its decimal form if unknown.
pub fn sender_label(directory: &NodeDirectory, address: NodeAddress) -> NodeName {
    if let Some(name) = directory.reverse_resolve(address) {
        return name.clone();
    }
    let mut label = NodeName::new();
    // u32::MAX is 10 digits, always fits
    let _ = write!(label, "{}", address);
    label
}
