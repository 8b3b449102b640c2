/// Periodic broadcast of this node's name claim.
///
/// Re-announcing an unchanged name is what keeps the entry alive in every
/// peer's directory, so the announcer fires on its fixed period regardless
/// of other traffic.
use core::fmt;

use crate::comm;
use crate::protocol::MsgBuffer;
use crate::transport::{MeshTransport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceError {
    /// Announcement did not fit the message buffer
    Encode,
    Transport(TransportError),
}

impl fmt::Display for AnnounceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnnounceError::Encode => f.write_str("announcement encoding failed"),
            AnnounceError::Transport(e) => write!(f, "announcement broadcast failed: {}", e),
        }
    }
}

impl From<TransportError> for AnnounceError {
    fn from(e: TransportError) -> Self {
        AnnounceError::Transport(e)
    }
}

pub struct DirectoryAnnouncer {
    interval_ms: u64,
    /// `None` until the first announcement; the first tick fires immediately
    next_due: Option<u64>,
    /// Set once the empty-name warning has been logged
    warned_empty: bool,
    sent: u32,
}

impl DirectoryAnnouncer {
    pub const fn new(interval_ms: u64) -> Self {
        Self {
            interval_ms,
            next_due: None,
            warned_empty: false,
            sent: 0,
        }
    }

    /// Announce `name` if the period has elapsed.
    ///
    /// Returns `Ok(true)` when an announcement was broadcast. An empty name
    /// is a configuration gap, not a failure: nothing is sent. A failed
    /// broadcast is not retried before the next period.
    pub fn on_timer_tick<T: MeshTransport>(
        &mut self,
        now: u64,
        name: &str,
        transport: &mut T,
    ) -> Result<bool, AnnounceError> {
        if name.is_empty() {
            if !self.warned_empty {
                log::warn!("No node name assigned, not announcing");
                self.warned_empty = true;
            }
            return Ok(false);
        }
        if matches!(self.next_due, Some(due) if now < due) {
            return Ok(false);
        }
        self.next_due = Some(now.saturating_add(self.interval_ms));

        let mut buf = MsgBuffer::new();
        comm::encode_announcement(name, &mut buf).ok_or(AnnounceError::Encode)?;
        transport.broadcast(&buf).map_err(|e| {
            log::warn!("Name broadcast failed: {}", e);
            AnnounceError::Transport(e)
        })?;

        self.sent = self.sent.wrapping_add(1);
        log::debug!("Announced name '{}'", name);
        Ok(true)
    }

    /// Announce at the next tick, e.g. after the name changed.
    pub fn reset(&mut self) {
        self.next_due = None;
        self.warned_empty = false;
    }

    pub fn announcements(&self) -> u32 {
        self.sent
    }

    pub fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}
