/// Name directory: transient mesh addresses ↔ provisioned node names.
///
/// Populated purely from announcements heard on the mesh and never
/// persisted, so every restart rebuilds it from broadcast traffic. Holds at
/// most one entry per address and one per name; on a name collision the most
/// recently heard claim wins unless the current holder was refreshed inside
/// the configured grace window.
///
/// Capacity is fixed at [`MAX_NODES`]; lookups scan at most that many
/// entries.
use heapless::Vec;

use crate::protocol::{NodeAddress, NodeListing, NodeName};

/// Maximum number of directory entries
pub const MAX_NODES: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub address: NodeAddress,
    pub name: NodeName,
    /// Time of the last announcement from this address, in ms
    pub last_seen: u64,
}

/// What an announcement did to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    /// First announcement from this address
    Added,
    /// Same address, same name; liveness refreshed
    Refreshed,
    /// Known address now claims a different name
    Renamed,
    /// Name taken over from `evicted`, whose entry was removed
    Superseded { evicted: NodeAddress },
    /// `holder` was refreshed within the grace window and keeps the name
    Rejected { holder: NodeAddress },
}

pub struct NodeDirectory {
    entries: Vec<DirectoryEntry, MAX_NODES>,
    grace_ms: u64,
}

impl NodeDirectory {
    /// `grace_ms` is the anti-flap window: a name refreshed by its holder
    /// less than `grace_ms` ago cannot be claimed by another address.
    pub const fn new(grace_ms: u64) -> Self {
        Self {
            entries: Vec::new(),
            grace_ms,
        }
    }

    /// Record that `from` claims `name` at `now`.
    pub fn on_announcement(&mut self, from: NodeAddress, name: &NodeName, now: u64) -> AnnounceOutcome {
        // Resolve a collision with another holder of the name first.
        let mut evicted = None;
        if let Some(idx) = self.index_of_name(name) {
            let holder = &self.entries[idx];
            if holder.address != from {
                if now.saturating_sub(holder.last_seen) < self.grace_ms {
                    let holder = holder.address;
                    log::warn!(
                        "Name '{}' claimed by {} but held by {}, keeping holder",
                        name,
                        from,
                        holder
                    );
                    // The claimant is still alive even though it lost the name.
                    if let Some(own) = self.entries.iter_mut().find(|e| e.address == from) {
                        own.last_seen = now;
                    }
                    return AnnounceOutcome::Rejected { holder };
                }
                let old = self.entries.swap_remove(idx);
                log::info!("Name '{}' moved from {} to {}", name, old.address, from);
                evicted = Some(old.address);
            }
        }

        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == from) {
            entry.last_seen = now;
            if entry.name == *name {
                return AnnounceOutcome::Refreshed;
            }
            log::info!("Node {} renamed '{}' -> '{}'", from, entry.name, name);
            entry.name = name.clone();
            return match evicted {
                Some(evicted) => AnnounceOutcome::Superseded { evicted },
                None => AnnounceOutcome::Renamed,
            };
        }

        let entry = DirectoryEntry {
            address: from,
            name: name.clone(),
            last_seen: now,
        };
        if let Err(entry) = self.entries.push(entry) {
            if let Some(idx) = self.stalest() {
                log::warn!(
                    "Directory full, evicting '{}' ({})",
                    self.entries[idx].name,
                    self.entries[idx].address
                );
                self.entries[idx] = entry;
            }
        }
        log::debug!("Node '{}' is at {}", name, from);

        match evicted {
            Some(evicted) => AnnounceOutcome::Superseded { evicted },
            None => AnnounceOutcome::Added,
        }
    }

    /// Current address of `name`.
    pub fn resolve(&self, name: &str) -> Option<NodeAddress> {
        self.entries
            .iter()
            .find(|e| e.name.as_str() == name)
            .map(|e| e.address)
    }

    /// Name currently bound to `address`.
    pub fn reverse_resolve(&self, address: NodeAddress) -> Option<&NodeName> {
        self.entries
            .iter()
            .find(|e| e.address == address)
            .map(|e| &e.name)
    }

    /// Remove the entry of an address the transport reports gone.
    pub fn on_disconnect(&mut self, address: NodeAddress) -> bool {
        match self.entries.iter().position(|e| e.address == address) {
            Some(idx) => {
                let gone = self.entries.swap_remove(idx);
                log::info!("Node '{}' ({}) disconnected", gone.name, address);
                true
            }
            None => false,
        }
    }

    /// Purge entries not refreshed within `max_age_ms` of `now`. Returns the
    /// number removed.
    pub fn expire(&mut self, now: u64, max_age_ms: u64) -> usize {
        let cutoff = now.saturating_sub(max_age_ms);
        let before = self.entries.len();
        self.entries.retain(|e| {
            let keep = e.last_seen >= cutoff;
            if !keep {
                log::info!("Node '{}' ({}) expired", e.name, e.address);
            }
            keep
        });
        before - self.entries.len()
    }

    /// Snapshot of the names currently in the directory.
    pub fn list_connected(&self) -> Vec<NodeName, MAX_NODES> {
        self.entries.iter().map(|e| e.name.clone()).collect()
    }

    /// Directory rows for the serial console, ages in seconds.
    pub fn listing(&self, now: u64) -> Vec<NodeListing, MAX_NODES> {
        self.entries
            .iter()
            .map(|e| NodeListing {
                name: e.name.clone(),
                addr: e.address,
                age: (now.saturating_sub(e.last_seen) / 1000) as u32,
            })
            .collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &DirectoryEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn index_of_name(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.name.as_str() == name)
    }

    fn stalest(&self) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.last_seen)
            .map(|(idx, _)| idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> NodeName {
        NodeName::try_from(s).unwrap()
    }

    fn entries_named(dir: &NodeDirectory, n: &str) -> usize {
        dir.entries().filter(|e| e.name.as_str() == n).count()
    }

    // ── Announcements ───────────────────────────────────────────────

    #[test]
    fn repeat_announcement_refreshes() {
        let mut dir = NodeDirectory::new(0);
        assert_eq!(
            dir.on_announcement(NodeAddress(5), &name("A"), 0),
            AnnounceOutcome::Added
        );
        assert_eq!(
            dir.on_announcement(NodeAddress(5), &name("A"), 10),
            AnnounceOutcome::Refreshed
        );
        assert_eq!(dir.resolve("A"), Some(NodeAddress(5)));
        assert_eq!(entries_named(&dir, "A"), 1);
        assert_eq!(dir.entries().next().unwrap().last_seen, 10);
    }

    #[test]
    fn fresher_claim_takes_over_name() {
        let mut dir = NodeDirectory::new(0);
        dir.on_announcement(NodeAddress(5), &name("A"), 0);
        assert_eq!(
            dir.on_announcement(NodeAddress(6), &name("A"), 100),
            AnnounceOutcome::Superseded {
                evicted: NodeAddress(5)
            }
        );
        assert_eq!(dir.resolve("A"), Some(NodeAddress(6)));
        assert_eq!(dir.reverse_resolve(NodeAddress(5)), None);
        assert_eq!(dir.reverse_resolve(NodeAddress(6)).map(|n| n.as_str()), Some("A"));
        assert_eq!(entries_named(&dir, "A"), 1);
    }

    #[test]
    fn claim_inside_grace_window_rejected() {
        let mut dir = NodeDirectory::new(1_000);
        dir.on_announcement(NodeAddress(5), &name("A"), 0);
        assert_eq!(
            dir.on_announcement(NodeAddress(6), &name("A"), 500),
            AnnounceOutcome::Rejected {
                holder: NodeAddress(5)
            }
        );
        assert_eq!(dir.resolve("A"), Some(NodeAddress(5)));
        assert_eq!(dir.reverse_resolve(NodeAddress(6)), None);
    }

    #[test]
    fn rejected_claim_still_refreshes_claimant() {
        let mut dir = NodeDirectory::new(1_000);
        dir.on_announcement(NodeAddress(6), &name("B"), 0);
        for now in [100, 600, 1_000] {
            dir.on_announcement(NodeAddress(5), &name("A"), now);
            assert_eq!(
                dir.on_announcement(NodeAddress(6), &name("A"), now + 50),
                AnnounceOutcome::Rejected {
                    holder: NodeAddress(5)
                }
            );
        }
        assert_eq!(dir.expire(1_500, 1_000), 0);
        assert_eq!(dir.resolve("B"), Some(NodeAddress(6)));
        let claimant = dir.entries().find(|e| e.address == NodeAddress(6)).unwrap();
        assert_eq!(claimant.last_seen, 1_050);
    }

    #[test]
    fn claim_after_grace_window_wins() {
        let mut dir = NodeDirectory::new(1_000);
        dir.on_announcement(NodeAddress(5), &name("A"), 0);
        assert!(matches!(
            dir.on_announcement(NodeAddress(6), &name("A"), 1_000),
            AnnounceOutcome::Superseded { .. }
        ));
        assert_eq!(dir.resolve("A"), Some(NodeAddress(6)));
    }

    #[test]
    fn known_address_renames() {
        let mut dir = NodeDirectory::new(0);
        dir.on_announcement(NodeAddress(5), &name("A"), 0);
        assert_eq!(
            dir.on_announcement(NodeAddress(5), &name("B"), 10),
            AnnounceOutcome::Renamed
        );
        assert_eq!(dir.resolve("A"), None);
        assert_eq!(dir.resolve("B"), Some(NodeAddress(5)));
        assert_eq!(dir.len(), 1);
    }

    #[test]
    fn rename_onto_held_name_evicts_holder() {
        let mut dir = NodeDirectory::new(0);
        dir.on_announcement(NodeAddress(5), &name("A"), 0);
        dir.on_announcement(NodeAddress(6), &name("B"), 0);
        assert_eq!(
            dir.on_announcement(NodeAddress(6), &name("A"), 50),
            AnnounceOutcome::Superseded {
                evicted: NodeAddress(5)
            }
        );
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.resolve("A"), Some(NodeAddress(6)));
        assert_eq!(dir.resolve("B"), None);
    }

    #[test]
    fn full_directory_evicts_stalest() {
        let mut dir = NodeDirectory::new(0);
        let mut n = heapless::String::<16>::new();
        for i in 0..MAX_NODES as u32 {
            n.clear();
            core::fmt::write(&mut n, format_args!("n{}", i)).unwrap();
            dir.on_announcement(NodeAddress(i), &n, 100 + u64::from(i));
        }
        assert_eq!(dir.len(), MAX_NODES);
        dir.on_announcement(NodeAddress(99), &name("late"), 1_000);
        assert_eq!(dir.len(), MAX_NODES);
        assert_eq!(dir.resolve("n0"), None);
        assert_eq!(dir.resolve("late"), Some(NodeAddress(99)));
    }

    // ── Lookups ─────────────────────────────────────────────────────

    #[test]
    fn unknown_name_and_address_resolve_to_none() {
        let dir = NodeDirectory::new(0);
        assert_eq!(dir.resolve("9"), None);
        assert_eq!(dir.reverse_resolve(NodeAddress(9)), None);
        assert!(dir.is_empty());
    }

    #[test]
    fn list_connected_snapshots_names() {
        let mut dir = NodeDirectory::new(0);
        dir.on_announcement(NodeAddress(1), &name("7"), 0);
        dir.on_announcement(NodeAddress(2), &name("9"), 0);
        let names = dir.list_connected();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.as_str() == "7"));
        assert!(names.iter().any(|n| n.as_str() == "9"));
    }

    #[test]
    fn listing_reports_age_in_seconds() {
        let mut dir = NodeDirectory::new(0);
        dir.on_announcement(NodeAddress(1), &name("7"), 1_000);
        let rows = dir.listing(31_500);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].age, 30);
        assert_eq!(rows[0].addr, NodeAddress(1));
    }

    // ── Removal ─────────────────────────────────────────────────────

    #[test]
    fn disconnect_removes_entry() {
        let mut dir = NodeDirectory::new(0);
        dir.on_announcement(NodeAddress(5), &name("A"), 0);
        assert!(dir.on_disconnect(NodeAddress(5)));
        assert!(!dir.on_disconnect(NodeAddress(5)));
        assert_eq!(dir.resolve("A"), None);
    }

    #[test]
    fn expire_purges_only_stale_entries() {
        let mut dir = NodeDirectory::new(0);
        dir.on_announcement(NodeAddress(1), &name("old"), 1_000);
        dir.on_announcement(NodeAddress(2), &name("edge"), 5_000);
        dir.on_announcement(NodeAddress(3), &name("new"), 9_000);

        assert_eq!(dir.expire(10_000, 5_000), 1);
        assert_eq!(dir.resolve("old"), None);
        // last_seen == now - max_age is not older than the cutoff
        assert_eq!(dir.resolve("edge"), Some(NodeAddress(2)));
        assert_eq!(dir.resolve("new"), Some(NodeAddress(3)));
    }

    #[test]
    fn expire_early_in_uptime_keeps_everything() {
        let mut dir = NodeDirectory::new(0);
        dir.on_announcement(NodeAddress(1), &name("A"), 0);
        assert_eq!(dir.expire(100, 180_000), 0);
        assert_eq!(dir.len(), 1);
    }
}
