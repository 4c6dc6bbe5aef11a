//! Last-write-wins cursor table for one session.
//!
//! Cursor updates are advisory: they race freely with edits and carry a
//! sender-side timestamp that orders updates per user. Entries expire on
//! their own staleness clock, shorter than the connection timeout since a
//! user can stay connected but stop moving; no removal message needed.

use crate::protocol::CursorPos;
use std::collections::HashMap;
use std::time::{Duration, Instant};

struct CursorEntry {
    pos: CursorPos,
    received_at: Instant,
}

pub struct CursorTable {
    entries: HashMap<String, CursorEntry>,
    staleness: Duration,
}

impl CursorTable {
    pub fn new(staleness: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            staleness,
        }
    }

    /// Record a cursor update. Returns false when the update is older than
    /// the one already held for that user (out-of-order delivery).
    pub fn update(&mut self, pos: CursorPos) -> bool {
        match self.entries.get_mut(&pos.user_id) {
            Some(existing) if pos.timestamp < existing.pos.timestamp => false,
            Some(existing) => {
                existing.pos = pos;
                existing.received_at = Instant::now();
                true
            }
            None => {
                self.entries.insert(
                    pos.user_id.clone(),
                    CursorEntry {
                        pos,
                        received_at: Instant::now(),
                    },
                );
                true
            }
        }
    }

    /// All live cursors, ordered by user id for stable snapshots.
    pub fn snapshot(&self) -> Vec<CursorPos> {
        let mut cursors: Vec<CursorPos> = self.entries.values().map(|e| e.pos.clone()).collect();
        cursors.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        cursors
    }

    pub fn remove(&mut self, user_id: &str) -> bool {
        self.entries.remove(user_id).is_some()
    }

    /// Drop entries older than the staleness threshold, returning the user
    /// ids that were purged.
    pub fn purge_stale(&mut self) -> Vec<String> {
        let staleness = self.staleness;
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.received_at.elapsed() > staleness)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &stale {
            self.entries.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cursor(user: &str, position: usize, timestamp: u64) -> CursorPos {
        CursorPos {
            user_id: user.to_string(),
            position,
            line: 0,
            column: position as u32,
            color: "#e6194b".into(),
            timestamp,
        }
    }

    #[test]
    fn test_last_write_wins() {
        let mut table = CursorTable::new(Duration::from_secs(60));
        assert!(table.update(cursor("u-1", 5, 100)));
        assert!(table.update(cursor("u-1", 9, 200)));
        assert_eq!(table.snapshot()[0].position, 9);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_out_of_order_update_dropped() {
        let mut table = CursorTable::new(Duration::from_secs(60));
        table.update(cursor("u-1", 9, 200));
        assert!(!table.update(cursor("u-1", 5, 100)));
        assert_eq!(table.snapshot()[0].position, 9);
    }

    #[test]
    fn test_equal_timestamp_takes_newest_arrival() {
        let mut table = CursorTable::new(Duration::from_secs(60));
        table.update(cursor("u-1", 5, 100));
        assert!(table.update(cursor("u-1", 7, 100)));
        assert_eq!(table.snapshot()[0].position, 7);
    }

    #[test]
    fn test_snapshot_is_sorted_by_user() {
        let mut table = CursorTable::new(Duration::from_secs(60));
        table.update(cursor("u-z", 1, 1));
        table.update(cursor("u-a", 2, 1));
        let snap = table.snapshot();
        assert_eq!(snap[0].user_id, "u-a");
        assert_eq!(snap[1].user_id, "u-z");
    }

    #[test]
    fn test_purge_stale_entries() {
        let mut table = CursorTable::new(Duration::from_millis(10));
        table.update(cursor("u-1", 1, 1));
        table.update(cursor("u-2", 2, 1));
        std::thread::sleep(Duration::from_millis(25));
        table.update(cursor("u-2", 3, 2)); // refreshed

        let purged = table.purge_stale();
        assert_eq!(purged, vec!["u-1".to_string()]);
        assert_eq!(table.len(), 1);
        assert!(table.purge_stale().is_empty());
    }

    #[test]
    fn test_remove_on_leave() {
        let mut table = CursorTable::new(Duration::from_secs(60));
        table.update(cursor("u-1", 1, 1));
        assert!(table.remove("u-1"));
        assert!(!table.remove("u-1"));
        assert!(table.is_empty());
    }
}
