//! Participant registry for one session.
//!
//! Owned exclusively by the session actor, so every method takes `&mut
//! self` and nothing here locks. The registry tracks who is attached, the
//! color each editor was assigned, and heartbeat freshness; the actor's
//! sweep timer drives eviction.

use crate::protocol::{now_millis, Identity, ParticipantInfo, WireMessage};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Fixed palette, assigned first-unused in order. Sized for the expected
/// ceiling of concurrent editors on one theme; past that, colors repeat
/// via a deterministic hash of the user id.
pub const COLOR_PALETTE: [&str; 12] = [
    "#e6194b", "#3cb44b", "#4363d8", "#f58231", "#911eb4", "#46f0f0",
    "#f032e6", "#bcf60c", "#fabebe", "#008080", "#e6beff", "#9a6324",
];

/// One connected editor within a session.
pub struct Participant {
    pub user_id: String,
    pub username: String,
    pub color: String,
    /// Outbound frame queue for this participant's connection task.
    pub connection: mpsc::Sender<WireMessage>,
    /// False while the connection is dropped but the grace window is open.
    pub is_active: bool,
    pub joined_at: u64,
    last_heartbeat: Instant,
    join_index: u64,
}

impl Participant {
    pub fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            user_id: self.user_id.clone(),
            username: self.username.clone(),
            color: self.color.clone(),
        }
    }
}

/// Distinguishes a fresh join from a reconnect so the coordinator can emit
/// `user_resumed` instead of a duplicate `user_joined`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// First time this user appears in the session.
    Joined,
    /// The user was in the disconnect grace window and came back.
    Resumed,
    /// The user re-joined while its prior connection still counted as
    /// active (rapid reconnect); the handle was swapped silently and
    /// nothing should be broadcast.
    Replaced,
}

pub struct PresenceRegistry {
    participants: HashMap<String, Participant>,
    heartbeat_timeout: Duration,
    joins: u64,
}

impl PresenceRegistry {
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            participants: HashMap::new(),
            heartbeat_timeout,
            joins: 0,
        }
    }

    /// Register (or re-register) a participant.
    ///
    /// Idempotent per user id: a second join replaces the prior connection
    /// handle in place, keeps the assigned color, and reports `Resumed`.
    pub fn join(
        &mut self,
        identity: &Identity,
        connection: mpsc::Sender<WireMessage>,
    ) -> (JoinOutcome, ParticipantInfo) {
        if let Some(existing) = self.participants.get_mut(&identity.user_id) {
            let outcome = if existing.is_active {
                JoinOutcome::Replaced
            } else {
                JoinOutcome::Resumed
            };
            existing.username = identity.username.clone();
            existing.connection = connection;
            existing.is_active = true;
            existing.last_heartbeat = Instant::now();
            return (outcome, existing.info());
        }

        let color = self.assign_color(&identity.user_id);
        self.joins += 1;
        let participant = Participant {
            user_id: identity.user_id.clone(),
            username: identity.username.clone(),
            color,
            connection,
            is_active: true,
            joined_at: now_millis(),
            last_heartbeat: Instant::now(),
            join_index: self.joins,
        };
        let info = participant.info();
        self.participants.insert(identity.user_id.clone(), participant);
        (JoinOutcome::Joined, info)
    }

    /// Remove a participant immediately (explicit leave).
    pub fn leave(&mut self, user_id: &str) -> Option<ParticipantInfo> {
        self.participants.remove(user_id).map(|p| p.info())
    }

    /// Keep a participant's entry but mark its connection gone; the sweep
    /// evicts it if no reconnect lands within the heartbeat timeout.
    pub fn mark_disconnected(&mut self, user_id: &str) {
        if let Some(p) = self.participants.get_mut(user_id) {
            p.is_active = false;
        }
    }

    /// Refresh a participant's heartbeat. Returns false for unknown users.
    pub fn heartbeat(&mut self, user_id: &str) -> bool {
        match self.participants.get_mut(user_id) {
            Some(p) => {
                p.last_heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Evict everyone whose heartbeat is older than the timeout, returning
    /// each evicted participant exactly once.
    pub fn sweep(&mut self) -> Vec<ParticipantInfo> {
        let timeout = self.heartbeat_timeout;
        let expired: Vec<String> = self
            .participants
            .iter()
            .filter(|(_, p)| p.last_heartbeat.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .iter()
            .filter_map(|id| self.participants.remove(id).map(|p| p.info()))
            .collect()
    }

    pub fn get(&self, user_id: &str) -> Option<&Participant> {
        self.participants.get(user_id)
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.contains_key(user_id)
    }

    /// Current roster, ordered by join time for stable snapshots.
    pub fn list_active(&self) -> Vec<ParticipantInfo> {
        let mut entries: Vec<&Participant> = self.participants.values().collect();
        entries.sort_by_key(|p| p.join_index);
        entries.into_iter().map(|p| p.info()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    fn assign_color(&self, user_id: &str) -> String {
        let in_use: Vec<&str> = self.participants.values().map(|p| p.color.as_str()).collect();
        COLOR_PALETTE
            .iter()
            .find(|c| !in_use.contains(c))
            .copied()
            .unwrap_or_else(|| fallback_color(user_id))
            .to_string()
    }
}

/// Deterministic palette pick once every slot is taken. Collisions are
/// acceptable (merely visually confusable).
fn fallback_color(user_id: &str) -> &'static str {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    COLOR_PALETTE[(hasher.finish() % COLOR_PALETTE.len() as u64) as usize]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PresenceRegistry {
        PresenceRegistry::new(Duration::from_secs(45))
    }

    fn conn() -> mpsc::Sender<WireMessage> {
        mpsc::channel(8).0
    }

    #[test]
    fn test_join_assigns_distinct_palette_colors() {
        let mut reg = registry();
        let mut seen = std::collections::HashSet::new();
        for i in 0..COLOR_PALETTE.len() {
            let (outcome, info) =
                reg.join(&Identity::new(format!("u-{i}"), format!("user {i}")), conn());
            assert_eq!(outcome, JoinOutcome::Joined);
            assert!(seen.insert(info.color), "color reused before exhaustion");
        }
    }

    #[test]
    fn test_palette_exhaustion_falls_back_deterministically() {
        let mut reg = registry();
        for i in 0..COLOR_PALETTE.len() {
            reg.join(&Identity::new(format!("u-{i}"), "x"), conn());
        }
        let (_, a) = reg.join(&Identity::new("overflow", "x"), conn());
        assert_eq!(a.color, fallback_color("overflow"));
        assert!(COLOR_PALETTE.contains(&a.color.as_str()));
    }

    #[test]
    fn test_rejoin_is_never_a_duplicate() {
        let mut reg = registry();
        let id = Identity::new("u-1", "rosa");
        let (first, info) = reg.join(&id, conn());
        assert_eq!(first, JoinOutcome::Joined);

        // Rapid re-join while the old connection is still considered live:
        // the handle is swapped, nothing broadcast-worthy happened.
        let (second, resumed) = reg.join(&id, conn());
        assert_eq!(second, JoinOutcome::Replaced);
        assert_eq!(reg.len(), 1);
        // Color survives the reconnect so the UI doesn't flicker.
        assert_eq!(resumed.color, info.color);
    }

    #[test]
    fn test_resume_reactivates_disconnected_entry() {
        let mut reg = registry();
        let id = Identity::new("u-1", "rosa");
        reg.join(&id, conn());
        reg.mark_disconnected("u-1");
        assert!(!reg.get("u-1").unwrap().is_active);

        let (outcome, _) = reg.join(&id, conn());
        assert_eq!(outcome, JoinOutcome::Resumed);
        assert!(reg.get("u-1").unwrap().is_active);
    }

    #[test]
    fn test_leave_removes_entry() {
        let mut reg = registry();
        reg.join(&Identity::new("u-1", "rosa"), conn());
        let left = reg.leave("u-1");
        assert_eq!(left.unwrap().user_id, "u-1");
        assert!(reg.is_empty());
        assert!(reg.leave("u-1").is_none());
    }

    #[test]
    fn test_sweep_evicts_expired_exactly_once() {
        let mut reg = PresenceRegistry::new(Duration::from_millis(10));
        reg.join(&Identity::new("u-1", "rosa"), conn());
        reg.join(&Identity::new("u-2", "theo"), conn());
        std::thread::sleep(Duration::from_millis(25));
        reg.heartbeat("u-2");

        let evicted = reg.sweep();
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].user_id, "u-1");
        assert!(reg.contains("u-2"));

        // A second sweep must not report the same eviction again.
        assert!(reg.sweep().is_empty());
    }

    #[test]
    fn test_heartbeat_unknown_user() {
        let mut reg = registry();
        assert!(!reg.heartbeat("ghost"));
    }

    #[test]
    fn test_list_active_is_join_ordered() {
        let mut reg = registry();
        reg.join(&Identity::new("u-b", "b"), conn());
        reg.join(&Identity::new("u-a", "a"), conn());
        let roster = reg.list_active();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[0].user_id, "u-b");
    }
}
