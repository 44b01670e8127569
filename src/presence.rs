//! Presence registry: who is currently "in" the chat.
//!
//! Liveness is inferred from request activity rather than a disconnect
//! signal.  Each poll refreshes a participant's last-seen timestamp;
//! participants idle past the liveness window are evicted at the start of
//! the next poll.  An idle relay with zero pollers never shrinks its
//! registry, which is a documented characteristic of this design.

use serde_json::{json, Map, Value};
use std::collections::HashMap;

pub const DEFAULT_NAME: &str = "Anónimo";

#[derive(Clone, Debug)]
pub struct Participant {
    pub id: String,
    pub name: String,
    /// Opaque caller-supplied profile fields, carried through untouched.
    pub profile: Map<String, Value>,
    pub last_seen_ms: u64,
}

impl Participant {
    /// Wire form: profile fields plus `id`, `name`, and `lastSeen`, with the
    /// registry-owned fields winning on key collisions.
    pub fn to_json(&self) -> Value {
        let mut out = self.profile.clone();
        out.insert("id".to_string(), json!(self.id));
        out.insert("name".to_string(), json!(self.name));
        out.insert("lastSeen".to_string(), json!(self.last_seen_ms));
        Value::Object(out)
    }
}

#[derive(Default)]
pub struct PresenceRegistry {
    participants: HashMap<String, Participant>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a participant: updates `last_seen_ms`, replaces the
    /// display name when one is supplied, and merges new profile fields over
    /// existing ones.
    pub fn upsert(
        &mut self,
        id: &str,
        name: Option<&str>,
        profile: Map<String, Value>,
        now_ms: u64,
    ) -> &Participant {
        let entry = self
            .participants
            .entry(id.to_string())
            .or_insert_with(|| Participant {
                id: id.to_string(),
                name: DEFAULT_NAME.to_string(),
                profile: Map::new(),
                last_seen_ms: now_ms,
            });
        if let Some(name) = name {
            entry.name = name.to_string();
        }
        entry.profile.extend(profile);
        entry.last_seen_ms = now_ms;
        entry
    }

    /// Refresh only the last-seen timestamp.  Returns false for unknown ids.
    pub fn touch(&mut self, id: &str, now_ms: u64) -> bool {
        match self.participants.get_mut(id) {
            Some(p) => {
                p.last_seen_ms = now_ms;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: &str) -> Option<Participant> {
        self.participants.remove(id)
    }

    /// Drop every participant whose last activity is older than the window.
    pub fn evict_stale(&mut self, now_ms: u64, window_ms: u64) {
        let threshold = now_ms.saturating_sub(window_ms);
        self.participants.retain(|_, p| p.last_seen_ms >= threshold);
    }

    /// Wire snapshot of all tracked participants, ordered by id for stable
    /// output.
    pub fn snapshot(&self) -> Vec<Value> {
        let mut entries: Vec<&Participant> = self.participants.values().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries.iter().map(|p| p.to_json()).collect()
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Participant> {
        self.participants.get(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW_MS: u64 = 120_000;

    #[test]
    fn upsert_merges_profile_and_refreshes_name() {
        let mut reg = PresenceRegistry::new();
        let mut profile = Map::new();
        profile.insert("avatar".to_string(), json!("cat.png"));
        reg.upsert("b1", Some("Bob"), profile, 1_000);

        let mut update = Map::new();
        update.insert("status".to_string(), json!("away"));
        reg.upsert("b1", None, update, 2_000);

        let p = reg.get("b1").unwrap();
        assert_eq!(p.name, "Bob");
        assert_eq!(p.profile["avatar"], json!("cat.png"));
        assert_eq!(p.profile["status"], json!("away"));
        assert_eq!(p.last_seen_ms, 2_000);
    }

    #[test]
    fn unnamed_participant_gets_default_name() {
        let mut reg = PresenceRegistry::new();
        reg.upsert("x9", None, Map::new(), 0);
        assert_eq!(reg.get("x9").unwrap().name, DEFAULT_NAME);
    }

    #[test]
    fn eviction_threshold_boundary() {
        let mut reg = PresenceRegistry::new();
        let now = 1_000_000;
        reg.upsert("fresh", Some("A"), Map::new(), now - 119_999);
        reg.upsert("stale", Some("B"), Map::new(), now - 120_001);

        reg.evict_stale(now, WINDOW_MS);

        assert!(reg.get("fresh").is_some());
        assert!(reg.get("stale").is_none());
        assert_eq!(reg.snapshot().len(), 1);
    }

    #[test]
    fn exact_window_age_survives() {
        let mut reg = PresenceRegistry::new();
        let now = 1_000_000;
        reg.upsert("edge", None, Map::new(), now - WINDOW_MS);
        reg.evict_stale(now, WINDOW_MS);
        assert!(reg.get("edge").is_some());
    }

    #[test]
    fn touch_refreshes_without_creating() {
        let mut reg = PresenceRegistry::new();
        assert!(!reg.touch("ghost", 1_000));
        reg.upsert("b1", Some("Bob"), Map::new(), 1_000);
        assert!(reg.touch("b1", 5_000));
        assert_eq!(reg.get("b1").unwrap().last_seen_ms, 5_000);
    }

    #[test]
    fn snapshot_is_sorted_and_carries_wire_fields() {
        let mut reg = PresenceRegistry::new();
        reg.upsert("zz", Some("Zoe"), Map::new(), 10);
        reg.upsert("aa", Some("Ana"), Map::new(), 20);
        let snap = reg.snapshot();
        assert_eq!(snap[0]["id"], json!("aa"));
        assert_eq!(snap[0]["name"], json!("Ana"));
        assert_eq!(snap[0]["lastSeen"], json!(20));
        assert_eq!(snap[1]["id"], json!("zz"));
    }
}
