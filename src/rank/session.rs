//! Per-session served-result tracking for differential context.
//!
//! The server remembers which bullet IDs each session has already been
//! given (so they are never served twice) and which nodes the session has
//! touched (so related candidates get boosted). Sessions expire after a
//! TTL; pruning happens inline on access.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Default)]
struct SessionState {
    served_bullets: HashSet<String>,
    touched_slugs: HashSet<String>,
    last_seen: Option<Instant>,
}

pub struct SessionTracker {
    sessions: Mutex<HashMap<String, SessionState>>,
    ttl: Duration,
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl SessionTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Bullet IDs already served to this session.
    pub fn served_bullets(&self, session_id: &str) -> HashSet<String> {
        let mut sessions = self.sessions.lock().expect("session lock");
        Self::prune(&mut sessions, self.ttl);
        sessions
            .get(session_id)
            .map(|s| s.served_bullets.clone())
            .unwrap_or_default()
    }

    /// Node slugs referenced anywhere in this session's served output.
    pub fn touched_slugs(&self, session_id: &str) -> HashSet<String> {
        let mut sessions = self.sessions.lock().expect("session lock");
        Self::prune(&mut sessions, self.ttl);
        sessions
            .get(session_id)
            .map(|s| s.touched_slugs.clone())
            .unwrap_or_default()
    }

    /// Record a served response for the session.
    pub fn record_served<'a>(
        &self,
        session_id: &str,
        bullet_ids: impl IntoIterator<Item = &'a str>,
        slugs: impl IntoIterator<Item = &'a str>,
    ) {
        let mut sessions = self.sessions.lock().expect("session lock");
        let state = sessions.entry(session_id.to_string()).or_default();
        state
            .served_bullets
            .extend(bullet_ids.into_iter().map(str::to_string));
        state
            .touched_slugs
            .extend(slugs.into_iter().map(str::to_string));
        state.last_seen = Some(Instant::now());
    }

    /// Forget a session (the `fresh` flag on context requests).
    pub fn reset(&self, session_id: &str) {
        self.sessions.lock().expect("session lock").remove(session_id);
    }

    fn prune(sessions: &mut HashMap<String, SessionState>, ttl: Duration) {
        sessions.retain(|_, state| match state.last_seen {
            Some(at) => at.elapsed() < ttl,
            None => true,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn served_ids_accumulate_per_session() {
        let tracker = SessionTracker::default();
        tracker.record_served("s1", ["b-1"], ["node-a"]);
        tracker.record_served("s1", ["b-2"], ["node-b"]);
        tracker.record_served("s2", ["b-9"], []);

        let served = tracker.served_bullets("s1");
        assert!(served.contains("b-1") && served.contains("b-2"));
        assert!(!served.contains("b-9"));
        assert_eq!(tracker.touched_slugs("s1").len(), 2);
    }

    #[test]
    fn unknown_session_is_empty() {
        let tracker = SessionTracker::default();
        assert!(tracker.served_bullets("nope").is_empty());
    }

    #[test]
    fn reset_forgets_a_session() {
        let tracker = SessionTracker::default();
        tracker.record_served("s1", ["b-1"], ["n"]);
        tracker.reset("s1");
        assert!(tracker.served_bullets("s1").is_empty());
    }

    #[test]
    fn expired_sessions_are_pruned() {
        let tracker = SessionTracker::new(Duration::from_millis(10));
        tracker.record_served("s1", ["b-1"], []);
        std::thread::sleep(Duration::from_millis(25));
        assert!(tracker.served_bullets("s1").is_empty());
    }
}
