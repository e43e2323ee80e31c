//! Conversation history: a bounded ring of entries per chat thread.
//!
//! Responsibilities:
//! - Keep the most recent `limit` entries of every thread, evicting oldest
//! - Keep at most `max_threads` threads, forgetting the least recently active
//! - Render a thread's history as `Vec<ChatMessage>` for the next prompt
//!
//! History lives in memory only and is owned by the supervisor, so it
//! survives reloads but not restarts.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::inference::types::ChatMessage;

/// Default ring capacity per thread.
pub const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Default number of threads remembered at once.
pub const DEFAULT_HISTORY_THREADS: usize = 1000;

/// Who produced a history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryRole {
    User,
    Assistant,
    Tool,
}

/// One remembered message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub role: HistoryRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn new(role: HistoryRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
            timestamp: Utc::now(),
        }
    }

    /// Prompt form. Tool entries from earlier turns have no live call id to
    /// answer, so they are replayed as user-side context.
    pub fn to_message(&self) -> ChatMessage {
        match self.role {
            HistoryRole::User => ChatMessage::user(self.text.clone()),
            HistoryRole::Assistant => ChatMessage::assistant(self.text.clone()),
            HistoryRole::Tool => ChatMessage::user(format!("[tool result] {}", self.text)),
        }
    }
}

/// One thread's ring plus when it was last written.
#[derive(Debug)]
struct Ring {
    entries: VecDeque<HistoryEntry>,
    touched: u64,
}

#[derive(Debug, Default)]
struct Rings {
    by_thread: HashMap<String, Ring>,
    /// Monotonic write counter used as the recency stamp.
    clock: u64,
}

/// Per-thread history rings.
#[derive(Debug)]
pub struct HistoryStore {
    limit: usize,
    max_threads: usize,
    rings: Mutex<Rings>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl HistoryStore {
    /// A store keeping at most `limit` entries per thread (minimum 1).
    pub fn new(limit: usize) -> Self {
        Self::with_max_threads(limit, DEFAULT_HISTORY_THREADS)
    }

    /// Like [`HistoryStore::new`], remembering at most `max_threads`
    /// threads (minimum 1).
    pub fn with_max_threads(limit: usize, max_threads: usize) -> Self {
        Self {
            limit: limit.max(1),
            max_threads: max_threads.max(1),
            rings: Mutex::new(Rings::default()),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Append one entry, evicting the oldest entries beyond the limit.
    pub fn append(&self, thread_id: &str, entry: HistoryEntry) {
        self.extend(thread_id, std::iter::once(entry));
    }

    /// Append several entries in order under one lock.
    pub fn extend(&self, thread_id: &str, entries: impl IntoIterator<Item = HistoryEntry>) {
        let mut rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        rings.clock += 1;
        let now = rings.clock;

        if !rings.by_thread.contains_key(thread_id) && rings.by_thread.len() >= self.max_threads {
            let stalest = rings
                .by_thread
                .iter()
                .min_by_key(|(_, ring)| ring.touched)
                .map(|(id, _)| id.clone());
            if let Some(id) = stalest {
                rings.by_thread.remove(&id);
                tracing::debug!(thread = %id, "history dropped for least recently active thread");
            }
        }

        let ring = rings.by_thread.entry(thread_id.to_string()).or_insert_with(|| Ring {
            entries: VecDeque::with_capacity(self.limit.min(64)),
            touched: now,
        });
        ring.touched = now;
        for entry in entries {
            ring.entries.push_back(entry);
            if ring.entries.len() > self.limit {
                ring.entries.pop_front();
            }
        }
    }

    /// Snapshot of a thread's entries, oldest first.
    pub fn entries(&self, thread_id: &str) -> Vec<HistoryEntry> {
        let rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        rings
            .by_thread
            .get(thread_id)
            .map(|ring| ring.entries.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// A thread's history as prompt messages, oldest first.
    pub fn messages(&self, thread_id: &str) -> Vec<ChatMessage> {
        self.entries(thread_id).iter().map(HistoryEntry::to_message).collect()
    }

    pub fn len(&self, thread_id: &str) -> usize {
        let rings = self.rings.lock().unwrap_or_else(|e| e.into_inner());
        rings.by_thread.get(thread_id).map(|r| r.entries.len()).unwrap_or(0)
    }

    pub fn thread_count(&self) -> usize {
        self.rings.lock().unwrap_or_else(|e| e.into_inner()).by_thread.len()
    }

    /// Forget one thread.
    pub fn clear(&self, thread_id: &str) {
        self.rings
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .by_thread
            .remove(thread_id);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::types::Role;

    #[test]
    fn test_ring_evicts_oldest() {
        let store = HistoryStore::new(3);
        for i in 0..5 {
            store.append("t", HistoryEntry::new(HistoryRole::User, format!("m{i}")));
        }
        assert_eq!(store.len("t"), 3);
        let texts: Vec<String> = store.entries("t").into_iter().map(|e| e.text).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_threads_are_independent() {
        let store = HistoryStore::default();
        store.append("a", HistoryEntry::new(HistoryRole::User, "hi"));
        store.append("b", HistoryEntry::new(HistoryRole::User, "yo"));
        store.append("b", HistoryEntry::new(HistoryRole::Assistant, "hey"));
        assert_eq!(store.len("a"), 1);
        assert_eq!(store.len("b"), 2);
        assert_eq!(store.len("missing"), 0);
        assert_eq!(store.thread_count(), 2);

        store.clear("b");
        assert_eq!(store.len("b"), 0);
    }

    #[test]
    fn test_least_recently_active_thread_forgotten() {
        let store = HistoryStore::with_max_threads(10, 2);
        store.append("a", HistoryEntry::new(HistoryRole::User, "a1"));
        store.append("b", HistoryEntry::new(HistoryRole::User, "b1"));
        // "a" is now more recent than "b".
        store.append("a", HistoryEntry::new(HistoryRole::Assistant, "a2"));

        store.append("c", HistoryEntry::new(HistoryRole::User, "c1"));
        assert_eq!(store.thread_count(), 2);
        assert_eq!(store.len("a"), 2);
        assert_eq!(store.len("b"), 0);
        assert_eq!(store.len("c"), 1);
    }

    #[test]
    fn test_zero_limit_clamped() {
        let store = HistoryStore::new(0);
        store.extend(
            "t",
            vec![
                HistoryEntry::new(HistoryRole::User, "one"),
                HistoryEntry::new(HistoryRole::User, "two"),
            ],
        );
        assert_eq!(store.limit(), 1);
        assert_eq!(store.entries("t")[0].text, "two");
    }

    #[test]
    fn test_messages_render_roles() {
        let store = HistoryStore::default();
        store.extend(
            "t",
            vec![
                HistoryEntry::new(HistoryRole::User, "read /tmp/a"),
                HistoryEntry::new(HistoryRole::Assistant, "[called fs_read_file]"),
                HistoryEntry::new(HistoryRole::Tool, "fs_read_file (ok): hello"),
            ],
        );
        let messages = store.messages("t");
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[2].role, Role::User);
        assert_eq!(messages[2].text(), "[tool result] fs_read_file (ok): hello");
    }
}
