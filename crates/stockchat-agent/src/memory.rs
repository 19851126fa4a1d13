use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use stockchat_providers::ChatTurn;

type SessionHistory = Arc<Mutex<Vec<ChatTurn>>>;

/// Per-session conversation history for one agent. All state is
/// process-lifetime only; the reaper bounds total growth by evicting idle
/// sessions and the pipeline bounds per-session growth by rotation.
#[derive(Default)]
pub struct ConversationMemory {
    sessions: Mutex<HashMap<i64, SessionHistory>>,
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ConversationMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the session's history cell. Callers hold the inner
    /// lock for as long as their appends must stay contiguous.
    pub(crate) fn session_handle(&self, session_id: i64) -> SessionHistory {
        let mut sessions = lock_unpoisoned(&self.sessions);
        Arc::clone(sessions.entry(session_id).or_default())
    }

    /// Point-in-time copy of one session's turns.
    pub fn history(&self, session_id: i64) -> Vec<ChatTurn> {
        let sessions = lock_unpoisoned(&self.sessions);
        match sessions.get(&session_id) {
            Some(handle) => lock_unpoisoned(handle).clone(),
            None => Vec::new(),
        }
    }

    /// Keep only the most recent `max_questions` question/answer pairs.
    pub fn rotate_history(&self, session_id: i64, max_questions: usize) {
        let handle = {
            let sessions = lock_unpoisoned(&self.sessions);
            match sessions.get(&session_id) {
                Some(handle) => Arc::clone(handle),
                None => return,
            }
        };
        let mut turns = lock_unpoisoned(&handle);
        let keep = max_questions.saturating_mul(2);
        let len = turns.len();
        if len > keep {
            turns.drain(..len - keep);
        }
    }

    pub fn clear_history_by_id(&self, session_id: i64) {
        let mut sessions = lock_unpoisoned(&self.sessions);
        sessions.remove(&session_id);
    }

    pub fn clear_all_sessions(&self) {
        let mut sessions = lock_unpoisoned(&self.sessions);
        sessions.clear();
    }

    pub fn session_count(&self) -> usize {
        lock_unpoisoned(&self.sessions).len()
    }
}
