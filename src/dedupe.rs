//! Best-effort duplicate suppression.
//!
//! Two layers: an in-process claim so the same message is never delivered
//! twice concurrently by this process, then a lookup in the backend's lead
//! store. The backend lookup is point-in-time and not a transactional claim,
//! so another process (or a lead not yet recorded) can still lead to double
//! delivery. At-most-once is not guaranteed.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::backend::ConfigBackend;
use crate::error::StageError;

type Key = (String, i32);

/// Tracks messages currently being handled in this process.
#[derive(Clone, Default)]
pub struct Deduplicator {
    in_flight: Arc<Mutex<HashSet<Key>>>,
}

/// Held while a message is being delivered; releases the in-process claim on
/// drop.
pub struct Claim {
    key: Key,
    in_flight: Arc<Mutex<HashSet<Key>>>,
}

/// Outcome of a claim attempt.
pub enum Verdict {
    /// Not seen before; deliver while holding the claim.
    Fresh(Claim),
    /// Another task in this process is handling the same message.
    InFlight,
    /// The backend already has a lead for this message.
    Recorded,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_claim(&self, chat: &str, message_id: i32) -> Option<Claim> {
        let key = (chat.to_lowercase(), message_id);
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(key.clone()) {
            return None;
        }
        Some(Claim {
            key,
            in_flight: self.in_flight.clone(),
        })
    }

    /// Claim a message for delivery.
    ///
    /// A backend lookup failure is returned as an error together with the
    /// claim, so the caller can log it and still deliver (fail-open).
    pub async fn claim(
        &self,
        backend: &dyn ConfigBackend,
        chat: &str,
        message_id: i32,
    ) -> (Verdict, Option<StageError>) {
        let Some(claim) = self.try_claim(chat, message_id) else {
            return (Verdict::InFlight, None);
        };

        match backend.is_duplicate(chat, message_id).await {
            Ok(true) => (Verdict::Recorded, None),
            Ok(false) => (Verdict::Fresh(claim), None),
            Err(e) => (Verdict::Fresh(claim), Some(StageError::Dedupe(e))),
        }
    }

    #[cfg(test)]
    fn in_flight_len(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.key);
    }
}
