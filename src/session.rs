use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::Product;
use crate::prompt;
use crate::transport::{ChatMessage, ChatTransport, TransportError};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Generating,
    Ready,
    Replying,
}

impl Phase {
    fn in_flight(self) -> bool {
        matches!(self, Phase::Generating | Phase::Replying)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no products selected")]
    NoSelection,

    #[error("no routine has been generated yet")]
    NotReady,

    #[error("empty message")]
    EmptyMessage,

    #[error("another request is still in flight")]
    Busy,

    #[error("response arrived after the session was reset")]
    Superseded,

    #[error("routine request failed: {0}")]
    RoutineFailed(#[source] TransportError),

    #[error("follow-up request failed: {0}")]
    ReplyFailed(#[source] TransportError),
}

impl SessionError {
    /// Text shown to the user in the chat window.
    pub fn user_message(&self) -> &'static str {
        match self {
            SessionError::NoSelection => {
                "Please select at least one product to generate a routine."
            }
            SessionError::NotReady => {
                "Please generate a routine first by selecting products and clicking the 'Generate Routine' button."
            }
            SessionError::EmptyMessage => "Please enter a message.",
            SessionError::Busy => "Please wait for the current response to finish.",
            SessionError::Superseded => "The conversation was reset before this response arrived.",
            SessionError::RoutineFailed(_) => {
                "Sorry, there was an error generating your routine. Please try again."
            }
            SessionError::ReplyFailed(_) => "Sorry, there was an error. Please try again.",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub phase: Phase,
    pub routine_generated: bool,
    pub history: Vec<ChatMessage>,
}

struct SessionState {
    id: Uuid,
    created_at: DateTime<Utc>,
    phase: Phase,
    routine_generated: bool,
    history: Vec<ChatMessage>,
    // Bumped by every request and by reset; a response is applied only if
    // nothing bumped it while the request was in flight.
    seq: u64,
}

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionState {
    fn fresh(seq: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            phase: Phase::Idle,
            routine_generated: false,
            history: Vec::new(),
            seq,
        }
    }
}

/// Puts the phase back to what it was before a request if the request future
/// is dropped while waiting on the transport.
struct InFlight<'a> {
    state: &'a Mutex<SessionState>,
    seq: u64,
    previous: Phase,
    armed: bool,
}

impl InFlight<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut st = lock(self.state);
        if st.seq == self.seq && st.phase.in_flight() {
            tracing::warn!(seq = self.seq, "request abandoned before its response arrived");
            st.phase = self.previous;
        }
    }
}

/// Routine generation and the follow-up conversation gated on it.
///
/// `history` is non-empty exactly when `routine_generated` is set. The lock is
/// never held across the transport call; the phase rejects overlapping
/// requests with [`SessionError::Busy`].
pub struct RoutineSession {
    transport: Arc<dyn ChatTransport>,
    state: Mutex<SessionState>,
}

impl RoutineSession {
    pub fn new(transport: Arc<dyn ChatTransport>) -> Self {
        Self { transport, state: Mutex::new(SessionState::fresh(0)) }
    }

    fn in_flight(&self, seq: u64, previous: Phase) -> InFlight<'_> {
        InFlight { state: &self.state, seq, previous, armed: true }
    }

    pub async fn generate(&self, products: &[Product]) -> Result<String, SessionError> {
        if products.is_empty() {
            return Err(SessionError::NoSelection);
        }
        let messages = prompt::routine_request(products);

        let (pending, previous) = {
            let mut st = lock(&self.state);
            if st.phase.in_flight() {
                return Err(SessionError::Busy);
            }
            let previous = st.phase;
            st.phase = Phase::Generating;
            st.seq += 1;
            (self.in_flight(st.seq, previous), previous)
        };
        let seq = pending.seq;

        let result = self.transport.send(&messages).await;
        pending.disarm();

        let mut st = lock(&self.state);
        if st.seq != seq {
            tracing::warn!(seq, current = st.seq, "discarding stale routine response");
            return Err(SessionError::Superseded);
        }
        match result {
            Ok(routine) => {
                st.phase = Phase::Ready;
                st.routine_generated = true;
                st.history = prompt::seeded_history(&routine);
                metrics::counter!("advisor_routines_generated_total").increment(1);
                tracing::info!(session = %st.id, products = products.len(), "routine generated");
                Ok(routine)
            }
            Err(e) => {
                st.phase = previous;
                Err(SessionError::RoutineFailed(e))
            }
        }
    }

    /// `message` is trimmed first; a blank message is rejected without a
    /// request.
    pub async fn reply(&self, message: &str) -> Result<String, SessionError> {
        let message = message.trim();
        if message.is_empty() {
            return Err(SessionError::EmptyMessage);
        }

        let (pending, messages) = {
            let mut st = lock(&self.state);
            if !st.routine_generated {
                return Err(SessionError::NotReady);
            }
            if st.phase.in_flight() {
                return Err(SessionError::Busy);
            }
            st.phase = Phase::Replying;
            st.seq += 1;
            (self.in_flight(st.seq, Phase::Ready), prompt::follow_up_request(&st.history, message))
        };
        let seq = pending.seq;

        let result = self.transport.send(&messages).await;
        pending.disarm();

        let mut st = lock(&self.state);
        if st.seq != seq {
            tracing::warn!(seq, current = st.seq, "discarding stale follow-up response");
            return Err(SessionError::Superseded);
        }
        st.phase = Phase::Ready;
        match result {
            Ok(reply) => {
                st.history.push(ChatMessage::user(message));
                st.history.push(ChatMessage::assistant(reply.clone()));
                metrics::counter!("advisor_replies_total").increment(1);
                Ok(reply)
            }
            Err(e) => Err(SessionError::ReplyFailed(e)),
        }
    }

    /// Starts a new session. Responses to requests sent before the reset are
    /// discarded when they arrive.
    pub fn reset(&self) {
        let mut st = lock(&self.state);
        let seq = st.seq + 1;
        *st = SessionState::fresh(seq);
        tracing::info!(session = %st.id, "session reset");
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let st = lock(&self.state);
        SessionSnapshot {
            id: st.id,
            created_at: st.created_at,
            phase: st.phase,
            routine_generated: st.routine_generated,
            history: st.history.clone(),
        }
    }
}
