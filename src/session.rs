//! Session controller: owns the transcript, admits one turn at a time and
//! forwards cancellation to the active turn.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{broadcast, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::GenerationParams;
use crate::constants::SESSION_EVENT_CAPACITY;
use crate::streaming::{TurnReport, TurnRunner, TurnState};
use crate::transcript::Transcript;
use crate::transport::Transport;
use crate::types::{CoachError, Message, MessageId, Result, Role, SessionId, TurnId};

/// Transcript mutations and turn transitions, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    MessageAppended { id: MessageId, role: Role },
    ContentAppended { id: MessageId, delta: String },
    TurnStateChanged { turn_id: TurnId, state: TurnState },
}

/// State shared between the controller and the running turn.
pub(crate) struct SessionShared {
    transcript: RwLock<Transcript>,
    tx_events: broadcast::Sender<SessionEvent>,
    pub(crate) tx_status: watch::Sender<TurnState>,
    in_flight: AtomicBool,
    active_cancel: Mutex<Option<CancellationToken>>,
}

impl SessionShared {
    fn new(transcript: Transcript) -> Self {
        let (tx_events, _) = broadcast::channel(SESSION_EVENT_CAPACITY);
        let (tx_status, _) = watch::channel(TurnState::Idle);
        Self {
            transcript: RwLock::new(transcript),
            tx_events,
            tx_status,
            in_flight: AtomicBool::new(false),
            active_cancel: Mutex::new(None),
        }
    }

    // Mutations are append-only, so a poisoned lock still holds a valid
    // transcript.
    pub(crate) fn write_transcript(&self) -> RwLockWriteGuard<'_, Transcript> {
        self.transcript
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn read_transcript(&self) -> RwLockReadGuard<'_, Transcript> {
        self.transcript.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.tx_events.send(event);
    }

    fn lock_cancel(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.active_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the in-flight flag however the turn future ends, including when
/// the caller drops it mid-stream.
struct InFlightGuard<'a> {
    shared: &'a SessionShared,
    turn_id: TurnId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let abandoned = self.shared.write_transcript().close_open();
        if abandoned.is_some() {
            tracing::warn!(
                "[⚙️ ] Turn {} dropped before reaching a terminal state; treating as cancelled",
                self.turn_id.short()
            );
            self.shared.tx_status.send_replace(TurnState::Cancelled);
            self.shared.emit(SessionEvent::TurnStateChanged {
                turn_id: self.turn_id.clone(),
                state: TurnState::Cancelled,
            });
        }
        let mut active = self.shared.lock_cancel();
        *active = None;
        self.shared.in_flight.store(false, Ordering::Release);
    }
}

struct SessionInner<T> {
    id: SessionId,
    transport: T,
    params: GenerationParams,
    shared: SessionShared,
}

/// One conversation. Cheap to clone; clones share the same transcript.
pub struct Session<T: Transport> {
    inner: Arc<SessionInner<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Session<T> {
    pub fn new(transport: T, params: GenerationParams) -> Self {
        let mut transcript = Transcript::new();
        if let Some(prompt) = params.system_prompt.as_deref() {
            if !prompt.trim().is_empty() {
                transcript.push(Message::system(prompt));
            }
        }

        let id = SessionId::new();
        tracing::debug!("[⚙️ ] Session {} created", id);

        Self {
            inner: Arc::new(SessionInner {
                id,
                transport,
                params,
                shared: SessionShared::new(transcript),
            }),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.inner.id
    }

    pub fn params(&self) -> &GenerationParams {
        &self.inner.params
    }

    /// Runs one turn to a terminal state.
    ///
    /// Blank input is ignored (`Ok(None)`). A dispatch while another turn is
    /// in flight fails with `InvalidState` and leaves the session untouched.
    /// Transport failures do not surface here: they end the turn as
    /// `Errored` and are annotated inline in the transcript.
    pub async fn dispatch(&self, text: &str) -> Result<Option<TurnReport>> {
        if text.trim().is_empty() {
            tracing::debug!("[⚙️ ] Ignoring blank dispatch");
            return Ok(None);
        }

        let shared = &self.inner.shared;
        let turn_id = TurnId::new();
        let cancel = CancellationToken::new();
        {
            let mut active = shared.lock_cancel();
            if shared
                .in_flight
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                tracing::warn!("[⚙️ ] Dispatch rejected: a turn is already in flight");
                return Err(CoachError::InvalidState(
                    "a turn is already in flight for this session".to_string(),
                )
                .into());
            }
            *active = Some(cancel.clone());
        }
        let guard = InFlightGuard {
            shared,
            turn_id: turn_id.clone(),
        };

        let span = tracing::info_span!(
            "turn",
            session_id = %self.inner.id,
            turn_id = %turn_id.short()
        );
        let report = TurnRunner::new(turn_id, shared)
            .run(&self.inner.transport, text, &self.inner.params, &cancel)
            .instrument(span)
            .await;

        drop(guard);
        Ok(Some(report))
    }

    /// Signals the active turn to stop at its next chunk await. Returns
    /// whether a turn was in flight.
    pub fn cancel(&self) -> bool {
        let shared = &self.inner.shared;
        let active = shared.lock_cancel();
        match active.as_ref() {
            Some(token) if shared.in_flight.load(Ordering::Acquire) => {
                tracing::info!("[⚙️ ] Cancellation requested");
                token.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.inner.shared.in_flight.load(Ordering::Acquire)
    }

    /// State of the current turn, or of the last one once it has ended.
    pub fn status(&self) -> TurnState {
        *self.inner.shared.tx_status.borrow()
    }

    pub fn watch_status(&self) -> watch::Receiver<TurnState> {
        self.inner.shared.tx_status.subscribe()
    }

    /// Ordered snapshot of the transcript.
    pub fn transcript(&self) -> Vec<Message> {
        self.inner.shared.read_transcript().messages().to_vec()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.shared.tx_events.subscribe()
    }

    pub fn updates(&self) -> BroadcastStream<SessionEvent> {
        BroadcastStream::new(self.subscribe())
    }
}
