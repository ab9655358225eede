//! Turn state machine: one user dispatch driven to a terminal state.
//!
//! `Idle -> Dispatched -> Streaming -> {Completed, Errored, Cancelled}`.
//! The runner is the only writer to the open assistant message while the
//! turn is in flight. Cancellation is observed at every chunk await.

use std::fmt;
use std::ops::ControlFlow;

use futures_util::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::classify::classify_frame;
use crate::config::GenerationParams;
use crate::constants::ERROR_TAG;
use crate::framing::FrameReassembler;
use crate::logging::StreamMetric;
use crate::session::{SessionEvent, SessionShared};
use crate::transport::Transport;
use crate::types::{ChatRequest, Message, MessageId, ObservedError, Role, StreamEvent, TurnId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TurnState {
    Idle,
    Dispatched,
    Streaming,
    Completed,
    Errored,
    Cancelled,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Dispatched => "dispatched",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Inline transcript annotation for a reported error.
pub fn error_annotation(message: &str) -> String {
    format!("\n{} {}", ERROR_TAG, message)
}

/// Outcome of one turn as seen by the dispatcher.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn_id: TurnId,
    pub state: TurnState,
    pub user_id: MessageId,
    pub assistant_id: MessageId,
    /// Final content of the assistant message.
    pub content: String,
    /// Transport failure that ended the turn, if any.
    pub error: Option<String>,
    pub metrics: StreamMetric,
}

pub struct TurnRunner<'a> {
    turn_id: TurnId,
    shared: &'a SessionShared,
    state: TurnState,
    reassembler: FrameReassembler,
    metrics: StreamMetric,
    user_id: MessageId,
    assistant_id: MessageId,
}

impl<'a> TurnRunner<'a> {
    pub(crate) fn new(turn_id: TurnId, shared: &'a SessionShared) -> Self {
        Self {
            turn_id,
            shared,
            state: TurnState::Idle,
            reassembler: FrameReassembler::new(),
            metrics: StreamMetric::new(),
            user_id: MessageId::default(),
            assistant_id: MessageId::default(),
        }
    }

    pub async fn run<T: Transport>(
        mut self,
        transport: &T,
        user_text: &str,
        params: &GenerationParams,
        cancel: &CancellationToken,
    ) -> TurnReport {
        let request = self.begin(user_text, params);

        tracing::info!(
            "[⚙️ ] Dispatching turn [History: {}]",
            request.messages.len()
        );

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return self.cancelled(),
            opened = transport.open(request) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return self.fail(e),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return self.cancelled(),
                next = stream.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    if self.state == TurnState::Dispatched {
                        self.transition(TurnState::Streaming);
                    }
                    self.metrics.record_chunk(chunk.len());
                    if self.consume(&chunk).is_break() {
                        tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
                        return self.finish(TurnState::Completed, None);
                    }
                }
                Some(Err(e)) => return self.fail(e),
                None => {
                    self.metrics.dropped_tail_bytes = self.reassembler.finish();
                    tracing::debug!("[☁️  -> ⚙️ ] Stream closed without [DONE]");
                    return self.finish(TurnState::Completed, None);
                }
            }
        }
    }

    /// Idle -> Dispatched: records the user message, opens the assistant
    /// placeholder and builds the outbound request.
    fn begin(&mut self, user_text: &str, params: &GenerationParams) -> ChatRequest {
        let messages = {
            let mut transcript = self.shared.write_transcript();
            self.user_id = transcript.push(Message::user(user_text));
            let messages = transcript.wire_history();
            self.assistant_id = transcript.open_assistant();
            messages
        };

        self.shared.emit(SessionEvent::MessageAppended {
            id: self.user_id.clone(),
            role: Role::User,
        });
        self.shared.emit(SessionEvent::MessageAppended {
            id: self.assistant_id.clone(),
            role: Role::Assistant,
        });
        self.transition(TurnState::Dispatched);

        ChatRequest {
            messages,
            temperature: params.temperature,
            model: params.model.clone(),
            max_tokens: params.max_tokens,
        }
    }

    fn consume(&mut self, chunk: &[u8]) -> ControlFlow<()> {
        let frames = self.reassembler.push(chunk);
        self.metrics.record_frames(frames.len());
        for frame in frames {
            for event in classify_frame(&frame) {
                self.apply(event)?;
            }
        }
        ControlFlow::Continue(())
    }

    fn apply(&mut self, event: StreamEvent) -> ControlFlow<()> {
        self.metrics.record_event(&event);
        match event {
            StreamEvent::TextDelta(text) => self.append(&text),
            StreamEvent::ErrorEvent(message) => {
                tracing::warn!("[☁️  -> ⚙️ ] Service reported error mid-stream: {}", message);
                self.append(&error_annotation(&message));
            }
            StreamEvent::StatusPing => {}
            StreamEvent::Termination => return ControlFlow::Break(()),
        }
        ControlFlow::Continue(())
    }

    fn append(&mut self, text: &str) {
        if text.is_empty() {
            return;
        }
        let applied = self.shared.write_transcript().append_to_open(text);
        if applied {
            self.shared.emit(SessionEvent::ContentAppended {
                id: self.assistant_id.clone(),
                delta: text.to_string(),
            });
        } else {
            tracing::warn!("[⚙️ ] Delta arrived with no open message; discarded");
        }
    }

    fn transition(&mut self, next: TurnState) {
        tracing::debug!("[⚙️ ] Turn state {} -> {}", self.state, next);
        self.state = next;
        self.shared.tx_status.send_replace(next);
        self.shared.emit(SessionEvent::TurnStateChanged {
            turn_id: self.turn_id.clone(),
            state: next,
        });
    }

    fn cancelled(self) -> TurnReport {
        tracing::info!("[⚙️ ] Turn cancelled in state {}", self.state);
        self.finish(TurnState::Cancelled, None)
    }

    fn fail(mut self, e: ObservedError) -> TurnReport {
        let message = e.inner.to_string();
        if e.inner.is_transport() {
            tracing::error!("[⚙️  -> ☁️ ] Could not open stream in state {}: {}", self.state, message);
        } else {
            tracing::warn!("[☁️  -> ⚙️ ] Stream broke off in state {}: {}", self.state, message);
        }
        tracing::debug!("Span trace:\n{}", e.span_trace);
        self.append(&error_annotation(&message));
        self.finish(TurnState::Errored, Some(message))
    }

    fn finish(mut self, state: TurnState, error: Option<String>) -> TurnReport {
        let content = {
            let mut transcript = self.shared.write_transcript();
            transcript.close_open();
            match transcript.get(&self.assistant_id) {
                Some(message) => message.content.clone(),
                None => String::new(),
            }
        };
        self.transition(state);
        self.metrics.log_summary(&self.turn_id, state);

        TurnReport {
            turn_id: self.turn_id,
            state,
            user_id: self.user_id,
            assistant_id: self.assistant_id,
            content,
            error,
            metrics: self.metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!TurnState::Idle.is_terminal());
        assert!(!TurnState::Dispatched.is_terminal());
        assert!(!TurnState::Streaming.is_terminal());
        assert!(TurnState::Completed.is_terminal());
        assert!(TurnState::Errored.is_terminal());
        assert!(TurnState::Cancelled.is_terminal());
    }

    #[test]
    fn test_error_annotation_format() {
        assert_eq!(error_annotation("rate limited"), "\n[error] rate limited");
    }
}
