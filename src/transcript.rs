use crate::types::{Message, MessageId, WireMessage};

/// Ordered, append-only conversation record with an explicit slot for the
/// single assistant message currently receiving deltas.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    open: Option<MessageId>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn push(&mut self, message: Message) -> MessageId {
        let id = message.id.clone();
        self.messages.push(message);
        id
    }

    /// History as sent to the service. The open placeholder is never part of
    /// it.
    pub fn wire_history(&self) -> Vec<WireMessage> {
        self.messages
            .iter()
            .filter(|m| Some(&m.id) != self.open.as_ref())
            .map(Message::to_wire)
            .collect()
    }

    /// Appends an empty assistant message and marks it open. A message left
    /// open by an earlier turn is closed first.
    pub fn open_assistant(&mut self) -> MessageId {
        if let Some(stale) = self.open.take() {
            tracing::warn!("[TRANSCRIPT] Closing stale open message {}", stale);
        }
        let id = self.push(Message::assistant_placeholder());
        self.open = Some(id.clone());
        id
    }

    /// Appends to the open message; returns false when nothing is open.
    pub fn append_to_open(&mut self, text: &str) -> bool {
        let Some(open) = self.open.as_ref() else {
            return false;
        };
        match self.messages.iter_mut().rev().find(|m| &m.id == open) {
            Some(message) => {
                message.content.push_str(text);
                true
            }
            None => false,
        }
    }

    pub fn close_open(&mut self) -> Option<MessageId> {
        self.open.take()
    }
}
