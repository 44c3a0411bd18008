use std::collections::HashMap;

use super::transport_model::{MessageChunk, MessageSnapshot};

const DEFAULT_ROLE: &str = "assistant";

/// Per-message buffers for streamed chunks. A buffer is released once its
/// completing chunk arrives.
#[derive(Debug, Default)]
pub struct MessageAccumulator {
    buffers: HashMap<String, MessageSnapshot>,
}

impl MessageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &MessageChunk, current_session: Option<&str>) -> MessageSnapshot {
        let buffer = self
            .buffers
            .entry(chunk.message_id.clone())
            .or_insert_with(|| MessageSnapshot {
                message_id: chunk.message_id.clone(),
                session_id: None,
                role: DEFAULT_ROLE.to_string(),
                content: String::new(),
                is_streaming: true,
            });
        buffer.content.push_str(&chunk.content);
        if let Some(role) = &chunk.role {
            buffer.role = role.clone();
        }
        if let Some(session_id) = chunk.session_id.as_deref().or(current_session) {
            buffer.session_id = Some(session_id.to_string());
        }

        if !chunk.is_complete {
            return buffer.clone();
        }
        let mut done = self
            .buffers
            .remove(&chunk.message_id)
            .unwrap_or_else(|| MessageSnapshot {
                message_id: chunk.message_id.clone(),
                session_id: None,
                role: DEFAULT_ROLE.to_string(),
                content: String::new(),
                is_streaming: true,
            });
        done.is_streaming = false;
        done
    }

    pub fn in_flight(&self) -> usize {
        self.buffers.len()
    }

    pub fn clear(&mut self) {
        self.buffers.clear();
    }
}
