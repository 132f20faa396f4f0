//! The audio collaborator fed by binary WebSocket frames.
//!
//! The connection read loop hands raw bytes here without interpreting them;
//! transcription or forwarding would plug in behind this trait.

use crate::registry::SessionRegistry;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

/// Receives the raw binary frames of one session, in arrival order.
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn handle_binary(&self, session_id: &str, bytes: Bytes);
}

/// Default [`AudioSink`]: appends each frame to the session's logical
/// audio buffer and records the byte count.
pub struct BufferingAudioSink {
    registry: Arc<SessionRegistry>,
}

impl BufferingAudioSink {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl AudioSink for BufferingAudioSink {
    async fn handle_binary(&self, session_id: &str, bytes: Bytes) {
        let Some(session) = self.registry.get(session_id) else {
            warn!(session_id, "Binary frame for unknown session dropped");
            return;
        };
        let total = {
            let mut storage = session.storage.lock().unwrap();
            storage.audio_buffer.extend_from_slice(&bytes);
            storage.audio_buffer.len()
        };
        debug!(session_id, frame_bytes = bytes.len(), buffered_bytes = total, "Buffered audio frame");
    }
}
