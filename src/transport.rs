//! The seam between the session layer and the underlying WebSocket.
//!
//! The registry and dispatcher only ever talk to a [`MessageSink`], so unit
//! tests can substitute a recording sink without opening real sockets.

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::{SinkExt, stream::SplitSink};

/// The write half of one session's transport connection.
///
/// Implementations are owned exclusively by their session record; the
/// per-session send gate in [`crate::registry::Session`] provides all
/// mutual exclusion.
#[async_trait]
pub trait MessageSink: Send {
    /// Transmits one text frame.
    async fn send_text(&mut self, text: String) -> Result<()>;
    /// Transmits one binary frame.
    async fn send_binary(&mut self, bytes: Bytes) -> Result<()>;
    /// Initiates the close handshake and releases the connection.
    async fn close(&mut self) -> Result<()>;
}

/// [`MessageSink`] implementation over the write half of an axum WebSocket.
pub struct WsSink(SplitSink<WebSocket, Message>);

impl WsSink {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self(sink)
    }
}

#[async_trait]
impl MessageSink for WsSink {
    async fn send_text(&mut self, text: String) -> Result<()> {
        self.0.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn send_binary(&mut self, bytes: Bytes) -> Result<()> {
        self.0.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // The peer may already be gone; a failed close frame is not an error.
        let _ = self.0.send(Message::Close(None)).await;
        let _ = self.0.close().await;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use anyhow::anyhow;
    use std::sync::{Arc, Mutex};

    /// One frame captured by a [`RecordingSink`].
    #[derive(Debug, Clone, PartialEq)]
    pub enum SentFrame {
        Text(String),
        Binary(Bytes),
        Close,
    }

    /// A sink that records every frame for later assertions.
    pub struct RecordingSink {
        frames: Arc<Mutex<Vec<SentFrame>>>,
        fail_sends: bool,
    }

    impl RecordingSink {
        pub fn new() -> (Self, Arc<Mutex<Vec<SentFrame>>>) {
            let frames = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    frames: frames.clone(),
                    fail_sends: false,
                },
                frames,
            )
        }

        pub fn failing() -> (Self, Arc<Mutex<Vec<SentFrame>>>) {
            let frames = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    frames: frames.clone(),
                    fail_sends: true,
                },
                frames,
            )
        }
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send_text(&mut self, text: String) -> Result<()> {
            if self.fail_sends {
                return Err(anyhow!("sink failure"));
            }
            self.frames.lock().unwrap().push(SentFrame::Text(text));
            Ok(())
        }

        async fn send_binary(&mut self, bytes: Bytes) -> Result<()> {
            if self.fail_sends {
                return Err(anyhow!("sink failure"));
            }
            self.frames.lock().unwrap().push(SentFrame::Binary(bytes));
            Ok(())
        }

        async fn close(&mut self) -> Result<()> {
            self.frames.lock().unwrap().push(SentFrame::Close);
            Ok(())
        }
    }
}
