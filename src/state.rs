//! Shared Application State
//!
//! This module defines the `AppState` struct, which holds the session
//! registry, the audio collaborator, and the process-wide shutdown token.

use crate::audio::AudioSink;
use crate::config::Config;
use crate::registry::SessionRegistry;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The shared application state, created once at startup and passed to all
/// connection tasks.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub audio: Arc<dyn AudioSink>,
    pub config: Arc<Config>,
    /// Cancelled exactly once, on shutdown; every read loop observes it.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Wires up the default collaborators around a fresh registry.
    pub fn new(config: Config) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let audio = Arc::new(crate::audio::BufferingAudioSink::new(registry.clone()));
        Self {
            registry,
            audio,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}
