//! Voice query adapter
//!
//! Consumes transcript events from an external recognizer and feeds the
//! text into the query engine. The capture session models the input device
//! as a scoped resource: starting a session acquires exclusive device
//! access, and the permit is released on every exit path (explicit stop,
//! recognition completion, or error) because it is dropped with the
//! session. Transcription itself is out of scope.

use crate::query::{FilterSet, QueryEngine, QueryError};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// One recognizer emission
#[derive(Debug, Clone)]
pub struct TranscriptEvent {
    pub text: String,
    pub is_final: bool,
}

/// External collaborator producing transcript events
#[async_trait]
pub trait TranscriptSource: Send {
    /// Next transcript event; None when the capture stream ends
    async fn next_event(&mut self) -> Option<TranscriptEvent>;
}

/// Voice query errors
#[derive(Debug, Error)]
pub enum VoiceError {
    /// Another capture session holds the input device
    #[error("voice capture device busy")]
    DeviceBusy,

    /// The capture stream ended without producing any transcript
    #[error("capture session ended without a transcript")]
    NoTranscript,

    #[error(transparent)]
    Query(#[from] QueryError),
}

/// Entry point for voice-driven search
pub struct VoiceQueryAdapter {
    engine: Arc<QueryEngine>,
    device: Arc<Semaphore>,
}

impl VoiceQueryAdapter {
    pub fn new(engine: Arc<QueryEngine>) -> Self {
        Self {
            engine,
            device: Arc::new(Semaphore::new(1)),
        }
    }

    /// Acquire the input device and start a capture session
    pub fn start_session(&self) -> Result<VoiceQuerySession, VoiceError> {
        let permit = Arc::clone(&self.device)
            .try_acquire_owned()
            .map_err(|_| VoiceError::DeviceBusy)?;
        tracing::debug!("Voice capture session started");
        Ok(VoiceQuerySession {
            engine: Arc::clone(&self.engine),
            _permit: permit,
        })
    }
}

/// Exclusive capture session; dropping it releases the device
pub struct VoiceQuerySession {
    engine: Arc<QueryEngine>,
    _permit: OwnedSemaphorePermit,
}

impl VoiceQuerySession {
    /// Consume transcript events until a final transcript arrives, then run
    /// the search. If the stream ends early, the last partial transcript is
    /// used instead. Consumes the session, so the device is released no
    /// matter how this returns.
    pub async fn run(
        self,
        mut source: impl TranscriptSource,
        filters: &FilterSet,
    ) -> Result<Vec<Uuid>, VoiceError> {
        let mut last_partial: Option<String> = None;

        while let Some(event) = source.next_event().await {
            if event.is_final {
                tracing::debug!(text = %event.text, "Final transcript received");
                return Ok(self.engine.search(&event.text, filters)?);
            }
            tracing::trace!(text = %event.text, "Partial transcript");
            last_partial = Some(event.text);
        }

        match last_partial {
            Some(text) => {
                tracing::debug!(text = %text, "Capture ended early, searching last partial");
                Ok(self.engine.search(&text, filters)?)
            }
            None => Err(VoiceError::NoTranscript),
        }
    }
}
