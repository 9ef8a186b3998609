//! Shared handler context and collaborator traits
//!
//! Everything a handler may touch lives here and is passed by reference,
//! never reached through globals. The traits are the narrow seams to the
//! outside world - their implementations (HTTP, speech APIs, payment
//! providers) live in the frontend crate or not at all in tests.

use async_trait::async_trait;
use std::sync::Arc;

use crate::state::StateMap;
use zapisnik_store::{QuotaTracker, RecordStore, StoreError, UserId};

/// Handler-level failure. User-facing conditions (quota exceeded, bad
/// input, nothing found) are not errors - they are replies. What remains
/// is infrastructure trouble the router turns into an apology.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("notification failed: {0}")]
    Notify(String),

    #[error("refund failed: {0}")]
    Refund(String),
}

/// Why a transcription did not produce text.
#[derive(Debug, thiserror::Error)]
pub enum TranscribeError {
    /// The audio was intelligible to nobody. Expected, user-facing.
    #[error("no speech recognized")]
    NoSpeech,

    /// The service itself failed. Must not consume quota.
    #[error("transcription unavailable: {0}")]
    Unavailable(String),
}

/// Speech-to-text collaborator. Invoked only after the quota tracker
/// grants `Allowed` (or after a paid unlock).
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, file_token: &str) -> Result<String, TranscribeError>;
}

/// Fixed operator destination for forwarded feedback.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify_operator(&self, text: &str) -> Result<(), CoreError>;
}

/// Refund side of the payment provider. Charging happens through
/// [`Reply::Invoice`](crate::Reply::Invoice); only refunds need an API.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn refund(&self, user: UserId, charge_id: &str) -> Result<(), CoreError>;
}

/// Shared state and collaborators handed into every handler invocation.
pub struct Context {
    pub store: Arc<dyn RecordStore>,
    pub states: StateMap,
    pub quota: QuotaTracker,
    pub transcriber: Arc<dyn Transcriber>,
    pub sink: Arc<dyn NotificationSink>,
    pub payments: Arc<dyn PaymentGateway>,
}

impl Context {
    pub fn new(
        store: Arc<dyn RecordStore>,
        transcriber: Arc<dyn Transcriber>,
        sink: Arc<dyn NotificationSink>,
        payments: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            quota: QuotaTracker::new(store.clone()),
            states: StateMap::new(),
            store,
            transcriber,
            sink,
            payments,
        }
    }
}
