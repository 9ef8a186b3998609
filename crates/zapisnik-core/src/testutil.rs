//! Test fixtures shared by the handler and router tests.

use std::sync::{Arc, Mutex};

use tempfile::NamedTempFile;

use crate::context::{Context, CoreError, NotificationSink, PaymentGateway, TranscribeError, Transcriber};
use crate::router::Router;
use crate::tracks::{BetaTrack, StableTrack};
use async_trait::async_trait;
use zapisnik_store::{RecordStore, SqliteStore, UserId};

/// A full context over a throwaway sqlite file, with recording doubles
/// for every collaborator.
pub(crate) struct TestWorld {
    pub ctx: Arc<Context>,
    pub sink: Arc<RecordingSink>,
    pub gateway: Arc<RecordingGateway>,
    _db: Option<NamedTempFile>,
}

impl TestWorld {
    pub fn router(&self) -> Router {
        Router::new(
            self.ctx.clone(),
            Arc::new(StableTrack),
            Arc::new(BetaTrack),
        )
    }

    /// Same collaborators, different store. For failure injection.
    pub fn with_store(self, store: Arc<dyn RecordStore>) -> Self {
        let ctx = Context::new(
            store,
            self.ctx.transcriber.clone(),
            self.sink.clone(),
            self.gateway.clone(),
        );
        Self {
            ctx: Arc::new(ctx),
            sink: self.sink,
            gateway: self.gateway,
            _db: self._db,
        }
    }
}

pub(crate) fn world() -> TestWorld {
    world_with_transcriber(Arc::new(OkTranscriber))
}

pub(crate) fn world_with_transcriber(transcriber: Arc<dyn Transcriber>) -> TestWorld {
    let db = NamedTempFile::new().unwrap();
    let store = Arc::new(SqliteStore::open(db.path().to_path_buf()).unwrap());
    let sink = Arc::new(RecordingSink::default());
    let gateway = Arc::new(RecordingGateway::default());
    let ctx = Context::new(store, transcriber, sink.clone(), gateway.clone());
    TestWorld {
        ctx: Arc::new(ctx),
        sink,
        gateway,
        _db: Some(db),
    }
}

/// Always succeeds, echoing the token so tests can assert the right
/// file was transcribed.
pub(crate) struct OkTranscriber;

#[async_trait]
impl Transcriber for OkTranscriber {
    async fn transcribe(&self, file_token: &str) -> Result<String, TranscribeError> {
        Ok(format!("speech from {file_token}"))
    }
}

pub(crate) struct NoSpeechTranscriber;

#[async_trait]
impl Transcriber for NoSpeechTranscriber {
    async fn transcribe(&self, _file_token: &str) -> Result<String, TranscribeError> {
        Err(TranscribeError::NoSpeech)
    }
}

#[derive(Default)]
pub(crate) struct RecordingSink {
    pub sent: Mutex<Vec<String>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify_operator(&self, text: &str) -> Result<(), CoreError> {
        self.sent.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingGateway {
    pub refunds: Mutex<Vec<String>>,
}

#[async_trait]
impl PaymentGateway for RecordingGateway {
    async fn refund(&self, _user: UserId, charge_id: &str) -> Result<(), CoreError> {
        self.refunds.lock().unwrap().push(charge_id.to_string());
        Ok(())
    }
}
