//! Zapisnik Core - event routing and conversation state
//!
//! This crate contains the shared logic between frontends: the inbound
//! event model, the per-user conversation state machine, and the
//! dispatch router with its stable/beta handler tracks. The messaging
//! transport, speech recognition, and the payment provider stay behind
//! the collaborator traits in [`context`].

pub mod context;
pub mod event;
pub mod router;
pub mod state;
pub mod tracks;

#[cfg(test)]
pub(crate) mod testutil;

pub use context::{Context, CoreError, NotificationSink, PaymentGateway, Transcriber, TranscribeError};
pub use event::{Event, EventKind, Invoice, PaymentNotice, Reply, VoiceNote};
pub use router::{Capability, Router, Track};
pub use state::{AwaitMode, StateMap};
pub use tracks::{BetaTrack, StableTrack, VOICE_FEATURE, VOICE_WEEKLY_LIMIT};

pub use zapisnik_store::UserId;
