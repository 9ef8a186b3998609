//! Inbound events and outbound replies
//!
//! The transport adapter translates its wire types into these and back.
//! Nothing here knows about chat markup, keyboards, or file downloads.

use serde::{Deserialize, Serialize};
use zapisnik_store::UserId;

/// One inbound event from the messaging transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sender: UserId,
    pub kind: EventKind,
}

impl Event {
    pub fn text(sender: UserId, text: impl Into<String>) -> Self {
        Self {
            sender,
            kind: EventKind::Text(text.into()),
        }
    }

    pub fn button(sender: UserId, data: impl Into<String>) -> Self {
        Self {
            sender,
            kind: EventKind::Button(data.into()),
        }
    }

    pub fn command(sender: UserId, name: impl Into<String>, args: impl Into<String>) -> Self {
        Self {
            sender,
            kind: EventKind::Command {
                name: name.into(),
                args: args.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventKind {
    /// Slash command with whatever followed it.
    Command { name: String, args: String },
    /// Inline button press, identified by its callback data.
    Button(String),
    /// Free text (including reply-keyboard labels).
    Text(String),
    Voice(VoiceNote),
    Payment(PaymentNotice),
}

/// A voice attachment. The token is opaque to the core; the transcriber
/// collaborator knows how to fetch the audio behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceNote {
    pub file_token: String,
}

/// A completed charge reported by the payment collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentNotice {
    /// Opaque `feature:token` payload echoed back from the invoice.
    pub payload: String,
    /// Provider charge id, needed to refund. Absent on some providers.
    pub charge_id: Option<String>,
}

/// What a handler wants sent back. Rendering is the frontend's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reply {
    Text(String),
    /// Roll a die; the transport produces and shows the value.
    Dice,
    Invoice(Invoice),
}

impl Reply {
    pub fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }
}

/// A payment request in provider-neutral terms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub title: String,
    pub description: String,
    /// Comes back verbatim in [`PaymentNotice::payload`].
    pub payload: String,
    pub label: String,
    pub amount: u32,
}
