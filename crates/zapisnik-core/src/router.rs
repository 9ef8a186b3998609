//! Dispatch router with stable/beta track selection
//!
//! Every inbound event is classified into a capability, then routed to
//! exactly one track. The two parallel tracks exist so users can opt
//! into the beta implementation per command; selection is driven by the
//! per-user `beta` field, with fallback to whichever track actually has
//! a handler for the capability. The router holds no state between
//! calls.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::{Context, CoreError};
use crate::event::{Event, EventKind, Reply};
use crate::tracks::messages;
use async_trait::async_trait;
use zapisnik_store::UserId;

/// What an event asks the bot to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Start,
    Info,
    Status,
    Changelog,
    RollDice,
    Menu,
    MemoryMenu,
    ChooseName,
    Remember,
    Recall,
    Forget,
    Feedback,
    Note,
    TrackSelect,
    Donate,
    /// Free text, including continuation of a pending awaiting-input mode.
    FreeText,
    Voice,
    Payment,
}

impl Capability {
    /// Classify an event. Anything unrecognized lands on `FreeText`,
    /// whose handler answers with help rather than dropping the event.
    pub fn of(kind: &EventKind) -> Capability {
        match kind {
            EventKind::Command { name, .. } => match name.as_str() {
                "start" => Capability::Start,
                "info" => Capability::Info,
                "note" => Capability::Note,
                _ => Capability::FreeText,
            },
            EventKind::Button(data) => match data.as_str() {
                "status" => Capability::Status,
                "changelog" => Capability::Changelog,
                "name" => Capability::ChooseName,
                "remember" => Capability::Remember,
                "recall" => Capability::Recall,
                "forget" => Capability::Forget,
                "beta" | "stable" => Capability::TrackSelect,
                "donate" => Capability::Donate,
                _ => Capability::FreeText,
            },
            EventKind::Text(text) => match text.as_str() {
                "Кубик" | "Roll a die" => Capability::RollDice,
                "info" => Capability::Info,
                "Меню" | "Menu" => Capability::Menu,
                "Память" | "Memory" => Capability::MemoryMenu,
                "Вопрос/Отзыв" | "Feedback" => Capability::Feedback,
                _ => Capability::FreeText,
            },
            EventKind::Voice(_) => Capability::Voice,
            EventKind::Payment(_) => Capability::Payment,
        }
    }
}

/// One of the parallel handler implementations (stable or beta).
#[async_trait]
pub trait Track: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this track has a handler for the capability.
    fn supports(&self, cap: Capability) -> bool;

    async fn handle(
        &self,
        ctx: &Context,
        cap: Capability,
        event: &Event,
    ) -> Result<Vec<Reply>, CoreError>;
}

/// Stateless event dispatcher over the two tracks.
pub struct Router {
    ctx: Arc<Context>,
    stable: Arc<dyn Track>,
    beta: Arc<dyn Track>,
}

impl Router {
    pub fn new(ctx: Arc<Context>, stable: Arc<dyn Track>, beta: Arc<dyn Track>) -> Self {
        Self { ctx, stable, beta }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Route one event to one handler and turn its result into replies.
    /// Nothing here is fatal: a storage hiccup or a bad message from one
    /// user must never take down the loop for everyone else.
    pub async fn dispatch(&self, event: Event) -> Vec<Reply> {
        let cap = Capability::of(&event.kind);
        let track = self.select(event.sender, cap);
        debug!(user = event.sender.0, track = track.name(), ?cap, "dispatch");

        match track.handle(&self.ctx, cap, &event).await {
            Ok(replies) => replies,
            Err(CoreError::Store(e)) => {
                warn!(user = event.sender.0, error = %e, "storage failure in handler");
                vec![Reply::text(messages::STORAGE_DOWN)]
            }
            Err(e) => {
                warn!(user = event.sender.0, error = %e, "handler failed");
                vec![Reply::text(messages::SOMETHING_WRONG)]
            }
        }
    }

    /// `beta == "True"` prefers the beta track. A storage failure while
    /// reading the preference falls back to stable rather than surfacing.
    fn prefers_beta(&self, user: UserId) -> bool {
        matches!(
            self.ctx.store.get_field(user, "beta"),
            Ok(Some(v)) if v.as_str() == Some("True")
        )
    }

    /// Two-level lookup: preferred track first, the other as fallback
    /// when the preferred one lacks a handler. Never a silent drop - if
    /// neither supports the capability the preferred track's help path
    /// answers.
    pub(crate) fn select(&self, user: UserId, cap: Capability) -> &dyn Track {
        let (first, second) = if self.prefers_beta(user) {
            (&self.beta, &self.stable)
        } else {
            (&self.stable, &self.beta)
        };
        if first.supports(cap) {
            first.as_ref()
        } else if second.supports(cap) {
            second.as_ref()
        } else {
            first.as_ref()
        }
    }
}
