//! Per-user conversation state
//!
//! A user is either idle or awaiting one kind of free-text input. The
//! map replaces the global `keyboard_input` dict this grew out of: it is
//! owned by the [`Context`](crate::Context) and handed to handlers, so
//! tests can build their own.
//!
//! Exactly one mode per user. A new menu action overwrites whatever was
//! pending, and the next free-text message consumes the mode no matter
//! what - malformed input gets one answer and the user re-triggers the
//! menu.

use std::collections::HashMap;
use std::sync::Mutex;

use zapisnik_store::UserId;

/// What the next free-text message from a user means. Idle users simply
/// have no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitMode {
    /// Next message becomes the `name` field.
    Name,
    /// Next message is forwarded to the operator.
    Feedback,
    /// Next message is a `key value` pair to store.
    Remember,
    /// Next message names what to delete.
    Forget,
}

/// Keyed conversation-state store, safe under concurrent access by
/// different users.
#[derive(Debug, Default)]
pub struct StateMap {
    inner: Mutex<HashMap<UserId, AwaitMode>>,
}

impl StateMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, AwaitMode>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the pending mode, unconditionally overwriting any prior one.
    pub fn set(&self, user: UserId, mode: AwaitMode) {
        self.map().insert(user, mode);
    }

    /// Consume the pending mode, leaving the user idle.
    pub fn take(&self, user: UserId) -> Option<AwaitMode> {
        self.map().remove(&user)
    }

    /// Peek without clearing.
    pub fn current(&self, user: UserId) -> Option<AwaitMode> {
        self.map().get(&user).copied()
    }

    pub fn clear(&self, user: UserId) {
        self.map().remove(&user);
    }
}
