//! Delivery correlation table.
//!
//! Maps each in-flight [`DeliveryToken`] to the completion handler waiting
//! for it. Two parties race on every token: the publishing task registers
//! the handler once the transport has returned the token, and the
//! transport's notification context reports the broker acknowledgement.
//! Either may come first.
//!
//! Per token:
//!
//! ```text
//! (absent) --register--> Awaiting --confirm--> (absent, handler completed)
//! (absent) --confirm---> ConfirmedEarly --register--> (absent, handler completed)
//! ```
//!
//! Whichever side arrives second completes the handler and removes the
//! entry; the first leaves either the handler or a `ConfirmedEarly`
//! sentinel behind. All decisions are taken under one mutex, but handlers
//! are handed back to the caller and invoked after the lock is released, so
//! a handler may call back into the correlator.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::{log_debug, log_error, log_warn, DeliveryToken, ReasonCode};

/// Final outcome of a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The broker acknowledged the message.
    Delivered,

    /// The transport refused the handoff.
    Rejected(ReasonCode),

    /// The connection was not usable at publish time.
    Unusable,

    /// The connection went away before the acknowledgement arrived.
    ConnectionLost,
}

impl Outcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Outcome::Delivered)
    }

    /// Numeric reason: `0` on success, the transport's code otherwise.
    pub fn reason_code(&self) -> ReasonCode {
        // ---
        match self {
            Outcome::Delivered => ReasonCode::SUCCESS,
            Outcome::Rejected(code) => *code,
            Outcome::Unusable | Outcome::ConnectionLost => ReasonCode::DISCONNECTED,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Delivered => f.write_str("delivered"),
            Outcome::Rejected(code) => write!(f, "rejected ({code})"),
            Outcome::Unusable => f.write_str("connection unusable"),
            Outcome::ConnectionLost => f.write_str("connection lost"),
        }
    }
}

/// Single-use completion handler supplied with each publish.
pub type CompletionHandler = Box<dyn FnOnce(Outcome) + Send + 'static>;

enum Slot {
    Awaiting(CompletionHandler),
    ConfirmedEarly,
}

/// What a registration decided.
pub(crate) enum Registration {
    /// Handler stored; the acknowledgement is still outstanding.
    Pending,

    /// Handler must be completed by the caller with the given outcome.
    Resolved(CompletionHandler, Outcome),
}

#[derive(Default)]
struct Slots {
    entries: HashMap<DeliveryToken, Slot>,
    // Set once pending entries have been flushed; late registrations are
    // failed instead of stored.
    closed: bool,
}

/// Token → pending handler table shared by publishers and the notification
/// context.
#[derive(Default)]
pub(crate) struct CorrelationTable {
    slots: Mutex<Slots>,
}

/// Acquire mutex guard, ignoring poisoning
fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl CorrelationTable {
    // ---

    pub fn new() -> Self {
        Self::default()
    }

    /// Record `handler` for `token` after a successful handoff.
    pub fn register(&self, token: DeliveryToken, handler: CompletionHandler) -> Registration {
        // ---
        let mut slots = lock_ignore_poison(&self.slots);

        match slots.entries.remove(&token) {
            None if slots.closed => Registration::Resolved(handler, Outcome::ConnectionLost),
            None => {
                slots.entries.insert(token, Slot::Awaiting(handler));
                Registration::Pending
            }
            Some(Slot::ConfirmedEarly) => {
                log_debug!("delivery token {token} already delivered");
                Registration::Resolved(handler, Outcome::Delivered)
            }
            Some(existing @ Slot::Awaiting(_)) => {
                // The transport issued a token that is still in flight. Keep
                // the first registration; the second cannot be tracked.
                log_error!("delivery token {token} issued twice while in flight");
                slots.entries.insert(token, existing);
                Registration::Resolved(handler, Outcome::Rejected(ReasonCode::FAILURE))
            }
        }
    }

    /// Record the broker acknowledgement for `token`.
    ///
    /// Returns the handler to complete when one was waiting; otherwise leaves
    /// a sentinel for the registration still on its way.
    pub fn confirm(&self, token: DeliveryToken) -> Option<CompletionHandler> {
        // ---
        let mut slots = lock_ignore_poison(&self.slots);

        match slots.entries.remove(&token) {
            Some(Slot::Awaiting(handler)) => Some(handler),
            Some(Slot::ConfirmedEarly) => {
                log_warn!("duplicate delivery confirmation for token {token}");
                slots.entries.insert(token, Slot::ConfirmedEarly);
                None
            }
            None => {
                log_debug!("delivery token {token} not yet registered");
                slots.entries.insert(token, Slot::ConfirmedEarly);
                None
            }
        }
    }

    /// Remove every waiting handler and refuse further registrations.
    ///
    /// Sentinels stay in place: a registration that already received its
    /// acknowledgement still resolves as delivered.
    pub fn flush(&self) -> Vec<(DeliveryToken, CompletionHandler)> {
        // ---
        let mut slots = lock_ignore_poison(&self.slots);
        slots.closed = true;

        let tokens: Vec<DeliveryToken> = slots
            .entries
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Awaiting(_)))
            .map(|(token, _)| *token)
            .collect();

        let mut flushed = Vec::with_capacity(tokens.len());
        for token in tokens {
            if let Some(Slot::Awaiting(handler)) = slots.entries.remove(&token) {
                flushed.push((token, handler));
            }
        }
        flushed
    }

    /// Number of entries, sentinels included.
    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.slots).entries.len()
    }

    /// Number of handlers still waiting for an acknowledgement.
    pub fn awaiting(&self) -> usize {
        // ---
        lock_ignore_poison(&self.slots)
            .entries
            .values()
            .filter(|slot| matches!(slot, Slot::Awaiting(_)))
            .count()
    }
}
