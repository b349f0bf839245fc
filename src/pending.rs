//! Correlation of outstanding method calls with their replies.
//!
//! Every call that expects a reply registers its serial here together with
//! a one-shot callback and an optional deadline. A matching reply, a
//! timeout, or a disconnect removes the entry, so each callback runs at most
//! once.

use crate::{
    message::{Message, MessageKind},
    names::{ERROR_DISCONNECTED, ERROR_TIMEOUT},
};
use std::collections::HashMap;
use tokio::time::Instant;
use tracing::trace;

pub type ReplyCallback = Box<dyn FnOnce(Message) + Send>;

struct PendingCall {
    callback: ReplyCallback,
    deadline: Option<Instant>,
}

#[derive(Default)]
pub struct PendingCalls {
    calls: HashMap<u32, PendingCall>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, serial: u32, deadline: Option<Instant>, callback: ReplyCallback) {
        trace!(serial, ?deadline, "pending call registered");
        self.calls.insert(serial, PendingCall { callback, deadline });
    }

    /// Take the callback waiting for `reply_serial`, if any.
    pub fn resolve(&mut self, reply_serial: u32) -> Option<ReplyCallback> {
        self.calls.remove(&reply_serial).map(|call| call.callback)
    }

    pub fn contains(&self, serial: u32) -> bool {
        self.calls.contains_key(&serial)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.calls.values().filter_map(|call| call.deadline).min()
    }

    /// Remove every call whose deadline is at or before `now`, paired with
    /// the synthetic timeout error each one resolves with.
    pub fn expire(&mut self, now: Instant, own_name: Option<&str>) -> Vec<(ReplyCallback, Message)> {
        let expired: Vec<u32> = self
            .calls
            .iter()
            .filter(|(_, call)| call.deadline.map_or(false, |d| d <= now))
            .map(|(&serial, _)| serial)
            .collect();
        expired
            .into_iter()
            .filter_map(|serial| {
                let call = self.calls.remove(&serial)?;
                trace!(serial, "pending call timed out");
                Some((
                    call.callback,
                    synthetic_error(serial, ERROR_TIMEOUT, "Did not receive a reply", own_name),
                ))
            })
            .collect()
    }

    /// Remove every call, paired with a `Disconnected` error.
    pub fn drain(&mut self, own_name: Option<&str>) -> Vec<(ReplyCallback, Message)> {
        self.calls
            .drain()
            .map(|(serial, call)| {
                (
                    call.callback,
                    synthetic_error(serial, ERROR_DISCONNECTED, "Connection closed", own_name),
                )
            })
            .collect()
    }
}

/// An error message that looks like it came from the bus in answer to
/// call `serial`.
pub(crate) fn synthetic_error(
    serial: u32,
    error_name: &str,
    text: &str,
    own_name: Option<&str>,
) -> Message {
    let mut message = Message::new(MessageKind::Error);
    _ = message.set_reply_serial(serial);
    _ = message.set_error_name(error_name);
    if let Some(name) = own_name {
        _ = message.set_destination(name);
    }
    _ = message.set_args("s", vec![text.into()]);
    message
}
