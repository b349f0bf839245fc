//! Signal subscriptions and the routing of inbound signals to them.

use crate::{
    error::{Error, Result},
    message::{Message, MessageKind},
    names::NameKind,
};
use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    str::FromStr,
    sync::Arc,
};
use tracing::{error, trace};

pub type SignalHandler = Arc<dyn Fn(&Message) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

/// A signal match rule, `type='signal',sender='...',path='...',...`.
///
/// Absent fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub sender: Option<String>,
    pub path: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
}

impl MatchRule {
    /// A rule matching exactly one signal of one object.
    pub fn signal(sender: &str, path: &str, interface: &str, member: &str) -> Result<Self> {
        let rule = Self {
            sender: Some(sender.to_owned()),
            path: Some(path.to_owned()),
            interface: Some(interface.to_owned()),
            member: Some(member.to_owned()),
        };
        rule.validate()?;
        Ok(rule)
    }

    fn validate(&self) -> Result<()> {
        let fields = [
            (NameKind::BusName, &self.sender),
            (NameKind::ObjectPath, &self.path),
            (NameKind::Interface, &self.interface),
            (NameKind::Member, &self.member),
        ];
        for (kind, value) in fields {
            if let Some(name) = value {
                if !kind.check(name) {
                    return Err(Error::InvalidName {
                        kind,
                        name: name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn matches(&self, message: &Message) -> bool {
        self.matches_owned(message, None)
    }

    /// Like [`matches`](Self::matches), but a rule sender is also satisfied
    /// when `owner` (the unique name currently owning it) sent the message.
    pub(crate) fn matches_owned(&self, message: &Message, owner: Option<&str>) -> bool {
        fn field(want: &Option<String>, got: Option<&str>) -> bool {
            want.as_deref().map_or(true, |want| Some(want) == got)
        }
        let sender_ok = field(&self.sender, message.sender())
            || (owner.is_some() && owner == message.sender());
        message.kind() == MessageKind::Signal
            && sender_ok
            && field(&self.path, message.path())
            && field(&self.interface, message.interface())
            && field(&self.member, message.member())
    }
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("type='signal'")?;
        let fields = [
            ("sender", &self.sender),
            ("path", &self.path),
            ("interface", &self.interface),
            ("member", &self.member),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                write!(f, ",{key}='{value}'")?;
            }
        }
        Ok(())
    }
}

impl FromStr for MatchRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidMatchRule(s.to_owned());
        let mut rule = MatchRule::default();
        let mut signal = false;
        for item in s.split(',').filter(|item| !item.is_empty()) {
            let (key, value) = item.split_once('=').ok_or_else(invalid)?;
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .ok_or_else(invalid)?
                .to_owned();
            match key.trim() {
                "type" if value == "signal" => signal = true,
                "sender" => rule.sender = Some(value),
                "path" => rule.path = Some(value),
                "interface" => rule.interface = Some(value),
                "member" => rule.member = Some(value),
                _ => return Err(invalid()),
            }
        }
        if !signal {
            return Err(invalid());
        }
        rule.validate().map_err(|_| invalid())?;
        Ok(rule)
    }
}

struct Subscription {
    id: SubscriptionId,
    rule: MatchRule,
    handler: SignalHandler,
}

/// Per-connection subscription list. Duplicate rules are allowed; each
/// subscription fires independently.
#[derive(Default)]
pub struct SignalRouter {
    next_id: u64,
    subscriptions: Vec<Subscription>,
    filter_installed: bool,
}

impl SignalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, rule: MatchRule, handler: SignalHandler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        trace!(?id, %rule, "signal subscription added");
        self.subscriptions.push(Subscription { id, rule, handler });
        id
    }

    /// Remove one subscription, returning its rule.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> Option<MatchRule> {
        let index = self.subscriptions.iter().position(|s| s.id == id)?;
        Some(self.subscriptions.remove(index).rule)
    }

    /// Returns `true` the first time it is called.
    pub(crate) fn install_filter(&mut self) -> bool {
        !std::mem::replace(&mut self.filter_installed, true)
    }

    pub fn len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty()
    }

    /// Handlers of every subscription matching `message`, in subscription
    /// order.
    pub fn matching(&self, message: &Message) -> Vec<SignalHandler> {
        self.subscriptions
            .iter()
            .filter(|s| s.rule.matches(message))
            .map(|s| s.handler.clone())
            .collect()
    }
}

/// Run each handler on `message`. A panicking handler is logged and does not
/// keep the rest from running.
pub fn deliver(handlers: &[SignalHandler], message: &Message) {
    for handler in handlers {
        if catch_unwind(AssertUnwindSafe(|| handler(message))).is_err() {
            error!(%message, "signal handler panicked");
        }
    }
}
