//! An in-process message bus.
//!
//! [`MemoryBus`] routes messages between the connections attached to it the
//! way a bus daemon does: it hands out unique names, stamps senders, keeps
//! track of well-known name ownership and match rules, and answers the
//! administrative `org.freedesktop.DBus` methods itself. Peers attach
//! in-process with [`MemoryBus::connect`] or over a byte stream with
//! [`MemoryBus::serve_stream`] / [`MemoryBus::serve_tcp`].

use super::{stream, Serials, Transport, TransportError};
use crate::{
    message::{Message, MessageKind},
    names::{self, *},
    signals::MatchRule,
    types::Value,
};
use futures::{
    future::{ready, BoxFuture},
    FutureExt, SinkExt, StreamExt,
};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, ToSocketAddrs},
    sync::mpsc,
    task,
};
use tracing::{debug, trace, warn};

/// Replies to `RequestName`.
pub const REQUEST_NAME_PRIMARY_OWNER: u32 = 1;
pub const REQUEST_NAME_EXISTS: u32 = 3;
pub const REQUEST_NAME_ALREADY_OWNER: u32 = 4;

/// Replies to `ReleaseName`.
pub const RELEASE_NAME_RELEASED: u32 = 1;
pub const RELEASE_NAME_NON_EXISTENT: u32 = 2;
pub const RELEASE_NAME_NOT_OWNER: u32 = 3;

struct Peer {
    tx: mpsc::UnboundedSender<Message>,
    /// A multiset: every `AddMatch` adds one entry.
    rules: Vec<MatchRule>,
}

#[derive(Default)]
struct BusState {
    next_peer: u64,
    peers: HashMap<String, Peer>,
    /// Well-known name to owning unique name.
    owners: BTreeMap<String, String>,
}

impl BusState {
    fn resolve(&self, name: &str) -> Option<String> {
        if self.peers.contains_key(name) {
            Some(name.to_owned())
        } else {
            self.owners.get(name).cloned()
        }
    }

    fn names(&self) -> Vec<String> {
        let mut names = vec![SERVICE_DBUS.to_owned()];
        names.extend(self.owners.keys().cloned());
        names.extend(self.peers.keys().cloned());
        names
    }

    fn deliver(&self, peer: &str, message: Message) {
        match self.peers.get(peer) {
            Some(p) => {
                trace!(%peer, %message, "deliver");
                _ = p.tx.send(message);
            }
            None => trace!(%peer, %message, "dropped, peer gone"),
        }
    }
}

/// Handle to a bus; clones share the same bus.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    serials: Arc<Serials>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn attach(&self) -> (String, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_peer += 1;
        let name = format!(":1.{}", state.next_peer);
        state.peers.insert(
            name.clone(),
            Peer {
                tx,
                rules: Vec::new(),
            },
        );
        debug!(%name, "peer attached");
        (name, rx)
    }

    fn detach(&self, name: &str) {
        let mut state = self.state.lock();
        if state.peers.remove(name).is_some() {
            state.owners.retain(|_, owner| owner != name);
            debug!(%name, "peer detached");
        }
    }

    /// Attach a new in-process peer.
    pub fn connect(&self) -> MemoryTransport {
        let (name, rx) = self.attach();
        MemoryTransport {
            bus: self.clone(),
            name,
            serials: Serials::default(),
            rx: tokio::sync::Mutex::new(rx),
            closed: AtomicBool::new(false),
        }
    }

    /// Unique names and well-known names currently on the bus.
    pub fn names(&self) -> Vec<String> {
        self.state.lock().names()
    }

    /// Route one message sent by peer `from`. The message already carries
    /// the sender's serial.
    fn route(&self, from: &str, mut message: Message) {
        _ = message.set_sender(from);
        if message.destination() == Some(SERVICE_DBUS) {
            let reply = self.handle_admin(from, &message);
            if let Some(mut reply) = reply.filter(|_| !message.no_reply()) {
                _ = reply.set_sender(SERVICE_DBUS);
                self.serials.stamp(&mut reply);
                self.state.lock().deliver(from, reply);
            }
            return;
        }

        let state = self.state.lock();
        match message.destination() {
            Some(destination) => match state.resolve(destination) {
                Some(peer) => state.deliver(&peer, message),
                None if message.kind() == MessageKind::Call && !message.no_reply() => {
                    let text = format!("The name {destination} was not provided by any peer");
                    if let Ok(mut error) = message.error_reply(ERROR_SERVICE_UNKNOWN) {
                        _ = error.set_args("s", vec![text.into()]);
                        _ = error.set_sender(SERVICE_DBUS);
                        self.serials.stamp(&mut error);
                        state.deliver(from, error);
                    }
                }
                None => trace!(%message, "dropped, no such destination"),
            },
            None if message.kind() == MessageKind::Signal => {
                for (name, peer) in &state.peers {
                    let matched = peer.rules.iter().any(|rule| {
                        let owner = rule.sender.as_deref().and_then(|s| state.owners.get(s));
                        rule.matches_owned(&message, owner.map(String::as_str))
                    });
                    if matched {
                        state.deliver(name, message.clone());
                    }
                }
            }
            None => trace!(%message, "dropped, no destination"),
        }
    }

    fn handle_admin(&self, from: &str, message: &Message) -> Option<Message> {
        if message.kind() != MessageKind::Call {
            return None;
        }
        let args = message.args();
        let name_arg = args.first().and_then(Value::as_str).map(str::to_owned);
        let mut state = self.state.lock();

        let result: Result<(&str, Vec<Value>), (&str, String)> =
            match (message.member().unwrap_or_default(), name_arg) {
                (METHOD_REQUEST_NAME, Some(name)) if names::is_valid_bus_name(&name) && !name.starts_with(':') => {
                    let code = match state.owners.get(&name) {
                        Some(owner) if owner == from => REQUEST_NAME_ALREADY_OWNER,
                        Some(_) => REQUEST_NAME_EXISTS,
                        None => {
                            state.owners.insert(name.clone(), from.to_owned());
                            debug!(%name, owner = %from, "name acquired");
                            REQUEST_NAME_PRIMARY_OWNER
                        }
                    };
                    Ok(("u", vec![code.into()]))
                }
                (METHOD_RELEASE_NAME, Some(name)) => {
                    let code = match state.owners.get(&name) {
                        Some(owner) if owner == from => {
                            state.owners.remove(&name);
                            RELEASE_NAME_RELEASED
                        }
                        Some(_) => RELEASE_NAME_NOT_OWNER,
                        None => RELEASE_NAME_NON_EXISTENT,
                    };
                    Ok(("u", vec![code.into()]))
                }
                (METHOD_GET_NAME_OWNER, Some(name)) => match state.resolve(&name) {
                    Some(owner) => Ok(("s", vec![owner.into()])),
                    None if name == SERVICE_DBUS => Ok(("s", vec![SERVICE_DBUS.into()])),
                    None => Err((
                        ERROR_NAME_HAS_NO_OWNER,
                        format!("Could not get owner of name '{name}': no such name"),
                    )),
                },
                (METHOD_LIST_NAMES, _) => {
                    let names = state.names().into_iter().map(Value::from).collect();
                    Ok(("as", vec![Value::Array(names)]))
                }
                (METHOD_ADD_MATCH, Some(rule)) => match rule.parse::<MatchRule>() {
                    Ok(rule) => {
                        if let Some(peer) = state.peers.get_mut(from) {
                            trace!(%from, %rule, "match rule added");
                            peer.rules.push(rule);
                        }
                        Ok(("", Vec::new()))
                    }
                    Err(e) => Err((ERROR_MATCH_RULE_INVALID, e.to_string())),
                },
                (METHOD_REMOVE_MATCH, Some(rule)) => {
                    let parsed = rule.parse::<MatchRule>();
                    let peer = state.peers.get_mut(from);
                    match (parsed, peer) {
                        (Ok(rule), Some(peer)) => match peer.rules.iter().position(|r| *r == rule) {
                            Some(index) => {
                                peer.rules.remove(index);
                                Ok(("", Vec::new()))
                            }
                            None => Err((
                                ERROR_MATCH_RULE_NOT_FOUND,
                                "The given match rule wasn't found and can't be removed".to_owned(),
                            )),
                        },
                        (Err(e), _) => Err((ERROR_MATCH_RULE_INVALID, e.to_string())),
                        (Ok(_), None) => Ok(("", Vec::new())),
                    }
                }
                (METHOD_REQUEST_NAME | METHOD_RELEASE_NAME | METHOD_GET_NAME_OWNER, _)
                | (METHOD_ADD_MATCH | METHOD_REMOVE_MATCH, None) => {
                    Err((ERROR_INVALID_ARGS, format!("invalid arguments ({:?})", message.signature())))
                }
                (member, _) => Err((
                    ERROR_UNKNOWN_METHOD,
                    format!("{INTERFACE_DBUS} does not understand message {member}"),
                )),
            };
        drop(state);

        let reply = match result {
            Ok((signature, values)) => message
                .reply()
                .and_then(|reply| Ok(reply.with_args(signature, values)?)),
            Err((error_name, text)) => message
                .error_reply(error_name)
                .and_then(|reply| Ok(reply.with_args("s", vec![text.into()])?)),
        };
        match reply {
            Ok(reply) => Some(reply),
            Err(e) => {
                warn!(%message, "could not build bus reply: {e}");
                None
            }
        }
    }

    /// Serve one peer over a byte stream until it disconnects. The first
    /// frame sent is a `NameAcquired` signal carrying the peer's unique name.
    pub async fn serve_stream<S>(&self, io: S) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (name, mut rx) = self.attach();
        let result = self.pump_stream(&name, &mut rx, stream::framed(io)).await;
        self.detach(&name);
        result
    }

    async fn pump_stream<S>(
        &self,
        name: &str,
        rx: &mut mpsc::UnboundedReceiver<Message>,
        mut sock: stream::Framed<S>,
    ) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut hello = Message::signal(PATH_DBUS, INTERFACE_DBUS, SIGNAL_NAME_ACQUIRED)
            .and_then(|m| Ok(m.with_args("s", vec![name.into()])?))
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        _ = hello.set_sender(SERVICE_DBUS);
        _ = hello.set_destination(name);
        self.serials.stamp(&mut hello);
        sock.send(hello).await?;

        loop {
            tokio::select! {
                inbound = sock.next() => match inbound {
                    Some(Ok(message)) => self.route(name, message),
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
                outbound = rx.recv() => match outbound {
                    Some(message) => sock.send(message).await?,
                    None => return Ok(()),
                },
            }
        }
    }

    /// Accept peers on `addr` forever, one task per peer.
    pub async fn serve_tcp(&self, addr: impl ToSocketAddrs) -> io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    pub async fn serve_listener(&self, listener: TcpListener) -> io::Result<()> {
        loop {
            let bus = self.clone();
            let (sock, addr) = listener.accept().await?;
            task::spawn(async move {
                if let Err(e) = bus.serve_stream(sock).await {
                    debug!(%addr, "peer stream ended: {e}");
                }
            });
        }
    }
}

/// An in-process peer of a [`MemoryBus`]. Sending routes immediately, so
/// [`flush`](Transport::flush) has nothing to do.
pub struct MemoryTransport {
    bus: MemoryBus,
    name: String,
    serials: Serials,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>,
    closed: AtomicBool,
}

impl Transport for MemoryTransport {
    fn unique_name(&self) -> Option<String> {
        Some(self.name.clone())
    }

    fn send(&self, message: &mut Message) -> Result<u32, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let serial = self.serials.stamp(message);
        _ = message.set_sender(&self.name);
        self.bus.route(&self.name, message.clone());
        Ok(serial)
    }

    fn flush(&self) -> BoxFuture<'_, Result<(), TransportError>> {
        ready(Ok(())).boxed()
    }

    fn recv(&self) -> BoxFuture<'_, Result<Message, TransportError>> {
        async move {
            let message = self.rx.lock().await.recv().await;
            message.ok_or(TransportError::Closed)
        }
        .boxed()
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.bus.detach(&self.name);
        }
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.close();
    }
}
