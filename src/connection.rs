//! The connection: outbound calls, reply correlation, signal subscriptions,
//! filters and the table of published objects, on top of a [`Transport`].
//!
//! Nothing happens in the background unless asked for. Inbound messages are
//! read and dispatched either by [`Connection::run`] (usually in its own
//! task) or, when nothing drives the connection, by the caller itself while
//! it waits in a synchronous [`Connection::call_method`].

use crate::{
    config::{Config, DispatchMode},
    error::{Error, Result},
    message::{Message, MessageKind},
    names::{self, *},
    object::{self, CallContext, Object},
    pending::{PendingCalls, ReplyCallback},
    proxy::Proxy,
    signals::{self, MatchRule, SignalHandler, SignalRouter, SubscriptionId},
    transport::{self, Address, Transport, TransportError},
    types::Value,
};
use futures::future::{BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::HashMap,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, OnceLock, Weak,
    },
    time::Duration,
};
use tokio::{
    sync::{oneshot, Notify},
    task::JoinHandle,
    time::{sleep_until, timeout_at, Instant},
};
use tracing::{debug, error, trace, warn};

tokio::task_local! {
    /// Connections whose dispatch loop is waiting on a handler that runs on
    /// the current task.
    static DISPATCHING: Vec<usize>;
}

/// What a filter did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filtered {
    /// Stop here; later filters and object dispatch never see the message.
    Consumed,
    Pass,
}

pub type Filter = Arc<dyn Fn(&Connection, &Message) -> Filtered + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

struct Registration {
    object: Arc<Object>,
    fallback: bool,
}

#[derive(Default)]
struct ObjectTable {
    paths: HashMap<String, Registration>,
}

impl ObjectTable {
    /// The object at `path`, or the nearest fallback registration above it.
    fn lookup(&self, path: &str) -> Option<Arc<Object>> {
        if let Some(registration) = self.paths.get(path) {
            return Some(registration.object.clone());
        }
        let mut current = path;
        while let Some(index) = current.rfind('/') {
            current = if index == 0 { "/" } else { &current[..index] };
            if let Some(registration) = self.paths.get(current).filter(|r| r.fallback) {
                return Some(registration.object.clone());
            }
            if current == "/" {
                break;
            }
        }
        None
    }
}

/// Split a publish path into the path to register and whether it is a
/// fallback (`/a/b/*` or `/*`).
fn registration_path(path: &str) -> Result<(String, bool)> {
    let (base, fallback) = match path.strip_suffix('*') {
        Some(rest) if rest.ends_with('/') => {
            let trimmed = rest.trim_end_matches('/');
            (if trimmed.is_empty() { "/" } else { trimmed }, true)
        }
        _ => (path, false),
    };
    if !names::is_valid_path(base) {
        return Err(Error::InvalidName {
            kind: NameKind::ObjectPath,
            name: path.to_owned(),
        });
    }
    Ok((base.to_owned(), fallback))
}

struct Inner {
    transport: Arc<dyn Transport>,
    config: Config,
    pending: Mutex<PendingCalls>,
    signals: Mutex<SignalRouter>,
    filters: Mutex<Vec<(FilterId, Filter)>>,
    next_filter: AtomicU64,
    objects: RwLock<ObjectTable>,
    driven: AtomicBool,
    wakeup: Notify,
}

/// A connection to a bus. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Connection")
            .field("unique_name", &self.unique_name())
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

/// A method call to make with [`Connection::call_method`].
pub struct MethodCall {
    service: String,
    path: String,
    interface: String,
    method: String,
    signature: String,
    args: Vec<Value>,
    no_reply: bool,
    timeout: Option<Duration>,
    callback: Option<ReplyCallback>,
}

impl MethodCall {
    pub fn new(service: &str, path: &str, interface: &str, method: &str) -> Self {
        Self {
            service: service.to_owned(),
            path: path.to_owned(),
            interface: interface.to_owned(),
            method: method.to_owned(),
            signature: String::new(),
            args: Vec::new(),
            no_reply: false,
            timeout: None,
            callback: None,
        }
    }

    pub fn args(mut self, signature: &str, args: Vec<Value>) -> Self {
        self.signature = signature.to_owned();
        self.args = args;
        self
    }

    /// Send without waiting for (or wanting) a reply.
    pub fn no_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }

    /// Return as soon as the call is sent; `callback` gets the reply, or a
    /// synthetic `Timeout` error.
    pub fn callback(mut self, callback: impl FnOnce(Message) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    /// Replaces the connection's default timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn message(&self) -> Result<Message> {
        let mut message = Message::method_call(&self.service, &self.path, &self.interface, &self.method)?;
        message.set_args(&self.signature, self.args.clone())?;
        message.set_no_reply(self.no_reply && self.callback.is_none());
        Ok(message)
    }
}

fn shared_connections() -> &'static Mutex<HashMap<String, Weak<Inner>>> {
    static SHARED: OnceLock<Mutex<HashMap<String, Weak<Inner>>>> = OnceLock::new();
    SHARED.get_or_init(Default::default)
}

/// Map an error reply to an [`Error`], passing method returns through.
pub fn reply_result(reply: Message) -> Result<Message> {
    match (reply.kind(), reply.error_name()) {
        (MessageKind::Error, Some(ERROR_TIMEOUT)) => Err(Error::Timeout),
        (MessageKind::Error, name) => Err(Error::Remote {
            name: name.unwrap_or(ERROR_FAILED).to_owned(),
            message: reply.first_str().map(str::to_owned),
        }),
        _ => Ok(reply),
    }
}

impl Connection {
    /// Wrap `transport`, configured from the environment.
    pub fn new<T: Transport>(transport: T) -> Self {
        Self::with_config(transport, Config::from_env())
    }

    pub fn with_config<T: Transport>(transport: T, config: Config) -> Self {
        Self::from_transport(Arc::new(transport), config)
    }

    fn from_transport(transport: Arc<dyn Transport>, config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                pending: Mutex::new(PendingCalls::new()),
                signals: Mutex::new(SignalRouter::new()),
                filters: Mutex::new(Vec::new()),
                next_filter: AtomicU64::new(0),
                objects: RwLock::new(ObjectTable::default()),
                driven: AtomicBool::new(false),
                wakeup: Notify::new(),
            }),
        }
    }

    /// Open a private connection to the bus at `address`.
    pub async fn open(address: &str) -> Result<Self> {
        let parsed: Address = address.parse()?;
        let transport = transport::connect(&parsed).await?;
        debug!(%address, name = ?transport.unique_name(), "connection opened");
        Ok(Self::from_transport(transport, Config::from_env()))
    }

    /// The connection to `address` shared by every caller in this process,
    /// opened on first use and kept while any clone of it is alive.
    pub async fn shared(address: &str) -> Result<Self> {
        if let Some(inner) = shared_connections().lock().get(address).and_then(Weak::upgrade) {
            return Ok(Self { inner });
        }
        let connection = Self::open(address).await?;
        let mut shared = shared_connections().lock();
        if let Some(inner) = shared.get(address).and_then(Weak::upgrade) {
            // another caller opened it while we were connecting
            connection.close();
            return Ok(Self { inner });
        }
        shared.retain(|_, weak| weak.strong_count() > 0);
        shared.insert(address.to_owned(), Arc::downgrade(&connection.inner));
        Ok(connection)
    }

    pub fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn unique_name(&self) -> Option<String> {
        self.inner.transport.unique_name()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn close(&self) {
        self.inner.transport.close();
        self.inner.wakeup.notify_one();
    }

    /// Queue `message`; returns the serial it was given.
    pub fn send(&self, mut message: Message) -> Result<u32> {
        let serial = self.inner.transport.send(&mut message)?;
        trace!(%message, "sent");
        self.inner.wakeup.notify_one();
        Ok(serial)
    }

    /// Queue a call and register `callback` for its reply. With no reply
    /// before `timeout` (or the configured default), the callback gets a
    /// synthetic `Timeout` error instead.
    pub fn send_with_reply(
        &self,
        mut message: Message,
        callback: ReplyCallback,
        timeout: Option<Duration>,
    ) -> Result<u32> {
        if message.kind() != MessageKind::Call {
            return Err(Error::NotACall(message.kind()));
        }
        message.set_no_reply(false);
        let deadline = self.deadline(timeout);
        let serial = {
            // registered under the lock so the reply cannot overtake it
            let mut pending = self.inner.pending.lock();
            let serial = self.inner.transport.send(&mut message)?;
            pending.insert(serial, deadline, callback);
            serial
        };
        trace!(%message, "sent, awaiting reply");
        self.inner.wakeup.notify_one();
        Ok(serial)
    }

    fn deadline(&self, timeout: Option<Duration>) -> Option<Instant> {
        timeout
            .or_else(|| self.inner.config.default_timeout())
            .map(|t| Instant::now() + t)
    }

    pub async fn flush(&self) -> Result<()> {
        Ok(self.inner.transport.flush().await?)
    }

    /// Call a method.
    ///
    /// * With a callback: returns `None` once the call is queued.
    /// * With `no_reply`: returns `None` once the call is flushed.
    /// * Otherwise waits for the reply and returns it. An error reply is
    ///   returned as a message; only a timeout becomes [`Error::Timeout`].
    pub async fn call_method(&self, call: MethodCall) -> Result<Option<Message>> {
        let message = call.message()?;
        let timeout = call.timeout;
        if let Some(callback) = call.callback {
            self.send_with_reply(message, callback, timeout)?;
            return Ok(None);
        }
        if call.no_reply {
            self.send(message)?;
            self.flush().await?;
            return Ok(None);
        }

        let (tx, rx) = oneshot::channel();
        let deadline = self.deadline(timeout);
        let serial = self.send_with_reply(
            message,
            Box::new(move |reply: Message| {
                _ = tx.send(reply);
            }),
            timeout,
        )?;
        // a handler running inline holds up the loop that would read its reply
        let reply = if self.inner.driven.load(Ordering::Acquire) && !self.dispatching() {
            self.wait_driven(serial, deadline, rx).await?
        } else {
            self.pump_until(rx).await?
        };
        match reply.error_name() {
            Some(ERROR_TIMEOUT) => Err(Error::Timeout),
            _ => Ok(Some(reply)),
        }
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    /// Whether this task is inside one of this connection's inline handlers.
    fn dispatching(&self) -> bool {
        DISPATCHING
            .try_with(|stack| stack.contains(&self.id()))
            .unwrap_or(false)
    }

    /// Wait for a reply that the task running [`run`](Self::run) delivers.
    async fn wait_driven(
        &self,
        serial: u32,
        deadline: Option<Instant>,
        mut rx: oneshot::Receiver<Message>,
    ) -> Result<Message> {
        let closed = |_: oneshot::error::RecvError| Error::Transport(TransportError::Closed);
        let Some(deadline) = deadline else {
            return rx.await.map_err(closed);
        };
        match timeout_at(deadline, &mut rx).await {
            Ok(reply) => reply.map_err(closed),
            Err(_) => {
                if self.inner.pending.lock().resolve(serial).is_some() {
                    trace!(serial, "pending call timed out");
                    return Err(Error::Timeout);
                }
                // resolved concurrently; its callback is about to run
                rx.await.map_err(closed)
            }
        }
    }

    /// Read and dispatch on this task until `rx` resolves.
    async fn pump_until(&self, mut rx: oneshot::Receiver<Message>) -> Result<Message> {
        loop {
            if let Err(e) = self.inner.transport.flush().await {
                self.fail_pending();
                return Err(e.into());
            }
            let received = tokio::select! {
                biased;
                reply = &mut rx => {
                    return reply.map_err(|_| Error::Transport(TransportError::Closed));
                }
                received = self.receive(None) => received,
            };
            match received {
                Ok(Some(message)) => self.dispatch(message).await,
                Ok(None) => {}
                Err(e) => {
                    self.fail_pending();
                    // our own callback may just have been resolved
                    return rx.try_recv().map_err(|_| e);
                }
            }
        }
    }

    /// Wait for one inbound message, the next pending deadline, `limit`, or
    /// a wakeup, whichever comes first; then time out expired calls.
    async fn receive(&self, limit: Option<Instant>) -> Result<Option<Message>> {
        let next_deadline = self.inner.pending.lock().next_deadline();
        let deadline = match (limit, next_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let sleep = async {
            match deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        let received = tokio::select! {
            received = self.inner.transport.recv() => Some(received?),
            _ = sleep => None,
            _ = self.inner.wakeup.notified() => None,
        };
        self.expire_pending();
        Ok(received)
    }

    /// One round of I/O: flush, wait up to `timeout` for a message, and
    /// dispatch it. Returns whether a message was dispatched.
    pub async fn read_write_dispatch(&self, timeout: Option<Duration>) -> Result<bool> {
        self.flush().await?;
        let limit = timeout.map(|t| Instant::now() + t);
        match self.receive(limit).await? {
            Some(message) => {
                self.dispatch(message).await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drive the connection until its transport closes. While this runs,
    /// synchronous calls from other tasks just wait for their replies.
    pub async fn run(&self) -> Result<()> {
        self.inner.driven.store(true, Ordering::Release);
        let result = loop {
            if let Err(e) = self.read_write_dispatch(None).await {
                break e;
            }
        };
        self.inner.driven.store(false, Ordering::Release);
        self.fail_pending();
        match result {
            Error::Transport(TransportError::Closed) => {
                debug!("connection closed");
                Ok(())
            }
            e => Err(e),
        }
    }

    /// Run the connection on a new task.
    pub fn spawn(&self) -> JoinHandle<Result<()>> {
        let connection = self.clone();
        // set before returning so calls made right away do not pump
        self.inner.driven.store(true, Ordering::Release);
        tokio::spawn(async move { connection.run().await })
    }

    fn expire_pending(&self) {
        let own_name = self.unique_name();
        let expired = self.inner.pending.lock().expire(Instant::now(), own_name.as_deref());
        for (callback, message) in expired {
            run_callback(callback, message);
        }
    }

    fn fail_pending(&self) {
        let own_name = self.unique_name();
        let failed = self.inner.pending.lock().drain(own_name.as_deref());
        for (callback, message) in failed {
            run_callback(callback, message);
        }
    }

    /// Route one inbound message: replies to their pending calls, then the
    /// filters in order, then method calls to published objects.
    fn dispatch(&self, message: Message) -> BoxFuture<'_, ()> {
        async move {
            trace!(%message, "dispatch");
            if matches!(message.kind(), MessageKind::Return | MessageKind::Error) {
                let callback = message
                    .reply_serial()
                    .and_then(|serial| self.inner.pending.lock().resolve(serial));
                if let Some(callback) = callback {
                    run_callback(callback, message);
                    return;
                }
            }

            let filters: Vec<Filter> = self.inner.filters.lock().iter().map(|(_, f)| f.clone()).collect();
            for filter in filters {
                match catch_unwind(AssertUnwindSafe(|| filter(self, &message))) {
                    Ok(Filtered::Consumed) => return,
                    Ok(Filtered::Pass) => {}
                    Err(_) => error!(%message, "message filter panicked"),
                }
            }

            if message.kind() == MessageKind::Call {
                self.dispatch_call(message).await;
            } else {
                trace!(%message, "not handled");
            }
        }
        .boxed()
    }

    async fn dispatch_call(&self, message: Message) {
        let (Some(path), Some(member)) = (message.path(), message.member()) else {
            warn!(%message, "method call without path or member");
            return;
        };
        let Some(object) = self.inner.objects.read().lookup(path) else {
            let text = format!("No such object path '{path}'");
            object::send_error(self, &message, ERROR_UNKNOWN_OBJECT, Some(text));
            return;
        };
        let Some(method) = object.find_method(member, message.interface()).cloned() else {
            let text = format!(
                "No such method '{member}' on interface '{}' at path '{path}'",
                message.interface().unwrap_or("*")
            );
            object::send_error(self, &message, ERROR_UNKNOWN_METHOD, Some(text));
            return;
        };
        let ctx = CallContext::new(self.clone(), Arc::new(message), method, object);
        match self.inner.config.dispatch {
            DispatchMode::Inline => {
                let mut stack = DISPATCHING.try_with(Vec::clone).unwrap_or_default();
                stack.push(self.id());
                DISPATCHING.scope(stack, object::dispatch(ctx)).await
            }
            DispatchMode::Spawn => {
                tokio::spawn(object::dispatch(ctx));
            }
        }
    }

    /// Publish `object` at `path`. A path ending in `/*` also serves every
    /// path below it that has no object of its own.
    pub fn publish(&self, path: &str, object: Object) -> Result<Arc<Object>> {
        let (base, fallback) = registration_path(path)?;
        let mut objects = self.inner.objects.write();
        if objects.paths.contains_key(&base) {
            return Err(Error::PathInUse(base));
        }
        let object = Arc::new(object);
        debug!(path = %base, fallback, "object published");
        objects.paths.insert(
            base,
            Registration {
                object: object.clone(),
                fallback,
            },
        );
        Ok(object)
    }

    pub fn remove(&self, path: &str) -> Result<Arc<Object>> {
        let (base, _) = registration_path(path)?;
        match self.inner.objects.write().paths.remove(&base) {
            Some(registration) => {
                debug!(path = %base, "object removed");
                Ok(registration.object)
            }
            None => Err(Error::NotPublished(base)),
        }
    }

    /// The object that would answer calls to `path`.
    pub fn object_at(&self, path: &str) -> Option<Arc<Object>> {
        self.inner.objects.read().lookup(path)
    }

    pub fn add_filter(
        &self,
        filter: impl Fn(&Connection, &Message) -> Filtered + Send + Sync + 'static,
    ) -> FilterId {
        let id = FilterId(self.inner.next_filter.fetch_add(1, Ordering::Relaxed));
        self.inner.filters.lock().push((id, Arc::new(filter)));
        id
    }

    pub fn remove_filter(&self, id: FilterId) -> bool {
        let mut filters = self.inner.filters.lock();
        let before = filters.len();
        filters.retain(|(fid, _)| *fid != id);
        filters.len() != before
    }

    /// Call `handler` for every signal `signal` on `interface` emitted by
    /// `service` from the object at `path`. Subscriptions are independent:
    /// subscribing twice means two calls per signal.
    pub fn connect_to_signal(
        &self,
        service: &str,
        path: &str,
        interface: &str,
        signal: &str,
        handler: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        let rule = MatchRule::signal(service, path, interface, signal)?;
        let handler: SignalHandler = Arc::new(handler);
        let (id, install) = {
            let mut router = self.inner.signals.lock();
            let install = router.install_filter();
            (router.subscribe(rule.clone(), handler), install)
        };
        if install {
            self.add_filter(route_signal);
        }
        self.bus_call_no_reply(METHOD_ADD_MATCH, rule.to_string())?;
        Ok(id)
    }

    /// Drop one subscription. Returns `false` if it was already gone.
    pub fn disconnect_signal(&self, id: SubscriptionId) -> Result<bool> {
        let Some(rule) = self.inner.signals.lock().unsubscribe(id) else {
            return Ok(false);
        };
        self.bus_call_no_reply(METHOD_REMOVE_MATCH, rule.to_string())?;
        Ok(true)
    }

    fn bus_call_no_reply(&self, method: &str, arg: String) -> Result<()> {
        let mut message = Message::method_call(SERVICE_DBUS, PATH_DBUS, INTERFACE_DBUS, method)?;
        message.set_args("s", vec![arg.into()])?;
        message.set_no_reply(true);
        self.send(message)?;
        Ok(())
    }

    async fn bus_call(&self, method: &str, signature: &str, args: Vec<Value>) -> Result<Message> {
        let call = MethodCall::new(SERVICE_DBUS, PATH_DBUS, INTERFACE_DBUS, method).args(signature, args);
        let reply = self.call_method(call).await?.ok_or(Error::Timeout)?;
        reply_result(reply)
    }

    /// Ask the bus for a well-known name; returns the bus's reply code.
    pub async fn request_name(&self, name: &str) -> Result<u32> {
        let reply = self
            .bus_call(METHOD_REQUEST_NAME, "su", vec![name.into(), 0u32.into()])
            .await?;
        match reply.args() {
            [Value::UInt32(code)] => Ok(*code),
            other => Err(Error::UnexpectedReply(format!("{METHOD_REQUEST_NAME} returned {other:?}"))),
        }
    }

    pub async fn release_name(&self, name: &str) -> Result<u32> {
        let reply = self.bus_call(METHOD_RELEASE_NAME, "s", vec![name.into()]).await?;
        match reply.args() {
            [Value::UInt32(code)] => Ok(*code),
            other => Err(Error::UnexpectedReply(format!("{METHOD_RELEASE_NAME} returned {other:?}"))),
        }
    }

    pub async fn list_names(&self) -> Result<Vec<String>> {
        let reply = self.bus_call(METHOD_LIST_NAMES, "", Vec::new()).await?;
        match reply.args() {
            [Value::Array(names)] => Ok(names
                .iter()
                .filter_map(|name| name.as_str().map(str::to_owned))
                .collect()),
            other => Err(Error::UnexpectedReply(format!("{METHOD_LIST_NAMES} returned {other:?}"))),
        }
    }

    /// Emit a signal from `path`; broadcast unless `destination` is given.
    pub fn emit_signal(
        &self,
        path: &str,
        interface: &str,
        name: &str,
        signature: &str,
        args: Vec<Value>,
        destination: Option<&str>,
    ) -> Result<u32> {
        let mut message = Message::signal(path, interface, name)?;
        if let Some(destination) = destination {
            message.set_destination(destination)?;
        }
        message.set_args(signature, args)?;
        self.send(message)
    }

    /// A proxy for the object at `path` of `service`, built from its
    /// introspection data.
    pub async fn proxy(&self, service: &str, path: &str, interfaces: &[&str]) -> Result<Proxy> {
        Proxy::new(self, service, path, interfaces).await
    }
}

/// Filter installed with the first signal subscription.
fn route_signal(connection: &Connection, message: &Message) -> Filtered {
    if message.kind() == MessageKind::Signal {
        let handlers = connection.inner.signals.lock().matching(message);
        signals::deliver(&handlers, message);
    }
    // others may want the signal too
    Filtered::Pass
}

fn run_callback(callback: ReplyCallback, message: Message) {
    if catch_unwind(AssertUnwindSafe(move || callback(message))).is_err() {
        error!("reply callback panicked");
    }
}
