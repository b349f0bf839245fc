//! Client-side proxies for remote objects.
//!
//! A [`Proxy`] knows the methods and signals of one remote object, usually
//! learned by introspecting it. When a name exists on several interfaces,
//! the proxy's interface search path picks one; the proxy never guesses.

use crate::{
    connection::{reply_result, Connection, MethodCall},
    error::{Error, Result},
    introspect::Node,
    message::Message,
    names::{NameKind, ERROR_UNKNOWN_INTERFACE, INTERFACE_INTROSPECTABLE, METHOD_INTROSPECT},
    signals::SubscriptionId,
    typed::Output,
    types::Value,
};
use std::{collections::BTreeMap, fmt, time::Duration};
use tracing::{debug, error};

/// The interfaces (and their input signatures) a method name exists on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodStub {
    interfaces: Vec<(String, String)>,
}

impl MethodStub {
    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.interfaces.iter().map(|(i, _)| i.as_str())
    }

    pub fn signature(&self, interface: &str) -> Option<&str> {
        self.interfaces
            .iter()
            .find(|(i, _)| i == interface)
            .map(|(_, s)| s.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalStub {
    interfaces: Vec<String>,
}

impl SignalStub {
    pub fn interfaces(&self) -> impl Iterator<Item = &str> {
        self.interfaces.iter().map(String::as_str)
    }
}

/// Per-call overrides for [`Proxy::call_with`].
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub interface: Option<String>,
    pub signature: Option<String>,
    pub timeout: Option<Duration>,
    pub no_reply: bool,
}

impl CallOptions {
    pub fn interface(mut self, interface: &str) -> Self {
        self.interface = Some(interface.to_owned());
        self
    }

    pub fn signature(mut self, signature: &str) -> Self {
        self.signature = Some(signature.to_owned());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn no_reply(mut self) -> Self {
        self.no_reply = true;
        self
    }
}

pub struct Proxy {
    connection: Connection,
    service: String,
    path: String,
    interfaces: Vec<String>,
    methods: BTreeMap<String, MethodStub>,
    signals: BTreeMap<String, SignalStub>,
}

impl fmt::Debug for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Proxy")
            .field("service", &self.service)
            .field("path", &self.path)
            .field("interfaces", &self.interfaces)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .field("signals", &self.signals.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Proxy {
    /// A proxy populated by introspecting the remote object. If that fails,
    /// the failure is logged and the proxy starts out empty.
    pub async fn new(connection: &Connection, service: &str, path: &str, interfaces: &[&str]) -> Result<Proxy> {
        let mut proxy = Self::without_introspection(connection, service, path, interfaces)?;
        proxy.introspect().await?;
        Ok(proxy)
    }

    /// A proxy with no stubs; add them with [`add_method`](Self::add_method)
    /// and [`add_signal`](Self::add_signal).
    pub fn without_introspection(
        connection: &Connection,
        service: &str,
        path: &str,
        interfaces: &[&str],
    ) -> Result<Proxy> {
        for (kind, name) in [(NameKind::BusName, service), (NameKind::ObjectPath, path)] {
            if !kind.check(name) {
                return Err(Error::InvalidName {
                    kind,
                    name: name.to_owned(),
                });
            }
        }
        Ok(Proxy {
            connection: connection.clone(),
            service: service.to_owned(),
            path: path.to_owned(),
            interfaces: interfaces.iter().map(|i| i.to_string()).collect(),
            methods: BTreeMap::new(),
            signals: BTreeMap::new(),
        })
    }

    /// Only transport failures are returned; anything else the remote end
    /// does wrong is logged.
    async fn introspect(&mut self) -> Result<()> {
        let call = MethodCall::new(&self.service, &self.path, INTERFACE_INTROSPECTABLE, METHOD_INTROSPECT);
        let reply = match self.connection.call_method(call).await {
            Ok(Some(reply)) => reply,
            Ok(None) => return Ok(()),
            Err(e @ Error::Transport(_)) => return Err(e),
            Err(e) => {
                error!(service = %self.service, path = %self.path, "error introspecting object: {e}");
                return Ok(());
            }
        };
        let xml = match reply_result(reply) {
            Ok(reply) => match reply.args() {
                [Value::String(xml)] => xml.clone(),
                _ => {
                    error!("illegal reply for {METHOD_INTROSPECT} method");
                    return Ok(());
                }
            },
            Err(Error::Remote { name, .. }) if name == ERROR_UNKNOWN_INTERFACE => {
                debug!(service = %self.service, path = %self.path, "object does not support introspection");
                return Ok(());
            }
            Err(e) => {
                error!(service = %self.service, path = %self.path, "error introspecting object: {e}");
                return Ok(());
            }
        };
        match Node::from_xml(&xml) {
            Ok(node) => self.add_node(&node),
            Err(e) => error!("XML error in {METHOD_INTROSPECT} reply: {e}"),
        }
        Ok(())
    }

    fn add_node(&mut self, node: &Node) {
        let (mut methods, mut signals) = (0, 0);
        for interface in node.interfaces.iter().filter(|i| !i.name.is_empty()) {
            for method in interface.methods.iter().filter(|m| !m.name.is_empty()) {
                self.add_method(&interface.name, &method.name, &method.in_signature());
                methods += 1;
            }
            for signal in interface.signals.iter().filter(|s| !s.name.is_empty()) {
                self.add_signal(&interface.name, &signal.name);
                signals += 1;
            }
        }
        debug!("added {methods} methods and {signals} signals");
    }

    /// Add a method stub. A name already known from another interface gains
    /// this one as an alternative.
    pub fn add_method(&mut self, interface: &str, name: &str, signature: &str) {
        let entry = (interface.to_owned(), signature.to_owned());
        match self.methods.get_mut(name) {
            Some(stub) if stub.signature(interface).is_none() => stub.interfaces.push(entry),
            Some(_) => {}
            None => {
                self.methods
                    .insert(name.to_owned(), MethodStub { interfaces: vec![entry] });
            }
        }
    }

    pub fn add_signal(&mut self, interface: &str, name: &str) {
        match self.signals.get_mut(name) {
            Some(stub) if !stub.interfaces.iter().any(|i| i == interface) => {
                stub.interfaces.push(interface.to_owned())
            }
            Some(_) => {}
            None => {
                self.signals.insert(
                    name.to_owned(),
                    SignalStub {
                        interfaces: vec![interface.to_owned()],
                    },
                );
            }
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// The interface search path.
    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    pub fn set_interfaces(&mut self, interfaces: &[&str]) {
        self.interfaces = interfaces.iter().map(|i| i.to_string()).collect();
    }

    pub fn method(&self, name: &str) -> Option<&MethodStub> {
        self.methods.get(name)
    }

    pub fn signal(&self, name: &str) -> Option<&SignalStub> {
        self.signals.get(name)
    }

    pub fn method_names(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub fn signal_names(&self) -> impl Iterator<Item = &str> {
        self.signals.keys().map(String::as_str)
    }

    /// The single interface of a stub, or the first search path entry it
    /// has.
    fn resolve<'a>(&'a self, name: &str, candidates: &[&'a str]) -> Result<&'a str> {
        if let [only] = candidates {
            return Ok(only);
        }
        self.interfaces
            .iter()
            .map(String::as_str)
            .find(|i| candidates.contains(i))
            .ok_or_else(|| Error::AmbiguousInterface(name.to_owned()))
    }

    /// Interface and input signature to call `name` with.
    fn resolve_method(&self, name: &str, options: &CallOptions) -> Result<(String, String)> {
        let stub = self.methods.get(name);
        let resolved = || -> Result<(String, String)> {
            let stub = stub.ok_or_else(|| Error::UnknownMember(name.to_owned()))?;
            let candidates: Vec<&str> = stub.interfaces().collect();
            let interface = self.resolve(name, &candidates)?;
            let signature = stub.signature(interface).unwrap_or_default();
            Ok((interface.to_owned(), signature.to_owned()))
        };
        match (&options.interface, &options.signature) {
            (Some(interface), Some(signature)) => Ok((interface.clone(), signature.clone())),
            (Some(interface), None) => {
                let signature = stub.and_then(|s| s.signature(interface)).unwrap_or_default();
                Ok((interface.clone(), signature.to_owned()))
            }
            (None, Some(signature)) => Ok((resolved()?.0, signature.clone())),
            (None, None) => resolved(),
        }
    }

    fn method_call(&self, name: &str, args: Vec<Value>, options: &CallOptions) -> Result<MethodCall> {
        let (interface, signature) = self.resolve_method(name, options)?;
        let mut call = MethodCall::new(&self.service, &self.path, &interface, name).args(&signature, args);
        if let Some(timeout) = options.timeout {
            call = call.timeout(timeout);
        }
        if options.no_reply {
            call = call.no_reply();
        }
        Ok(call)
    }

    /// Call method `name` and wait for its result.
    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Output> {
        self.call_with(name, args, CallOptions::default()).await
    }

    pub async fn call_with(&self, name: &str, args: Vec<Value>, options: CallOptions) -> Result<Output> {
        let call = self.method_call(name, args, &options)?;
        match self.connection.call_method(call).await? {
            Some(reply) => output(reply),
            None => Ok(Output::Empty),
        }
    }

    /// Send the call and return; `callback` later gets the result.
    pub async fn call_async(
        &self,
        name: &str,
        args: Vec<Value>,
        options: CallOptions,
        callback: impl FnOnce(Result<Output>) + Send + 'static,
    ) -> Result<()> {
        let call = self
            .method_call(name, args, &options)?
            .callback(move |reply| callback(output(reply)));
        self.connection.call_method(call).await?;
        Ok(())
    }

    /// Call `handler` with the arguments of every `signal` the object emits.
    pub fn connect(
        &self,
        signal: &str,
        handler: impl Fn(Vec<Value>) + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        self.connect_with(signal, None, handler)
    }

    /// Like [`connect`](Self::connect), on an explicitly chosen interface.
    pub fn connect_with(
        &self,
        signal: &str,
        interface: Option<&str>,
        handler: impl Fn(Vec<Value>) + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        let interface = match interface {
            Some(interface) => interface.to_owned(),
            None => {
                let stub = self
                    .signals
                    .get(signal)
                    .ok_or_else(|| Error::UnknownMember(signal.to_owned()))?;
                let candidates: Vec<&str> = stub.interfaces().collect();
                self.resolve(signal, &candidates)?.to_owned()
            }
        };
        self.connection
            .connect_to_signal(&self.service, &self.path, &interface, signal, move |message: &Message| {
                handler(message.args().to_vec())
            })
    }
}

/// A reply as a result: errors become [`Error`]s, arguments an [`Output`].
fn output(reply: Message) -> Result<Output> {
    reply_result(reply).map(|reply| Output::from_args(reply.into_args()))
}
