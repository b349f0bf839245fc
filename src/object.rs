//! Published objects and the dispatch of inbound method calls.
//!
//! An [`Object`] is a fixed table of [`Method`]s and [`Signal`]s, built once
//! with an [`ObjectBuilder`]. When a call arrives for it, [`dispatch`] checks
//! the argument signature, runs the handler, and turns its [`Outcome`] into
//! exactly one reply or error (or none, if the caller asked for none).

use crate::{
    connection::Connection,
    error::{Error, Result},
    introspect::{Arg, Interface, Member, Node, DIRECTION_IN, DIRECTION_OUT},
    message::Message,
    names::{self, NameKind, ERROR_FAILED, ERROR_INVALID_ARGS, INTERFACE_INTROSPECTABLE, METHOD_INTROSPECT},
    signature,
    typed::{FromArgs, IntoArgs, Output},
    types::Value,
};
use futures::{
    future::{BoxFuture, FutureExt},
    Future,
};
use std::{
    error::Error as StdError,
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};
use tracing::{debug, error, info_span, Instrument};

pub type Handler = Arc<dyn Fn(CallContext, Vec<Value>) -> BoxFuture<'static, Outcome> + Send + Sync>;

/// What a method handler did.
pub enum Outcome {
    /// Returned normally; shaped against the method's output signature.
    Normal(Output),
    /// The complete output argument list.
    ExplicitReply(Vec<Value>),
    /// A reply was already sent, or none is wanted.
    Suppressed,
    /// Answer with this error name.
    DomainError(String),
    /// Unexpected failure; logged and answered with `Failed`.
    Fault(Box<dyn StdError + Send + Sync>),
}

impl Outcome {
    pub fn empty() -> Self {
        Outcome::Normal(Output::Empty)
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Outcome::Normal(Output::Single(value.into()))
    }

    pub fn tuple(values: Vec<Value>) -> Self {
        Outcome::Normal(Output::Tuple(values))
    }

    pub fn error(name: impl Into<String>) -> Self {
        Outcome::DomainError(name.into())
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Outcome::Normal(output) => f.debug_tuple("Normal").field(output).finish(),
            Outcome::ExplicitReply(values) => f.debug_tuple("ExplicitReply").field(values).finish(),
            Outcome::Suppressed => f.write_str("Suppressed"),
            Outcome::DomainError(name) => f.debug_tuple("DomainError").field(name).finish(),
            Outcome::Fault(e) => f.debug_tuple("Fault").field(&e.to_string()).finish(),
        }
    }
}

/// Failure of a typed handler. Any error converts into a fault with `?`.
#[derive(Debug)]
pub enum MethodError {
    Bus(String),
    Fault(Box<dyn StdError + Send + Sync>),
}

impl MethodError {
    pub fn bus(name: impl Into<String>) -> Self {
        MethodError::Bus(name.into())
    }
}

impl<E: StdError + Send + Sync + 'static> From<E> for MethodError {
    fn from(e: E) -> Self {
        MethodError::Fault(Box::new(e))
    }
}

impl From<MethodError> for Outcome {
    fn from(e: MethodError) -> Self {
        match e {
            MethodError::Bus(name) => Outcome::DomainError(name),
            MethodError::Fault(e) => Outcome::Fault(e),
        }
    }
}

/// One exposed method: its interface, name, signatures and handler.
#[derive(Clone)]
pub struct Method {
    interface: String,
    name: String,
    args_in: Option<String>,
    args_out: Option<String>,
    handler: Handler,
}

impl Method {
    /// A method taking and returning raw values. Without
    /// [`args_in`](Self::args_in) any arguments are accepted.
    pub fn new<F, Fut>(interface: &str, name: &str, handler: F) -> Self
    where
        F: Fn(CallContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Outcome> + Send + 'static,
    {
        Self {
            interface: interface.to_owned(),
            name: name.to_owned(),
            args_in: None,
            args_out: None,
            handler: Arc::new(move |ctx: CallContext, args: Vec<Value>| handler(ctx, args).boxed()),
        }
    }

    /// A method whose signatures come from its Rust argument and result
    /// types.
    pub fn typed<A, R, F, Fut>(interface: &str, name: &str, handler: F) -> Self
    where
        A: FromArgs + Send + 'static,
        R: IntoArgs + Send + 'static,
        F: Fn(CallContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, MethodError>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        Self::new(interface, name, move |ctx, args| {
            let handler = handler.clone();
            async move {
                let args = match A::from_args(args) {
                    Ok(args) => args,
                    Err(e) => return Outcome::Fault(Box::new(e)),
                };
                match handler(ctx, args).await {
                    Ok(result) => Outcome::Normal(Output::from_args(result.into_args())),
                    Err(e) => e.into(),
                }
            }
        })
        .args_in(&<A as FromArgs>::signature())
        .args_out(&<R as IntoArgs>::signature())
    }

    pub fn args_in(mut self, signature: &str) -> Self {
        self.args_in = Some(signature.to_owned());
        self
    }

    pub fn args_out(mut self, signature: &str) -> Self {
        self.args_out = Some(signature.to_owned());
        self
    }

    /// The same handler and signatures under another interface.
    pub fn alias(&self, interface: &str) -> Method {
        Method {
            interface: interface.to_owned(),
            ..self.clone()
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_signature(&self) -> Option<&str> {
        self.args_in.as_deref()
    }

    pub fn output_signature(&self) -> Option<&str> {
        self.args_out.as_deref()
    }

    fn matches(&self, member: &str, interface: Option<&str>) -> bool {
        self.name == member && interface.map_or(true, |i| i == self.interface)
    }

    fn validate(&self) -> Result<()> {
        check_name(NameKind::Interface, &self.interface)?;
        check_name(NameKind::Member, &self.name)?;
        for sig in [&self.args_in, &self.args_out].into_iter().flatten() {
            signature::validate(sig).map_err(|e| Error::invalid_signature(sig, e))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Method")
            .field("interface", &self.interface)
            .field("name", &self.name)
            .field("args_in", &self.args_in)
            .field("args_out", &self.args_out)
            .finish_non_exhaustive()
    }
}

/// A signal an object declares it may emit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    interface: String,
    name: String,
    args: Option<String>,
}

impl Signal {
    pub fn new(interface: &str, name: &str) -> Self {
        Self {
            interface: interface.to_owned(),
            name: name.to_owned(),
            args: None,
        }
    }

    pub fn args(mut self, signature: &str) -> Self {
        self.args = Some(signature.to_owned());
        self
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &str {
        self.args.as_deref().unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        check_name(NameKind::Interface, &self.interface)?;
        check_name(NameKind::Member, &self.name)?;
        if let Some(sig) = &self.args {
            signature::validate(sig).map_err(|e| Error::invalid_signature(sig, e))?;
        }
        Ok(())
    }
}

fn check_name(kind: NameKind, name: &str) -> Result<()> {
    if kind.check(name) {
        Ok(())
    } else {
        Err(Error::InvalidName {
            kind,
            name: name.to_owned(),
        })
    }
}

/// A type whose methods can be published by wrapping it.
pub trait Exported: Send + Sync + 'static {
    /// Method descriptors bound to this instance.
    fn methods(self: Arc<Self>) -> Vec<Method>;

    fn signals(&self) -> Vec<Signal> {
        Vec::new()
    }
}

#[derive(Default)]
pub struct ObjectBuilder {
    wrapped_methods: Vec<Method>,
    wrapped_signals: Vec<Signal>,
    methods: Vec<Method>,
    signals: Vec<Signal>,
}

impl ObjectBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Expose the methods and signals of `target`. They are looked up and
    /// listed before the object's own, in the order targets were wrapped.
    pub fn wrap<T: Exported>(mut self, target: Arc<T>) -> Self {
        self.wrapped_signals.extend(target.signals());
        self.wrapped_methods.extend(target.methods());
        self
    }

    pub fn method(mut self, method: Method) -> Self {
        self.methods.push(method);
        self
    }

    pub fn signal(mut self, signal: Signal) -> Self {
        self.signals.push(signal);
        self
    }

    /// Check every name and signature and add the standard `Introspect`
    /// method.
    pub fn build(self) -> Result<Object> {
        let mut methods = self.wrapped_methods;
        methods.extend(self.methods);
        let mut signals = self.wrapped_signals;
        signals.extend(self.signals);
        for method in &methods {
            method.validate()?;
        }
        for signal in &signals {
            signal.validate()?;
        }
        let has_introspect = methods
            .iter()
            .any(|m| m.matches(METHOD_INTROSPECT, Some(INTERFACE_INTROSPECTABLE)));
        if !has_introspect {
            methods.push(
                Method::new(INTERFACE_INTROSPECTABLE, METHOD_INTROSPECT, |ctx, _| async move {
                    let path = ctx.message().path().unwrap_or("/").to_owned();
                    match ctx.object().introspect(&path) {
                        Ok(xml) => Outcome::value(xml),
                        Err(e) => Outcome::Fault(Box::new(e)),
                    }
                })
                .args_in("")
                .args_out("s"),
            );
        }
        Ok(Object { methods, signals })
    }
}

/// The method and signal table of one published object.
#[derive(Debug)]
pub struct Object {
    methods: Vec<Method>,
    signals: Vec<Signal>,
}

impl Object {
    pub fn builder() -> ObjectBuilder {
        ObjectBuilder::new()
    }

    /// An object exposing only what `target` declares.
    pub fn wrap<T: Exported>(target: Arc<T>) -> Result<Object> {
        ObjectBuilder::new().wrap(target).build()
    }

    pub fn methods(&self) -> &[Method] {
        &self.methods
    }

    pub fn signals(&self) -> &[Signal] {
        &self.signals
    }

    /// First method named `member`, on `interface` if one is given.
    pub fn find_method(&self, member: &str, interface: Option<&str>) -> Option<&Method> {
        self.methods.iter().find(|m| m.matches(member, interface))
    }

    pub fn find_signal(&self, name: &str) -> Option<&Signal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// The introspection document for this object published at `path`.
    pub fn introspect(&self, path: &str) -> Result<String> {
        self.describe(path)?.to_xml()
    }

    /// Interfaces appear in the order they are first mentioned, methods
    /// before signals.
    pub fn describe(&self, path: &str) -> Result<Node> {
        let mut interfaces: Vec<Interface> = Vec::new();
        fn entry<'a>(interfaces: &'a mut Vec<Interface>, name: &str) -> &'a mut Interface {
            match interfaces.iter().position(|i| i.name == name) {
                Some(index) => &mut interfaces[index],
                None => {
                    interfaces.push(Interface {
                        name: name.to_owned(),
                        ..Default::default()
                    });
                    let last = interfaces.len() - 1;
                    &mut interfaces[last]
                }
            }
        }
        for method in &self.methods {
            let mut args = described_args(method.args_in.as_deref(), "in", Some(DIRECTION_IN))?;
            args.extend(described_args(method.args_out.as_deref(), "out", Some(DIRECTION_OUT))?);
            entry(&mut interfaces, &method.interface).methods.push(Member {
                name: method.name.clone(),
                args,
            });
        }
        for signal in &self.signals {
            let args = described_args(signal.args.as_deref(), "arg", None)?;
            entry(&mut interfaces, &signal.interface).signals.push(Member {
                name: signal.name.clone(),
                args,
            });
        }
        Ok(Node {
            name: Some(path.to_owned()),
            interfaces,
            children: Vec::new(),
        })
    }
}

fn described_args(sig: Option<&str>, prefix: &str, direction: Option<&str>) -> Result<Vec<Arg>> {
    let Some(sig) = sig else {
        return Ok(Vec::new());
    };
    let tokens = signature::split(sig).map_err(|e| Error::invalid_signature(sig, e))?;
    Ok(tokens
        .into_iter()
        .enumerate()
        .map(|(i, ty)| Arg::new(format!("{prefix}{i}"), ty, direction))
        .collect())
}

/// The call a handler is answering, and where it arrived.
#[derive(Clone)]
pub struct CallContext {
    connection: Connection,
    message: Arc<Message>,
    method: Method,
    object: Arc<Object>,
}

impl CallContext {
    pub(crate) fn new(connection: Connection, message: Arc<Message>, method: Method, object: Arc<Object>) -> Self {
        Self {
            connection,
            message,
            method,
            object,
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn object(&self) -> &Arc<Object> {
        &self.object
    }

    /// Send the reply now. The handler should return the result, which
    /// keeps a second reply from being sent.
    pub fn reply(&self, signature: &str, args: Vec<Value>) -> Result<Outcome> {
        let reply = self.message.reply()?.with_args(signature, args)?;
        if !self.message.no_reply() {
            self.connection.send(reply)?;
        }
        Ok(Outcome::Suppressed)
    }

    /// Send an error reply now. An invalid error name is replaced by
    /// `Failed`.
    pub fn error(&self, error_name: &str) -> Outcome {
        send_error(&self.connection, &self.message, error_name, None);
        Outcome::Suppressed
    }

    /// Emit one of the object's declared signals from the path this call
    /// arrived on.
    pub fn emit(&self, signal: &str, args: Vec<Value>) -> Result<u32> {
        let declared = self
            .object
            .find_signal(signal)
            .ok_or_else(|| Error::UnknownMember(signal.to_owned()))?;
        let path = self.message.path().unwrap_or("/");
        self.connection.emit_signal(
            path,
            &declared.interface,
            &declared.name,
            declared.signature(),
            args,
            None,
        )
    }
}

/// Send an error answering `call`, unless it asked for no reply.
pub(crate) fn send_error(connection: &Connection, call: &Message, error_name: &str, text: Option<String>) {
    if call.no_reply() {
        return;
    }
    let error_name = if names::is_valid_error_name(error_name) {
        error_name
    } else {
        error!("handler raised invalid error name: {error_name:?}");
        ERROR_FAILED
    };
    let reply = call.error_reply(error_name).and_then(|mut reply| {
        if let Some(text) = text {
            reply.set_args("s", vec![text.into()])?;
        }
        Ok(reply)
    });
    match reply.and_then(|reply| connection.send(reply)) {
        Ok(_) => {}
        Err(e) => error!("could not send {error_name} error: {e}"),
    }
}

/// Run `ctx.method` for the call in `ctx` and answer it.
pub(crate) async fn dispatch(ctx: CallContext) {
    let span = info_span!(
        "methodcall",
        path = ctx.message.path().unwrap_or_default(),
        interface = %ctx.method.interface,
        member = %ctx.method.name,
    );
    run_method(ctx).instrument(span).await
}

async fn run_method(ctx: CallContext) {
    let message = ctx.message.clone();
    let connection = ctx.connection.clone();
    let method = ctx.method.clone();

    if let Some(args_in) = &method.args_in {
        if args_in != message.signature() {
            let text = format!(
                "invalid call signature (got: {:?}, expecting: {:?})",
                message.signature(),
                args_in
            );
            error!("{text}");
            send_error(&connection, &message, ERROR_INVALID_ARGS, Some(text));
            return;
        }
    }

    let args = message.args().to_vec();
    let outcome = match catch_unwind(AssertUnwindSafe(|| (method.handler)(ctx, args))) {
        Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
        Err(panic) => Err(panic),
    };
    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(panic) => {
            let what = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            error!("handler panicked: {what}");
            send_error(&connection, &message, ERROR_FAILED, None);
            return;
        }
    };

    let output_sig = method.args_out.as_deref().unwrap_or_default();
    let arity = match signature::split(output_sig) {
        Ok(tokens) => tokens.len(),
        Err(e) => {
            error!("invalid output signature {output_sig:?}: {e}");
            send_error(&connection, &message, ERROR_FAILED, None);
            return;
        }
    };
    let values = match outcome {
        Outcome::Suppressed => return,
        Outcome::DomainError(name) => {
            send_error(&connection, &message, &name, None);
            return;
        }
        Outcome::Fault(e) => {
            error!(error = ?e, "uncaught error in handler: {e}");
            send_error(&connection, &message, ERROR_FAILED, None);
            return;
        }
        Outcome::Normal(output) => shape(arity, output),
        Outcome::ExplicitReply(values) if values.len() == arity => Some(values),
        Outcome::ExplicitReply(values) => {
            error!("explicit reply {values:?} does not fit output signature {output_sig:?}");
            None
        }
    };
    let Some(values) = values else {
        send_error(&connection, &message, ERROR_FAILED, None);
        return;
    };

    let reply = match message.reply().and_then(|reply| Ok(reply.with_args(output_sig, values)?)) {
        Ok(reply) => reply,
        Err(e) => {
            error!("handler return value does not match signature {output_sig:?}: {e}");
            send_error(&connection, &message, ERROR_FAILED, None);
            return;
        }
    };
    if message.no_reply() {
        debug!("call asked for no reply");
        return;
    }
    if let Err(e) = connection.send(reply) {
        error!("could not send reply: {e}");
    }
}

/// Arrange a handler result as an argument list of `arity` values, or
/// `None` (after logging) if its shape cannot fit.
fn shape(arity: usize, output: Output) -> Option<Vec<Value>> {
    match (arity, output) {
        (0, Output::Empty) => Some(Vec::new()),
        (1, Output::Single(value)) => Some(vec![value]),
        (1, Output::Tuple(values)) => Some(vec![Value::Struct(values)]),
        (n, Output::Tuple(values)) if n > 1 && values.len() == n => Some(values),
        (arity, output) => {
            error!("handler result {output:?} does not fit {arity} output argument(s)");
            None
        }
    }
}
