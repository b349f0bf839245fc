//! Remote objects over a message bus.
//!
//! A [`Connection`] sends method calls and signals over a [`Transport`] and
//! correlates replies with the calls they answer. Servers publish
//! [`Object`]s made of [`Method`]s; clients talk to them through
//! [`Proxy`]s, which learn what the remote object offers by introspecting it.
//!
//! [`MemoryBus`] is a complete bus in the current process: connect to it
//! directly, or serve it over TCP and [`Connection::open`] it by address.

pub mod config;
pub mod connection;
pub mod error;
pub mod introspect;
pub mod message;
pub mod names;
pub mod object;
pub mod pending;
pub mod proxy;
pub mod signals;
pub mod signature;
pub mod transport;
pub mod typed;
pub mod types;

pub use config::{Config, DispatchMode};
pub use connection::{reply_result, Connection, Filter, FilterId, Filtered, MethodCall};
pub use error::{Error, Result};
pub use message::{Message, MessageKind};
pub use object::{CallContext, Exported, Method, MethodError, Object, ObjectBuilder, Outcome, Signal};
pub use proxy::{CallOptions, Proxy};
pub use signals::{MatchRule, SubscriptionId};
pub use transport::{memory::MemoryBus, Address, Transport, TransportError};
pub use typed::{Decode, Encode, FromArgs, IntoArgs, ObjectPath, Output, Typed};
pub use types::{ArgError, Type, Value};
