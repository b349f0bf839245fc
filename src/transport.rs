//! The message pipe underneath a [`Connection`](crate::Connection).
//!
//! A transport only moves whole messages: it assigns serials, queues
//! outbound messages until flushed, and yields inbound ones. Reply
//! correlation, filters and object dispatch live in the connection.

pub mod memory;
pub mod stream;

use crate::{
    error::{Error, Result},
    message::Message,
};
use futures::future::BoxFuture;
use std::{
    fmt, io,
    str::FromStr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("connection closed")]
    Closed,
    #[error("handshake failed: {0}")]
    Handshake(String),
}

pub trait Transport: Send + Sync + 'static {
    /// Unique bus name of this end, once known.
    fn unique_name(&self) -> Option<String>;

    /// Assign the next serial to `message` and queue it. Returns the serial.
    fn send(&self, message: &mut Message) -> Result<u32, TransportError>;

    /// Write out everything queued so far.
    fn flush(&self) -> BoxFuture<'_, Result<(), TransportError>>;

    /// Wait for the next inbound message. Dropping the future before it
    /// completes loses nothing.
    fn recv(&self) -> BoxFuture<'_, Result<Message, TransportError>>;

    fn close(&self);
}

/// Per-transport serial counter: starts at 1, never yields 0.
#[derive(Debug, Default)]
pub(crate) struct Serials(AtomicU32);

impl Serials {
    pub(crate) fn next(&self) -> u32 {
        loop {
            let serial = self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if serial != 0 {
                return serial;
            }
        }
    }

    pub(crate) fn stamp(&self, message: &mut Message) -> u32 {
        let serial = self.next();
        _ = message.set_serial(serial);
        serial
    }
}

/// Where to reach a bus: `tcp:host=H,port=P` or `unix:path=P`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Tcp { host: String, port: u16 },
    #[cfg(unix)]
    Unix { path: std::path::PathBuf },
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidAddress(s.to_owned());
        let (method, params) = s.split_once(':').ok_or_else(invalid)?;
        let param = |key: &str| {
            params
                .split(',')
                .filter_map(|kv| kv.split_once('='))
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_owned())
        };
        match method {
            "tcp" => {
                let host = param("host").unwrap_or_else(|| "localhost".to_owned());
                let port = param("port")
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(invalid)?;
                Ok(Address::Tcp { host, port })
            }
            #[cfg(unix)]
            "unix" => Ok(Address::Unix {
                path: param("path").ok_or_else(invalid)?.into(),
            }),
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "tcp:host={host},port={port}"),
            #[cfg(unix)]
            Address::Unix { path } => write!(f, "unix:path={}", path.display()),
        }
    }
}

/// Open a stream transport to `address`.
pub async fn connect(address: &Address) -> Result<Arc<dyn Transport>, TransportError> {
    match address {
        Address::Tcp { host, port } => {
            let sock = tokio::net::TcpStream::connect((host.as_str(), *port)).await?;
            Ok(Arc::new(stream::StreamTransport::handshake(sock).await?))
        }
        #[cfg(unix)]
        Address::Unix { path } => {
            let sock = tokio::net::UnixStream::connect(path).await?;
            Ok(Arc::new(stream::StreamTransport::handshake(sock).await?))
        }
    }
}
