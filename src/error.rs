use crate::{
    message::MessageKind, names::NameKind, signature::SignatureError, transport::TransportError,
    types::ArgError,
};
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Args(#[from] ArgError),
    #[error("invalid {kind}: {name:?}")]
    InvalidName { kind: NameKind, name: String },
    #[error("invalid signature {signature:?}: {source}")]
    InvalidSignature {
        signature: String,
        source: SignatureError,
    },
    #[error("serial numbers start at 1")]
    InvalidSerial,
    /// The peer answered with an error message.
    #[error("{name}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
    Remote {
        name: String,
        message: Option<String>,
    },
    #[error("no reply within the timeout")]
    Timeout,
    #[error("method {0} exists on several interfaces and none was selected")]
    AmbiguousInterface(String),
    #[error("no method or signal named {0}")]
    UnknownMember(String),
    #[error("an object is already published at {0}")]
    PathInUse(String),
    #[error("no object published at {0}")]
    NotPublished(String),
    #[error("expected a method call, got {0}")]
    NotACall(MessageKind),
    #[error("introspection failed: {0}")]
    Introspection(String),
    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),
    #[error("invalid match rule {0:?}")]
    InvalidMatchRule(String),
    #[error("invalid bus address {0:?}")]
    InvalidAddress(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl Error {
    pub(crate) fn invalid_signature(signature: &str, source: SignatureError) -> Self {
        Error::InvalidSignature {
            signature: signature.to_owned(),
            source,
        }
    }

    /// Name of the remote error, if this is one.
    pub fn remote_name(&self) -> Option<&str> {
        match self {
            Error::Remote { name, .. } => Some(name),
            _ => None,
        }
    }
}
