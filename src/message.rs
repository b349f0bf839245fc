use crate::{
    error::{Error, Result},
    names::NameKind,
    types::{self, ArgError, Value},
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum MessageKind {
    Call,
    Return,
    Error,
    Signal,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            MessageKind::Call => "method call",
            MessageKind::Return => "method return",
            MessageKind::Error => "error",
            MessageKind::Signal => "signal",
        })
    }
}

/// A message sent or received on a connection.
///
/// Header fields are validated when they are set. The signature is derived
/// from the arguments: both are replaced together by [`set_args`], so they
/// can never disagree.
///
/// Decoding goes through the same checks, so a malformed frame fails to
/// decode.
///
/// [`set_args`]: Message::set_args
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(try_from = "RawMessage")]
pub struct Message {
    kind: MessageKind,
    no_reply: bool,
    no_auto_start: bool,
    serial: Option<u32>,
    reply_serial: Option<u32>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    signature: String,
    args: Vec<Value>,
}

/// A message as it appears on the wire, before any checks.
#[derive(Deserialize)]
struct RawMessage {
    kind: MessageKind,
    no_reply: bool,
    no_auto_start: bool,
    serial: Option<u32>,
    reply_serial: Option<u32>,
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    signature: String,
    args: Vec<Value>,
}

impl TryFrom<RawMessage> for Message {
    type Error = Error;

    fn try_from(raw: RawMessage) -> Result<Self> {
        let mut message = Message::new(raw.kind);
        message.no_reply = raw.no_reply;
        message.no_auto_start = raw.no_auto_start;
        if let Some(serial) = raw.serial {
            message.set_serial(serial)?;
        }
        if let Some(serial) = raw.reply_serial {
            message.set_reply_serial(serial)?;
        }
        let headers: [(fn(&mut Message, &str) -> Result<()>, Option<String>); 6] = [
            (Message::set_path, raw.path),
            (Message::set_interface, raw.interface),
            (Message::set_member, raw.member),
            (Message::set_error_name, raw.error_name),
            (Message::set_destination, raw.destination),
            (Message::set_sender, raw.sender),
        ];
        for (set, value) in headers {
            if let Some(value) = value {
                set(&mut message, &value)?;
            }
        }
        message.set_args(&raw.signature, raw.args)?;
        Ok(message)
    }
}

fn checked(kind: NameKind, value: &str) -> Result<String> {
    if kind.check(value) {
        Ok(value.to_owned())
    } else {
        Err(Error::InvalidName {
            kind,
            name: value.to_owned(),
        })
    }
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Self {
            kind,
            no_reply: false,
            no_auto_start: false,
            serial: None,
            reply_serial: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            destination: None,
            sender: None,
            signature: String::new(),
            args: Vec::new(),
        }
    }

    /// A call of `method` on `interface` of the object at `path` owned by
    /// bus name `destination`.
    pub fn method_call(destination: &str, path: &str, interface: &str, method: &str) -> Result<Self> {
        let mut message = Self::new(MessageKind::Call);
        message.set_destination(destination)?;
        message.set_path(path)?;
        message.set_interface(interface)?;
        message.set_member(method)?;
        Ok(message)
    }

    /// Signal `name` on `interface`, emitted from the object at `path`.
    pub fn signal(path: &str, interface: &str, name: &str) -> Result<Self> {
        let mut message = Self::new(MessageKind::Signal);
        message.set_path(path)?;
        message.set_interface(interface)?;
        message.set_member(name)?;
        Ok(message)
    }

    /// A method return answering this call.
    pub fn reply(&self) -> Result<Self> {
        self.answer(MessageKind::Return)
    }

    /// An error answering this call. `error_name` must be a valid error name.
    pub fn error_reply(&self, error_name: &str) -> Result<Self> {
        let mut message = self.answer(MessageKind::Error)?;
        message.set_error_name(error_name)?;
        Ok(message)
    }

    fn answer(&self, kind: MessageKind) -> Result<Self> {
        if self.kind != MessageKind::Call {
            return Err(Error::NotACall(self.kind));
        }
        let mut message = Self::new(kind);
        message.reply_serial = self.serial;
        message.destination = self.sender.clone();
        Ok(message)
    }

    /// Replace the arguments. The values are checked against `signature` and
    /// converted to its exact types; on failure nothing changes.
    pub fn set_args(&mut self, signature: &str, values: Vec<Value>) -> Result<(), ArgError> {
        let args = types::coerce_args(signature, values)?;
        self.signature = signature.to_owned();
        self.args = args;
        Ok(())
    }

    pub fn with_args(mut self, signature: &str, values: Vec<Value>) -> Result<Self, ArgError> {
        self.set_args(signature, values)?;
        Ok(self)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn is_error(&self) -> bool {
        self.kind == MessageKind::Error
    }

    pub fn no_reply(&self) -> bool {
        self.no_reply
    }

    pub fn set_no_reply(&mut self, no_reply: bool) {
        self.no_reply = no_reply;
    }

    pub fn no_auto_start(&self) -> bool {
        self.no_auto_start
    }

    pub fn set_no_auto_start(&mut self, no_auto_start: bool) {
        self.no_auto_start = no_auto_start;
    }

    pub fn serial(&self) -> Option<u32> {
        self.serial
    }

    /// Serials are assigned by the transport when a message is sent.
    pub fn set_serial(&mut self, serial: u32) -> Result<()> {
        if serial == 0 {
            return Err(Error::InvalidSerial);
        }
        self.serial = Some(serial);
        Ok(())
    }

    pub fn reply_serial(&self) -> Option<u32> {
        self.reply_serial
    }

    pub fn set_reply_serial(&mut self, serial: u32) -> Result<()> {
        if serial == 0 {
            return Err(Error::InvalidSerial);
        }
        self.reply_serial = Some(serial);
        Ok(())
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: &str) -> Result<()> {
        self.path = Some(checked(NameKind::ObjectPath, path)?);
        Ok(())
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn set_interface(&mut self, interface: &str) -> Result<()> {
        self.interface = Some(checked(NameKind::Interface, interface)?);
        Ok(())
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn set_member(&mut self, member: &str) -> Result<()> {
        self.member = Some(checked(NameKind::Member, member)?);
        Ok(())
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn set_error_name(&mut self, error_name: &str) -> Result<()> {
        self.error_name = Some(checked(NameKind::ErrorName, error_name)?);
        Ok(())
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn set_destination(&mut self, destination: &str) -> Result<()> {
        self.destination = Some(checked(NameKind::BusName, destination)?);
        Ok(())
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn set_sender(&mut self, sender: &str) -> Result<()> {
        self.sender = Some(checked(NameKind::BusName, sender)?);
        Ok(())
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn into_args(self) -> Vec<Value> {
        self.args
    }

    /// First argument as a string, which is where errors carry their
    /// human readable description.
    pub fn first_str(&self) -> Option<&str> {
        self.args.first().and_then(Value::as_str)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.kind)?;
        if let Some(serial) = self.serial {
            write!(f, " #{serial}")?;
        }
        if let Some(reply_serial) = self.reply_serial {
            write!(f, " (reply to #{reply_serial})")?;
        }
        if let (Some(path), Some(member)) = (&self.path, &self.member) {
            write!(f, " {path}:{}.{member}", self.interface.as_deref().unwrap_or("*"))?;
        }
        if let Some(error_name) = &self.error_name {
            write!(f, " {error_name}")?;
        }
        write!(f, " ({:?})", self.signature)
    }
}
