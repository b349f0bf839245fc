//! Name validation and the well-known names of the message bus.
//!
//! Every header field that ends up on the wire goes through one of the
//! `is_valid_*` checks below before it is accepted into a [`Message`].
//!
//! [`Message`]: crate::Message

use std::fmt;

/// Longest bus name, interface, member or error name the bus accepts.
pub const MAX_NAME_LENGTH: usize = 255;

pub const SERVICE_DBUS: &str = "org.freedesktop.DBus";
pub const PATH_DBUS: &str = "/org/freedesktop/DBus";
pub const INTERFACE_DBUS: &str = "org.freedesktop.DBus";
pub const INTERFACE_INTROSPECTABLE: &str = "org.freedesktop.DBus.Introspectable";

pub const ERROR_FAILED: &str = "org.freedesktop.DBus.Error.Failed";
pub const ERROR_INVALID_ARGS: &str = "org.freedesktop.DBus.Error.InvalidArgs";
pub const ERROR_TIMEOUT: &str = "org.freedesktop.DBus.Error.Timeout";
pub const ERROR_DISCONNECTED: &str = "org.freedesktop.DBus.Error.Disconnected";
pub const ERROR_UNKNOWN_METHOD: &str = "org.freedesktop.DBus.Error.UnknownMethod";
pub const ERROR_UNKNOWN_OBJECT: &str = "org.freedesktop.DBus.Error.UnknownObject";
pub const ERROR_UNKNOWN_INTERFACE: &str = "org.freedesktop.DBus.Error.UnknownInterface";
pub const ERROR_SERVICE_UNKNOWN: &str = "org.freedesktop.DBus.Error.ServiceUnknown";
pub const ERROR_NAME_HAS_NO_OWNER: &str = "org.freedesktop.DBus.Error.NameHasNoOwner";
pub const ERROR_MATCH_RULE_INVALID: &str = "org.freedesktop.DBus.Error.MatchRuleInvalid";
pub const ERROR_MATCH_RULE_NOT_FOUND: &str = "org.freedesktop.DBus.Error.MatchRuleNotFound";

/// Administrative methods on [`INTERFACE_DBUS`].
pub const METHOD_ADD_MATCH: &str = "AddMatch";
pub const METHOD_REMOVE_MATCH: &str = "RemoveMatch";
pub const METHOD_REQUEST_NAME: &str = "RequestName";
pub const METHOD_RELEASE_NAME: &str = "ReleaseName";
pub const METHOD_LIST_NAMES: &str = "ListNames";
pub const METHOD_GET_NAME_OWNER: &str = "GetNameOwner";
pub const METHOD_INTROSPECT: &str = "Introspect";
pub const SIGNAL_NAME_ACQUIRED: &str = "NameAcquired";

pub const INTROSPECT_DOCTYPE: &str = "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\"\n\"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n";

/// The kind of name a validation failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameKind {
    BusName,
    ObjectPath,
    Interface,
    Member,
    ErrorName,
}

impl fmt::Display for NameKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use NameKind::*;
        f.write_str(match self {
            BusName => "bus name",
            ObjectPath => "object path",
            Interface => "interface name",
            Member => "member name",
            ErrorName => "error name",
        })
    }
}

impl NameKind {
    pub fn check(self, name: &str) -> bool {
        use NameKind::*;
        match self {
            BusName => is_valid_bus_name(name),
            ObjectPath => is_valid_path(name),
            Interface => is_valid_interface(name),
            Member => is_valid_member(name),
            ErrorName => is_valid_error_name(name),
        }
    }
}

fn is_name_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

/// Well-known (`org.example.Service`) or unique (`:1.42`) bus names.
pub fn is_valid_bus_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LENGTH || bytes[0] == b'.' {
        return false;
    }
    let unique = bytes[0] == b':';
    let mut dots = 0;
    for (i, &c) in bytes.iter().enumerate() {
        let prev = if i > 0 { bytes[i - 1] } else { 0 };
        let ok = match c {
            b':' => i == 0,
            b'.' => i > 0 && prev != b'.' && prev != b':',
            b'0'..=b'9' => i > 0 && (prev != b'.' || unique),
            c => is_name_start(c) || c == b'-',
        };
        if !ok {
            return false;
        }
        if c == b'.' {
            dots += 1;
        }
    }
    bytes[bytes.len() - 1] != b'.' && dots > 0
}

/// `/`-rooted, `/`-separated segments of `[A-Za-z0-9_]`.
pub fn is_valid_path(path: &str) -> bool {
    let bytes = path.as_bytes();
    if bytes.first() != Some(&b'/') {
        return false;
    }
    if bytes.len() == 1 {
        return true;
    }
    for i in 1..bytes.len() {
        let c = bytes[i];
        let ok = c.is_ascii_alphanumeric() || c == b'_' || (c == b'/' && bytes[i - 1] != b'/');
        if !ok {
            return false;
        }
    }
    bytes[bytes.len() - 1] != b'/'
}

pub fn is_valid_interface(interface: &str) -> bool {
    let bytes = interface.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LENGTH || !is_name_start(bytes[0]) {
        return false;
    }
    let mut dots = 0;
    for i in 1..bytes.len() {
        let (c, prev) = (bytes[i], bytes[i - 1]);
        let ok = match c {
            b'.' => prev != b'.',
            b'0'..=b'9' => prev != b'.',
            c => is_name_start(c),
        };
        if !ok {
            return false;
        }
        if c == b'.' {
            dots += 1;
        }
    }
    bytes[bytes.len() - 1] != b'.' && dots > 0
}

pub fn is_valid_member(member: &str) -> bool {
    let bytes = member.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_NAME_LENGTH || !is_name_start(bytes[0]) {
        return false;
    }
    bytes[1..]
        .iter()
        .all(|&c| c.is_ascii_alphanumeric() || c == b'_')
}

/// Error names follow the interface name grammar.
pub fn is_valid_error_name(name: &str) -> bool {
    is_valid_interface(name)
}
