use crate::signature::{self, SignatureError};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One complete type, as described by a single-type signature token.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum Type {
    Byte,
    Boolean,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Double,
    String,
    ObjectPath,
    Signature,
    UnixFd,
    Variant,
    Array(Box<Type>),
    /// `a{kv}`: dict entries only ever appear as array elements.
    Dict(Box<Type>, Box<Type>),
    Struct(Vec<Type>),
}

impl Type {
    /// Parse a signature holding exactly one complete type.
    pub fn parse(token: &str) -> Result<Type, SignatureError> {
        signature::validate_single(token)?;
        Ok(Self::parse_valid(token))
    }

    /// Parse every complete type of a signature.
    pub fn parse_all(sig: &str) -> Result<Vec<Type>, SignatureError> {
        signature::validate(sig)?;
        Ok(signature::split(sig)?
            .into_iter()
            .map(Self::parse_valid)
            .collect())
    }

    fn parse_valid(token: &str) -> Type {
        use Type::*;
        let bytes = token.as_bytes();
        match bytes[0] {
            b'a' if bytes.get(1) == Some(&b'{') => {
                let inner = &token[2..token.len() - 1];
                let fields = signature::split(inner).unwrap_or_default();
                match fields.as_slice() {
                    [key, value] => Dict(
                        Box::new(Self::parse_valid(key)),
                        Box::new(Self::parse_valid(value)),
                    ),
                    // unreachable for validated signatures
                    _ => Array(Box::new(Variant)),
                }
            }
            b'a' => Array(Box::new(Self::parse_valid(&token[1..]))),
            b'(' => Struct(
                signature::split(&token[1..token.len() - 1])
                    .unwrap_or_default()
                    .into_iter()
                    .map(Self::parse_valid)
                    .collect(),
            ),
            b'y' => Byte,
            b'b' => Boolean,
            b'n' => Int16,
            b'q' => UInt16,
            b'i' => Int32,
            b'u' => UInt32,
            b'x' => Int64,
            b't' => UInt64,
            b'd' => Double,
            b's' => String,
            b'o' => ObjectPath,
            b'g' => Signature,
            b'h' => UnixFd,
            _ => Variant,
        }
    }

    pub fn code(&self) -> char {
        use Type::*;
        match self {
            Byte => 'y',
            Boolean => 'b',
            Int16 => 'n',
            UInt16 => 'q',
            Int32 => 'i',
            UInt32 => 'u',
            Int64 => 'x',
            UInt64 => 't',
            Double => 'd',
            String => 's',
            ObjectPath => 'o',
            Signature => 'g',
            UnixFd => 'h',
            Variant => 'v',
            Array(_) | Dict(..) => 'a',
            Struct(_) => '(',
        }
    }

    pub fn signature(&self) -> std::string::String {
        match self {
            Type::Array(elem) => format!("a{}", elem.signature()),
            Type::Dict(key, value) => format!("a{{{}{}}}", key.signature(), value.signature()),
            Type::Struct(fields) => {
                let inner: std::string::String = fields.iter().map(Type::signature).collect();
                format!("({inner})")
            }
            basic => basic.code().to_string(),
        }
    }

    /// Inclusive range of the integer types, `None` for everything else.
    fn integer_range(&self) -> Option<(i128, i128)> {
        use Type::*;
        Some(match self {
            Byte => (0, u8::MAX as i128),
            Int16 => (i16::MIN as i128, i16::MAX as i128),
            UInt16 => (0, u16::MAX as i128),
            Int32 => (i32::MIN as i128, i32::MAX as i128),
            UInt32 | UnixFd => (0, u32::MAX as i128),
            Int64 => (i64::MIN as i128, i64::MAX as i128),
            UInt64 => (0, u64::MAX as i128),
            _ => return None,
        })
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.signature())
    }
}

/// A dynamically typed argument value.
///
/// Values handed to [`Message::set_args`](crate::Message::set_args) may be
/// loosely typed (any integer for any integer format, sequences for
/// structs); the values stored in a message always match its signature
/// exactly.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    String(String),
    ObjectPath(String),
    Signature(String),
    UnixFd(u32),
    Array(Vec<Value>),
    Dict(Vec<(Value, Value)>),
    Struct(Vec<Value>),
    /// Signature of the contained value, and the value.
    Variant(String, Box<Value>),
}

impl Value {
    pub fn variant(signature: impl Into<String>, value: impl Into<Value>) -> Value {
        Value::Variant(signature.into(), Box::new(value.into()))
    }

    pub fn kind_name(&self) -> &'static str {
        use Value::*;
        match self {
            Byte(_) => "byte",
            Boolean(_) => "boolean",
            Int16(_) => "int16",
            UInt16(_) => "uint16",
            Int32(_) => "int32",
            UInt32(_) => "uint32",
            Int64(_) => "int64",
            UInt64(_) => "uint64",
            Double(_) => "double",
            String(_) => "string",
            ObjectPath(_) => "object path",
            Signature(_) => "signature",
            UnixFd(_) => "unix fd",
            Array(_) => "array",
            Dict(_) => "dict",
            Struct(_) => "struct",
            Variant(..) => "variant",
        }
    }

    /// Any integer (or boolean) widened to `i128`.
    pub fn as_integer(&self) -> Option<i128> {
        use Value::*;
        Some(match *self {
            Byte(n) => n as i128,
            Boolean(b) => b as i128,
            Int16(n) => n as i128,
            UInt16(n) => n as i128,
            Int32(n) => n as i128,
            UInt32(n) | UnixFd(n) => n as i128,
            Int64(n) => n as i128,
            UInt64(n) => n as i128,
            _ => return None,
        })
    }

    /// Contents of a string, object path or signature value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(d) => Some(*d),
            other => other.as_integer().map(|n| n as f64),
        }
    }

    /// Truthiness used when a boolean is expected.
    pub fn is_truthy(&self) -> bool {
        use Value::*;
        match self {
            Boolean(b) => *b,
            Double(d) => *d != 0.0,
            String(s) | ObjectPath(s) | Signature(s) => !s.is_empty(),
            Array(items) | Struct(items) => !items.is_empty(),
            Dict(entries) => !entries.is_empty(),
            Variant(..) => true,
            other => other.as_integer().map_or(false, |n| n != 0),
        }
    }
}

macro_rules! impl_from_for_value {
    ($($rust_type:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$rust_type> for Value {
                fn from(v: $rust_type) -> Self {
                    Value::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_for_value!(
    u8 => Byte,
    bool => Boolean,
    i16 => Int16,
    u16 => UInt16,
    i32 => Int32,
    u32 => UInt32,
    i64 => Int64,
    u64 => UInt64,
    f64 => Double,
    String => String,
    &str => String,
    Vec<Value> => Array,
);

/// Argument marshalling failure.
///
/// `Type` is a structural mismatch (wrong kind of value, wrong number of
/// values); `Value` is well-shaped data the format cannot carry (integer out
/// of range, malformed object path or signature).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgError {
    #[error("type error: {0}")]
    Type(String),
    #[error("value error: {0}")]
    Value(String),
}

impl ArgError {
    pub fn is_type_error(&self) -> bool {
        matches!(self, ArgError::Type(_))
    }

    pub fn is_value_error(&self) -> bool {
        matches!(self, ArgError::Value(_))
    }
}

impl From<SignatureError> for ArgError {
    fn from(e: SignatureError) -> Self {
        ArgError::Value(format!("invalid signature: {e}"))
    }
}

/// Check `values` against the complete types of `sig`, converting each one
/// to the exact variant its type requires.
pub fn coerce_args(sig: &str, values: Vec<Value>) -> Result<Vec<Value>, ArgError> {
    let types = Type::parse_all(sig)?;
    coerce_seq(&types, values)
}

fn coerce_seq(types: &[Type], values: Vec<Value>) -> Result<Vec<Value>, ArgError> {
    if values.len() < types.len() {
        return Err(ArgError::Type(format!(
            "too few arguments for signature (expected {}, got {})",
            types.len(),
            values.len()
        )));
    }
    if values.len() > types.len() {
        return Err(ArgError::Type(format!(
            "too many arguments for signature (expected {}, got {})",
            types.len(),
            values.len()
        )));
    }
    types
        .iter()
        .zip(values)
        .map(|(ty, value)| coerce(ty, value))
        .collect()
}

/// Convert one value to the exact representation of `ty`.
pub fn coerce(ty: &Type, value: Value) -> Result<Value, ArgError> {
    if let Some((min, max)) = ty.integer_range() {
        let n = value.as_integer().ok_or_else(|| {
            ArgError::Type(format!(
                "expecting integer argument for `{}' format, got {}",
                ty.code(),
                value.kind_name()
            ))
        })?;
        if n < min || n > max {
            return Err(ArgError::Value(format!(
                "value {n} out of range for `{}' format",
                ty.code()
            )));
        }
        // the range check above makes every cast lossless
        return Ok(match ty {
            Type::Byte => Value::Byte(n as u8),
            Type::Int16 => Value::Int16(n as i16),
            Type::UInt16 => Value::UInt16(n as u16),
            Type::Int32 => Value::Int32(n as i32),
            Type::UInt32 => Value::UInt32(n as u32),
            Type::UnixFd => Value::UnixFd(n as u32),
            Type::Int64 => Value::Int64(n as i64),
            _ => Value::UInt64(n as u64),
        });
    }
    match ty {
        Type::Boolean => Ok(Value::Boolean(value.is_truthy())),
        Type::Double => value.as_f64().map(Value::Double).ok_or_else(|| {
            ArgError::Type(format!(
                "expecting number for `d' format, got {}",
                value.kind_name()
            ))
        }),
        Type::String | Type::ObjectPath | Type::Signature => coerce_string(ty, value),
        Type::Struct(fields) => match value {
            Value::Struct(items) | Value::Array(items) => Ok(Value::Struct(coerce_seq(fields, items)?)),
            other => Err(ArgError::Type(format!(
                "expecting sequence argument for struct format, got {}",
                other.kind_name()
            ))),
        },
        Type::Array(elem) => match value {
            Value::Array(items) | Value::Struct(items) => Ok(Value::Array(
                items
                    .into_iter()
                    .map(|item| coerce(elem, item))
                    .collect::<Result<_, _>>()?,
            )),
            other => Err(ArgError::Type(format!(
                "expecting sequence argument for array format, got {}",
                other.kind_name()
            ))),
        },
        Type::Dict(key_ty, value_ty) => match value {
            Value::Dict(entries) => Ok(Value::Dict(
                entries
                    .into_iter()
                    .map(|(k, v)| Ok((coerce(key_ty, k)?, coerce(value_ty, v)?)))
                    .collect::<Result<_, ArgError>>()?,
            )),
            other => Err(ArgError::Type(format!(
                "expecting dict argument for dict format, got {}",
                other.kind_name()
            ))),
        },
        Type::Variant => coerce_variant(value),
        // integer formats returned above
        _ => Err(ArgError::Type(format!("unsupported format `{}'", ty.code()))),
    }
}

fn coerce_string(ty: &Type, value: Value) -> Result<Value, ArgError> {
    let s = match value {
        Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => s,
        other => {
            return Err(ArgError::Type(format!(
                "expecting str for `{}' format, got {}",
                ty.code(),
                other.kind_name()
            )))
        }
    };
    match ty {
        Type::ObjectPath if !crate::names::is_valid_path(&s) => {
            Err(ArgError::Value(format!("invalid object path argument {s:?}")))
        }
        Type::ObjectPath => Ok(Value::ObjectPath(s)),
        Type::Signature => {
            signature::validate(&s)?;
            Ok(Value::Signature(s))
        }
        _ => Ok(Value::String(s)),
    }
}

fn coerce_variant(value: Value) -> Result<Value, ArgError> {
    let (sig, inner) = match value {
        Value::Variant(sig, inner) => (sig, *inner),
        // a (signature, value) pair
        Value::Struct(items) => match <[Value; 2]>::try_from(items) {
            Ok([Value::String(sig) | Value::Signature(sig), inner]) => (sig, inner),
            Ok(_) => {
                return Err(ArgError::Type(
                    "first item in sequence for variant must be a signature string".to_owned(),
                ))
            }
            Err(_) => {
                return Err(ArgError::Value(
                    "expecting a sequence of length 2 for variant".to_owned(),
                ))
            }
        },
        other => {
            return Err(ArgError::Type(format!(
                "expecting variant, got {}",
                other.kind_name()
            )))
        }
    };
    signature::validate_single(&sig)
        .map_err(|e| ArgError::Value(format!("invalid signature for variant: {e}")))?;
    let ty = Type::parse_valid(&sig);
    Ok(Value::Variant(sig, Box::new(coerce(&ty, inner)?)))
}

#[derive(Debug, Clone, Error)]
#[error("type mismatch: expected {expected_type}, got {value:?}")]
pub struct TypeMismatch {
    value: Value,
    expected_type: String,
}

impl TypeMismatch {
    pub(crate) fn new(value: Value, expected_type: impl Into<String>) -> Self {
        Self {
            value,
            expected_type: expected_type.into(),
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }
}
