//! Conversions between Rust types and [`Value`]s.
//!
//! [`Typed`] gives the signature a Rust type marshals to, [`Encode`] and
//! [`Decode`] convert single values, and [`FromArgs`]/[`IntoArgs`] convert
//! whole argument lists (tuples) so typed method handlers can infer their
//! `args_in`/`args_out` signatures.

use crate::types::{TypeMismatch, Value};
use std::collections::HashMap;
use std::hash::Hash;

pub trait Typed {
    fn signature() -> String;
}

pub trait Encode: Typed {
    fn encode(self) -> Value;
}

pub trait Decode: Typed + Sized {
    fn decode(value: Value) -> Result<Self, TypeMismatch>;
}

macro_rules! impl_encode_decode {
    ($($rust_type:ty, $code:literal => $variant:ident;)*) => {
        $(
            impl Typed for $rust_type {
                fn signature() -> String {
                    $code.to_owned()
                }
            }

            impl Encode for $rust_type {
                fn encode(self) -> Value {
                    Value::$variant(self)
                }
            }

            impl Decode for $rust_type {
                fn decode(value: Value) -> Result<Self, TypeMismatch> {
                    match value {
                        Value::$variant(v) => Ok(v),
                        other => Err(TypeMismatch::new(other, $code)),
                    }
                }
            }
        )*
    };
}

impl_encode_decode! {
    u8, "y" => Byte;
    bool, "b" => Boolean;
    i16, "n" => Int16;
    u16, "q" => UInt16;
    i32, "i" => Int32;
    u32, "u" => UInt32;
    i64, "x" => Int64;
    u64, "t" => UInt64;
    f64, "d" => Double;
    String, "s" => String;
}

/// An object path argument (`o`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectPath(pub String);

impl Typed for ObjectPath {
    fn signature() -> String {
        "o".to_owned()
    }
}

impl Encode for ObjectPath {
    fn encode(self) -> Value {
        Value::ObjectPath(self.0)
    }
}

impl Decode for ObjectPath {
    fn decode(value: Value) -> Result<Self, TypeMismatch> {
        match value {
            Value::ObjectPath(path) => Ok(ObjectPath(path)),
            other => Err(TypeMismatch::new(other, "o")),
        }
    }
}

impl<T: Typed> Typed for Vec<T> {
    fn signature() -> String {
        format!("a{}", T::signature())
    }
}

impl<T: Encode> Encode for Vec<T> {
    fn encode(self) -> Value {
        Value::Array(self.into_iter().map(Encode::encode).collect())
    }
}

impl<T: Decode> Decode for Vec<T> {
    fn decode(value: Value) -> Result<Self, TypeMismatch> {
        match value {
            Value::Array(items) => items.into_iter().map(T::decode).collect(),
            other => Err(TypeMismatch::new(other, Self::signature())),
        }
    }
}

impl<K: Typed, V: Typed> Typed for HashMap<K, V> {
    fn signature() -> String {
        format!("a{{{}{}}}", K::signature(), V::signature())
    }
}

impl<K: Encode, V: Encode> Encode for HashMap<K, V> {
    fn encode(self) -> Value {
        Value::Dict(self.into_iter().map(|(k, v)| (k.encode(), v.encode())).collect())
    }
}

impl<K: Decode + Eq + Hash, V: Decode> Decode for HashMap<K, V> {
    fn decode(value: Value) -> Result<Self, TypeMismatch> {
        match value {
            Value::Dict(entries) => entries
                .into_iter()
                .map(|(k, v)| Ok((K::decode(k)?, V::decode(v)?)))
                .collect(),
            other => Err(TypeMismatch::new(other, Self::signature())),
        }
    }
}

/// A whole input argument list.
pub trait FromArgs: Sized {
    fn signature() -> String;
    fn from_args(args: Vec<Value>) -> Result<Self, TypeMismatch>;
}

/// A whole output argument list.
pub trait IntoArgs {
    fn signature() -> String;
    fn into_args(self) -> Vec<Value>;
}

impl FromArgs for () {
    fn signature() -> String {
        String::new()
    }

    fn from_args(args: Vec<Value>) -> Result<Self, TypeMismatch> {
        match args.into_iter().next() {
            None => Ok(()),
            Some(extra) => Err(TypeMismatch::new(extra, "")),
        }
    }
}

impl IntoArgs for () {
    fn signature() -> String {
        String::new()
    }

    fn into_args(self) -> Vec<Value> {
        Vec::new()
    }
}

// Tuples are structs as single values, and argument lists as a whole.
macro_rules! impl_tuple {
    ($($name:ident),+) => {
        impl<$($name: Typed),+> Typed for ($($name,)+) {
            fn signature() -> String {
                format!("({})", [$($name::signature()),+].concat())
            }
        }

        impl<$($name: Encode),+> Encode for ($($name,)+) {
            #[allow(non_snake_case)]
            fn encode(self) -> Value {
                let ($($name,)+) = self;
                Value::Struct(vec![$($name.encode()),+])
            }
        }

        impl<$($name: Decode),+> Decode for ($($name,)+) {
            fn decode(value: Value) -> Result<Self, TypeMismatch> {
                match value {
                    Value::Struct(items) => <Self as FromArgs>::from_args(items),
                    other => Err(TypeMismatch::new(other, <Self as Typed>::signature())),
                }
            }
        }

        impl<$($name: Decode),+> FromArgs for ($($name,)+) {
            fn signature() -> String {
                [$($name::signature()),+].concat()
            }

            fn from_args(args: Vec<Value>) -> Result<Self, TypeMismatch> {
                let expected = <Self as FromArgs>::signature();
                let missing = || TypeMismatch::new(Value::Struct(Vec::new()), expected.clone());
                let mut args = args.into_iter();
                let decoded = ($($name::decode(args.next().ok_or_else(missing)?)?,)+);
                match args.next() {
                    None => Ok(decoded),
                    Some(extra) => Err(TypeMismatch::new(extra, expected)),
                }
            }
        }

        impl<$($name: Encode),+> IntoArgs for ($($name,)+) {
            fn signature() -> String {
                [$($name::signature()),+].concat()
            }

            #[allow(non_snake_case)]
            fn into_args(self) -> Vec<Value> {
                let ($($name,)+) = self;
                vec![$($name.encode()),+]
            }
        }
    };
}

impl_tuple!(A);
impl_tuple!(A, B);
impl_tuple!(A, B, C);
impl_tuple!(A, B, C, D);
impl_tuple!(A, B, C, D, E);

/// The shape of a method's result: nothing, one value, or several.
#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    Empty,
    Single(Value),
    Tuple(Vec<Value>),
}

impl Output {
    pub fn value(value: impl Into<Value>) -> Output {
        Output::Single(value.into())
    }

    /// Zero arguments are `Empty`, one is `Single`, more are a `Tuple`.
    pub fn from_args(mut args: Vec<Value>) -> Output {
        match args.len() {
            0 => Output::Empty,
            1 => Output::Single(args.remove(0)),
            _ => Output::Tuple(args),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Output::Empty)
    }

    pub fn into_single(self) -> Option<Value> {
        match self {
            Output::Single(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_values(self) -> Vec<Value> {
        match self {
            Output::Empty => Vec::new(),
            Output::Single(value) => vec![value],
            Output::Tuple(values) => values,
        }
    }

    pub fn decode<T: FromArgs>(self) -> Result<T, TypeMismatch> {
        T::from_args(self.into_values())
    }
}
