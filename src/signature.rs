//! Type-signature strings: splitting into complete types and validation.
//!
//! A signature such as `"a(ii)s"` is a concatenation of complete types.
//! [`split`] cuts it at the top level (`["a(ii)", "s"]`) and [`validate`]
//! enforces the same limits the bus does: known type codes, balanced
//! `(...)`/`{...}`, element types after `a`, at most 32 nested arrays and
//! at most 32 nested structs, and at most 255 bytes overall.

use thiserror::Error;

/// Maximum nesting of arrays, and separately of structs/dict entries.
pub const MAX_DEPTH: usize = 32;

pub const MAX_SIGNATURE_LENGTH: usize = 255;

const BASIC_CODES: &[u8] = b"ybnqiuxtdsogh";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("unbalanced `{0}' in signature")]
    Unbalanced(char),
    #[error("unknown type code `{0}'")]
    UnknownType(char),
    #[error("array type without element type")]
    MissingElementType,
    #[error("signature nested deeper than {MAX_DEPTH} levels")]
    TooDeep,
    #[error("signature longer than {MAX_SIGNATURE_LENGTH} bytes")]
    TooLong,
    #[error("struct without fields")]
    EmptyStruct,
    #[error("dict entry must be an array element holding a basic key and one value")]
    InvalidDictEntry,
    #[error("expected exactly one complete type, got {0:?}")]
    NotSingleType(String),
}

/// Length in bytes of the first complete type at the start of `sig`.
fn one_full_type(sig: &[u8]) -> Result<usize, SignatureError> {
    let arrays = sig.iter().take_while(|&&c| c == b'a').count();
    let sig = &sig[arrays..];
    let (open, close) = match sig.first() {
        None => return Err(SignatureError::MissingElementType),
        Some(b'(') => (b'(', b')'),
        Some(b'{') => (b'{', b'}'),
        Some(&c @ (b')' | b'}')) => return Err(SignatureError::Unbalanced(c as char)),
        Some(_) => return Ok(arrays + 1),
    };
    let mut depth = 0usize;
    for (i, &c) in sig.iter().enumerate() {
        if c == open {
            depth += 1;
        } else if c == close {
            depth -= 1;
            if depth == 0 {
                return Ok(arrays + i + 1);
            }
        }
    }
    Err(SignatureError::Unbalanced(open as char))
}

/// Split a signature into its top-level complete types.
///
/// Re-concatenating the result always yields `signature` again.
pub fn split(signature: &str) -> Result<Vec<&str>, SignatureError> {
    let bytes = signature.as_bytes();
    let mut tokens = Vec::new();
    let mut start = 0;
    while start < bytes.len() {
        let len = one_full_type(&bytes[start..])?;
        tokens.push(&signature[start..start + len]);
        start += len;
    }
    Ok(tokens)
}

pub fn is_valid(signature: &str) -> bool {
    validate(signature).is_ok()
}

pub fn validate(signature: &str) -> Result<(), SignatureError> {
    if signature.len() > MAX_SIGNATURE_LENGTH {
        return Err(SignatureError::TooLong);
    }
    check_types(signature, 0, 0)
}

/// Validate a signature that must hold exactly one complete type, as the
/// signature of a variant does.
pub fn validate_single(signature: &str) -> Result<(), SignatureError> {
    validate(signature)?;
    match split(signature)?.len() {
        1 => Ok(()),
        _ => Err(SignatureError::NotSingleType(signature.to_owned())),
    }
}

fn check_types(signature: &str, arrays: usize, structs: usize) -> Result<(), SignatureError> {
    for token in split(signature)? {
        check_type(token, arrays, structs, false)?;
    }
    Ok(())
}

fn check_type(
    token: &str,
    arrays: usize,
    structs: usize,
    array_element: bool,
) -> Result<(), SignatureError> {
    let bytes = token.as_bytes();
    match bytes[0] {
        b'a' => {
            if arrays >= MAX_DEPTH {
                return Err(SignatureError::TooDeep);
            }
            check_type(&token[1..], arrays + 1, structs, true)
        }
        b'(' => {
            if structs >= MAX_DEPTH {
                return Err(SignatureError::TooDeep);
            }
            let inner = &token[1..token.len() - 1];
            if inner.is_empty() {
                return Err(SignatureError::EmptyStruct);
            }
            check_types(inner, arrays, structs + 1)
        }
        b'{' => {
            if !array_element {
                return Err(SignatureError::InvalidDictEntry);
            }
            if structs >= MAX_DEPTH {
                return Err(SignatureError::TooDeep);
            }
            let inner = &token[1..token.len() - 1];
            let fields = split(inner)?;
            let basic_key = fields
                .first()
                .map_or(false, |key| key.len() == 1 && BASIC_CODES.contains(&key.as_bytes()[0]));
            if fields.len() != 2 || !basic_key {
                return Err(SignatureError::InvalidDictEntry);
            }
            check_types(inner, arrays, structs + 1)
        }
        c if bytes.len() == 1 && (BASIC_CODES.contains(&c) || c == b'v') => Ok(()),
        c => Err(SignatureError::UnknownType(c as char)),
    }
}
