//! Typed codec: maps application values to the backing store's primitive
//! representation and to the canonical plaintext bytes that get encrypted.
//!
//! The representation is chosen by the value's static type through the
//! [`StorageValue`] trait. Any mismatch between what is stored and what is
//! requested decodes to `None`, which callers turn into their default.

use std::str::FromStr;

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::storage::StoredValue;

/// Closed set of encodings a value can take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeDescriptor {
    Bool,
    Int32,
    Int64,
    Float32,
    Float64,
    String,
    Structured,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("serialization failed: {0}")]
    Serialize(String),
}

/// A value that can be written to and read from storage.
pub trait StorageValue: Sized {
    const DESCRIPTOR: TypeDescriptor;

    /// Native backing-store form (plain path).
    fn to_stored(&self) -> Result<StoredValue, CodecError>;

    /// Decode the native form; `None` on any type mismatch.
    fn from_stored(stored: StoredValue) -> Option<Self>;

    /// Canonical plaintext bytes (encrypted path).
    fn to_bytes(&self) -> Result<Vec<u8>, CodecError>;

    /// Decode canonical bytes; `None` if they do not parse as `Self`.
    fn from_bytes(bytes: &[u8]) -> Option<Self>;
}

fn text_bytes<T: ToString>(value: &T) -> Vec<u8> {
    value.to_string().into_bytes()
}

fn parse_text<T: FromStr>(bytes: &[u8]) -> Option<T> {
    std::str::from_utf8(bytes).ok()?.parse().ok()
}

impl StorageValue for bool {
    const DESCRIPTOR: TypeDescriptor = TypeDescriptor::Bool;

    fn to_stored(&self) -> Result<StoredValue, CodecError> {
        Ok(StoredValue::Bool(*self))
    }

    fn from_stored(stored: StoredValue) -> Option<Self> {
        match stored {
            StoredValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(text_bytes(self))
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        parse_text(bytes)
    }
}

impl StorageValue for i32 {
    const DESCRIPTOR: TypeDescriptor = TypeDescriptor::Int32;

    fn to_stored(&self) -> Result<StoredValue, CodecError> {
        Ok(StoredValue::Int32(*self))
    }

    fn from_stored(stored: StoredValue) -> Option<Self> {
        match stored {
            StoredValue::Int32(v) => Some(v),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(text_bytes(self))
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        parse_text(bytes)
    }
}

impl StorageValue for i64 {
    const DESCRIPTOR: TypeDescriptor = TypeDescriptor::Int64;

    /// Values inside the `i32` range are narrowed; reads widen them back.
    fn to_stored(&self) -> Result<StoredValue, CodecError> {
        Ok(match i32::try_from(*self) {
            Ok(narrow) => StoredValue::Int32(narrow),
            Err(_) => StoredValue::Int64(*self),
        })
    }

    fn from_stored(stored: StoredValue) -> Option<Self> {
        match stored {
            StoredValue::Int32(v) => Some(i64::from(v)),
            StoredValue::Int64(v) => Some(v),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(text_bytes(self))
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        parse_text(bytes)
    }
}

impl StorageValue for f32 {
    const DESCRIPTOR: TypeDescriptor = TypeDescriptor::Float32;

    fn to_stored(&self) -> Result<StoredValue, CodecError> {
        Ok(StoredValue::Float32(*self))
    }

    fn from_stored(stored: StoredValue) -> Option<Self> {
        match stored {
            StoredValue::Float32(v) => Some(v),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(text_bytes(self))
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        parse_text(bytes)
    }
}

impl StorageValue for f64 {
    const DESCRIPTOR: TypeDescriptor = TypeDescriptor::Float64;

    fn to_stored(&self) -> Result<StoredValue, CodecError> {
        Ok(StoredValue::Float64(*self))
    }

    fn from_stored(stored: StoredValue) -> Option<Self> {
        match stored {
            StoredValue::Float64(v) => Some(v),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(text_bytes(self))
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        parse_text(bytes)
    }
}

impl StorageValue for String {
    const DESCRIPTOR: TypeDescriptor = TypeDescriptor::String;

    fn to_stored(&self) -> Result<StoredValue, CodecError> {
        Ok(StoredValue::String(self.clone()))
    }

    fn from_stored(stored: StoredValue) -> Option<Self> {
        match stored {
            StoredValue::String(v) => Some(v),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(self.as_bytes().to_vec())
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        String::from_utf8(bytes.to_vec()).ok()
    }
}

/// Wrapper selecting the structured encoding for any serde type.
///
/// Stored as JSON text. Unknown fields are ignored on decode unless the
/// inner type opts into `deny_unknown_fields`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Structured<T>(pub T);

impl<T> Structured<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T: Serialize + DeserializeOwned> StorageValue for Structured<T> {
    const DESCRIPTOR: TypeDescriptor = TypeDescriptor::Structured;

    fn to_stored(&self) -> Result<StoredValue, CodecError> {
        serde_json::to_string(&self.0)
            .map(StoredValue::String)
            .map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn from_stored(stored: StoredValue) -> Option<Self> {
        match stored {
            StoredValue::String(text) => Self::from_bytes(text.as_bytes()),
            _ => None,
        }
    }

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(&self.0).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    fn from_bytes(bytes: &[u8]) -> Option<Self> {
        match serde_json::from_slice(bytes) {
            Ok(value) => Some(Structured(value)),
            Err(err) => {
                debug!("structured decode failed: {err}");
                None
            }
        }
    }
}
