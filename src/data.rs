//! Typed record payloads.
//!
//! Every record exchanged with the manager carries a [`Data`] value. Values are
//! self-describing: each one knows its LabRAD-style type tag (`w`, `s`, `*v`,
//! `(ws)`, ...), which is sent alongside the payload when the caller does not
//! supply an explicit tag.
//!
//! Errors returned by the manager or a remote server travel as ordinary
//! payloads using the [`Data::Error`] variant. Keeping them in the value type
//! lets the protocol engine find the first failing record of a reply without
//! inspecting payload contents any further.
use bincode::{Decode, Encode};
use thiserror::Error;

/// Error payload embedded in a reply record.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq, Error)]
#[error("[{code}] {message}")]
pub struct RemoteError {
    pub code: i32,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// A single typed value.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Default)]
pub enum Data {
    #[default]
    None,
    Bool(bool),
    Int(i32),
    Word(u32),
    Value(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Data>),
    Cluster(Vec<Data>),
    Error(RemoteError),
}

impl Data {
    /// Type tag describing this value.
    ///
    /// Lists are tagged by their first element; an empty list is `*_`.
    pub fn tag(&self) -> String {
        match self {
            Data::None => "_".to_string(),
            Data::Bool(_) => "b".to_string(),
            Data::Int(_) => "i".to_string(),
            Data::Word(_) => "w".to_string(),
            Data::Value(_) => "v".to_string(),
            Data::Str(_) => "s".to_string(),
            Data::Bytes(_) => "y".to_string(),
            Data::List(items) => {
                let inner = items.first().map_or_else(|| "_".to_string(), Data::tag);
                format!("*{inner}")
            }
            Data::Cluster(items) => {
                let inner: String = items.iter().map(Data::tag).collect();
                format!("({inner})")
            }
            Data::Error(_) => "E".to_string(),
        }
    }

    pub fn as_word(&self) -> Option<u32> {
        match self {
            Data::Word(w) => Some(*w),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Data::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Raw bytes of a byte string; text is returned as its UTF-8 bytes.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Data::Bytes(b) => Some(b),
            Data::Str(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Data]> {
        match self {
            Data::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_cluster(&self) -> Option<&[Data]> {
        match self {
            Data::Cluster(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_error(&self) -> Option<&RemoteError> {
        match self {
            Data::Error(e) => Some(e),
            _ => None,
        }
    }
}

impl From<bool> for Data {
    fn from(value: bool) -> Self {
        Data::Bool(value)
    }
}

impl From<i32> for Data {
    fn from(value: i32) -> Self {
        Data::Int(value)
    }
}

impl From<u32> for Data {
    fn from(value: u32) -> Self {
        Data::Word(value)
    }
}

impl From<f64> for Data {
    fn from(value: f64) -> Self {
        Data::Value(value)
    }
}

impl From<&str> for Data {
    fn from(value: &str) -> Self {
        Data::Str(value.to_string())
    }
}

impl From<String> for Data {
    fn from(value: String) -> Self {
        Data::Str(value)
    }
}

impl From<Vec<u8>> for Data {
    fn from(value: Vec<u8>) -> Self {
        Data::Bytes(value)
    }
}

impl From<RemoteError> for Data {
    fn from(value: RemoteError) -> Self {
        Data::Error(value)
    }
}
