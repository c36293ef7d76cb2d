//! Decoded messages handed to callers.

use crate::error::CodecError;
use crate::session::FieldList;

/// A stream entry id paired with its decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResult<T> {
    /// Broker-assigned entry id; pass it to `commit` once processed.
    pub id: String,
    pub message: T,
}

/// Alias matching the envelope terminology used in the docs.
pub type MessageEnvelope<T> = MessageResult<T>;

impl<T> MessageResult<T> {
    pub fn new(id: impl Into<String>, message: T) -> Self {
        Self {
            id: id.into(),
            message,
        }
    }

    pub fn into_parts(self) -> (String, T) {
        (self.id, self.message)
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> MessageResult<U> {
        MessageResult {
            id: self.id,
            message: f(self.message),
        }
    }
}

/// An entry that was delivered but could not be decoded.
///
/// It stays pending in the group until its id is committed.
#[derive(Debug)]
pub struct RejectedEntry {
    pub id: String,
    /// The raw fields as stored in the stream.
    pub fields: FieldList,
    pub error: CodecError,
}
