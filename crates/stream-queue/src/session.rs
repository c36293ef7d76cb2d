//! The broker command surface.
//!
//! A [`StreamSession`] is one live connection to the broker. It is shared
//! behind an `Arc` and pipelines commands, so callers never lock around it.
//! A [`Connector`] opens sessions; the [`crate::ConnectionManager`] decides
//! when.

use crate::config::{ConnectionOptions, Endpoint};
use crate::error::BrokerResult;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Ordered `(field, value)` pairs of one stream entry.
pub type FieldList = Vec<(String, String)>;

/// Start id for a consumer group positioned at the first entry of the log.
pub const STREAM_BEGINNING: &str = "0";

/// One entry as stored in a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Broker-assigned id, e.g. `"1700000000000-0"`.
    pub id: String,
    pub fields: FieldList,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, fields: FieldList) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// A placeholder the broker returns for entries that no longer exist.
    pub fn is_empty(&self) -> bool {
        self.id.is_empty() || self.fields.is_empty()
    }

    /// First value stored under `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadPosition {
    /// Entries never delivered to any consumer of the group (`>`).
    NewOnly,
    /// This consumer's history from the start of the log (`0`): entries
    /// delivered to it and not yet acknowledged.
    Beginning,
}

impl ReadPosition {
    pub fn from_new_only(new_only: bool) -> Self {
        if new_only {
            ReadPosition::NewOnly
        } else {
            ReadPosition::Beginning
        }
    }

    /// The id argument for XREADGROUP.
    pub fn as_id(&self) -> &'static str {
        match self {
            ReadPosition::NewOnly => ">",
            ReadPosition::Beginning => "0",
        }
    }
}

/// A message received on a pub/sub channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// A live connection to the broker.
#[async_trait]
pub trait StreamSession: Send + Sync {
    /// Process-unique id of this session; a reconnect yields a new id.
    fn id(&self) -> u64;

    /// The endpoint this session is connected to.
    fn endpoint(&self) -> &str;

    /// `false` once the transport has been observed to fail or was closed.
    fn is_connected(&self) -> bool;

    /// XADD with a broker-generated id. Returns the new entry id.
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> BrokerResult<Option<String>>;

    /// Names of the consumer groups on `stream` (XINFO GROUPS).
    ///
    /// Fails with [`crate::BrokerError::NoSuchKey`] when the stream does not exist.
    async fn group_names(&self, stream: &str) -> BrokerResult<Vec<String>>;

    /// XGROUP CREATE ... MKSTREAM.
    ///
    /// Fails with [`crate::BrokerError::GroupExists`] when the group is already there.
    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> BrokerResult<()>;

    /// XREADGROUP for a single stream. Entries that the broker reports as
    /// gone come back with empty fields.
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        position: ReadPosition,
        count: Option<usize>,
    ) -> BrokerResult<Vec<StreamEntry>>;

    /// XACK for one id. Returns how many entries were acknowledged.
    async fn ack(&self, stream: &str, group: &str, id: &str) -> BrokerResult<u64>;

    /// Size of the group's pending entries list (XPENDING summary).
    async fn pending_count(&self, stream: &str, group: &str) -> BrokerResult<u64>;

    /// PUBLISH. Returns the number of receivers.
    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<u64>;

    /// Open a dedicated pub/sub receiver next to this session.
    async fn subscriber(&self) -> BrokerResult<Box<dyn Subscriber>>;

    /// Stop accepting new commands. The transport is released once the
    /// last holder of this session drops it, so in-flight commands finish.
    async fn close(&self);
}

/// A pub/sub receiver.
#[async_trait]
pub trait Subscriber: Send {
    async fn subscribe(&mut self, channel: &str) -> BrokerResult<()>;

    async fn unsubscribe(&mut self, channel: &str) -> BrokerResult<()>;

    /// Next message on any subscribed channel; `None` when the receiver closed.
    async fn next_message(&mut self) -> BrokerResult<Option<ChannelMessage>>;
}

/// Opens sessions to one endpoint.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectionOptions,
    ) -> BrokerResult<Arc<dyn StreamSession>>;
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique session id.
pub fn next_session_id() -> u64 {
    NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_is_empty() {
        assert!(StreamEntry::new("1-0", Vec::new()).is_empty());
        assert!(StreamEntry::new("", vec![("a".into(), "b".into())]).is_empty());
        assert!(!StreamEntry::new("1-0", vec![("a".into(), "b".into())]).is_empty());
    }

    #[test]
    fn test_entry_get() {
        let entry = StreamEntry::new(
            "1-0",
            vec![("sku".into(), "A-1".into()), ("qty".into(), "3".into())],
        );
        assert_eq!(entry.get("qty"), Some("3"));
        assert_eq!(entry.get("missing"), None);
    }

    #[test]
    fn test_read_position_ids() {
        assert_eq!(ReadPosition::from_new_only(true).as_id(), ">");
        assert_eq!(ReadPosition::from_new_only(false).as_id(), "0");
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = next_session_id();
        let b = next_session_id();
        assert_ne!(a, b);
    }
}
