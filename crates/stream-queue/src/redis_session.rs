//! Redis-backed [`StreamSession`].
//!
//! Commands go through a multiplexed connection that is cloned per call, so
//! one session serves every producer and consumer sharing the manager.

use crate::config::{ConnectionOptions, Endpoint};
use crate::error::{BrokerError, BrokerResult};
use crate::session::{
    next_session_id, ChannelMessage, Connector, FieldList, ReadPosition, StreamEntry,
    StreamSession, Subscriber,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::streams::StreamInfoGroupsReply;
use redis::{AsyncCommands, Client, RedisResult, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Opens [`RedisSession`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnector;

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectionOptions,
    ) -> BrokerResult<Arc<dyn StreamSession>> {
        let client = Client::open(options.connection_url(endpoint)?.as_str())?;
        let mut conn = client.get_multiplexed_async_connection().await?;

        if !options.client_name.is_empty() {
            let result: RedisResult<()> = redis::cmd("CLIENT")
                .arg("SETNAME")
                .arg(&options.client_name)
                .query_async(&mut conn)
                .await;

            if let Err(e) = result {
                debug!(
                    endpoint = %endpoint,
                    client_name = %options.client_name,
                    error = %e,
                    "CLIENT SETNAME rejected"
                );
            }
        }

        Ok(Arc::new(RedisSession {
            id: next_session_id(),
            endpoint: endpoint.to_string(),
            client,
            conn,
            connected: AtomicBool::new(true),
        }))
    }
}

/// One multiplexed Redis connection.
pub struct RedisSession {
    id: u64,
    endpoint: String,
    client: Client,
    conn: MultiplexedConnection,
    connected: AtomicBool,
}

impl RedisSession {
    fn conn(&self) -> BrokerResult<MultiplexedConnection> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(self.conn.clone())
        } else {
            Err(BrokerError::NotConnected(self.endpoint.clone()))
        }
    }

    /// Flag the session dead when `result` shows the transport failed.
    fn observe<T>(&self, result: RedisResult<T>) -> BrokerResult<T> {
        result.map_err(|e| {
            let error = BrokerError::from(e);
            if error.is_connection_loss() && self.connected.swap(false, Ordering::SeqCst) {
                warn!(
                    session_id = self.id,
                    endpoint = %self.endpoint,
                    error = %error,
                    "Redis connection lost"
                );
            }
            error
        })
    }
}

#[async_trait]
impl StreamSession for RedisSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn append(&self, stream: &str, fields: &[(String, String)]) -> BrokerResult<Option<String>> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (name, value) in fields {
            cmd.arg(name).arg(value);
        }

        let id: Option<String> = self.observe(cmd.query_async(&mut conn).await)?;
        Ok(id)
    }

    async fn group_names(&self, stream: &str) -> BrokerResult<Vec<String>> {
        let mut conn = self.conn()?;
        let result: RedisResult<StreamInfoGroupsReply> = conn.xinfo_groups(stream).await;

        match result {
            Ok(reply) => Ok(reply.groups.into_iter().map(|g| g.name).collect()),
            Err(e) if e.to_string().to_ascii_lowercase().contains("no such key") => {
                Err(BrokerError::NoSuchKey(stream.to_string()))
            }
            Err(e) => self.observe(Err(e)),
        }
    }

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> BrokerResult<()> {
        let mut conn = self.conn()?;
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start_id)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Err(BrokerError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            }),
            Err(e) => self.observe(Err(e)),
        }
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        position: ReadPosition,
        count: Option<usize>,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer);
        if let Some(count) = count {
            cmd.arg("COUNT").arg(count);
        }
        cmd.arg("STREAMS").arg(stream).arg(position.as_id());

        let value: Value = self.observe(cmd.query_async(&mut conn).await)?;
        let entries = parse_xreadgroup_response(value)?;

        debug!(
            stream = %stream,
            group = %group,
            consumer = %consumer,
            position = position.as_id(),
            count = entries.len(),
            "Read from stream"
        );

        Ok(entries)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> BrokerResult<u64> {
        let mut conn = self.conn()?;
        let acked: i64 = self.observe(conn.xack(stream, group, &[id]).await)?;
        Ok(acked.max(0) as u64)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> BrokerResult<u64> {
        let mut conn = self.conn()?;
        let value: Value = self.observe(
            redis::cmd("XPENDING")
                .arg(stream)
                .arg(group)
                .query_async(&mut conn)
                .await,
        )?;

        // [count, min_id, max_id, [[consumer, count], ...]]
        match value {
            Value::Array(items) => match items.first() {
                Some(Value::Int(count)) => Ok((*count).max(0) as u64),
                _ => Ok(0),
            },
            other => Err(BrokerError::Protocol(format!(
                "Unexpected XPENDING response type: {:?}",
                other
            ))),
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<u64> {
        let mut conn = self.conn()?;
        let receivers: i64 = self.observe(conn.publish(channel, payload).await)?;
        Ok(receivers.max(0) as u64)
    }

    async fn subscriber(&self) -> BrokerResult<Box<dyn Subscriber>> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected(self.endpoint.clone()));
        }
        let pubsub = self.observe(self.client.get_async_pubsub().await)?;
        Ok(Box::new(RedisSubscriber { pubsub }))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        debug!(session_id = self.id, endpoint = %self.endpoint, "Session closed");
    }
}

/// Dedicated pub/sub connection.
pub struct RedisSubscriber {
    pubsub: PubSub,
}

#[async_trait]
impl Subscriber for RedisSubscriber {
    async fn subscribe(&mut self, channel: &str) -> BrokerResult<()> {
        self.pubsub.subscribe(channel).await?;
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> BrokerResult<()> {
        self.pubsub.unsubscribe(channel).await?;
        Ok(())
    }

    async fn next_message(&mut self) -> BrokerResult<Option<ChannelMessage>> {
        let next = Box::pin(self.pubsub.on_message()).next().await;
        let Some(message) = next else {
            return Ok(None);
        };

        Ok(Some(ChannelMessage {
            channel: message.get_channel_name().to_string(),
            payload: message.get_payload()?,
        }))
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::SimpleString(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse an XREADGROUP reply for a single stream.
///
/// Entries deleted after delivery come back with a nil field list and are
/// returned with empty fields.
fn parse_xreadgroup_response(value: Value) -> BrokerResult<Vec<StreamEntry>> {
    // RESP2: [[stream_key, [[id, [f1, v1, ...]], ...]]]
    // RESP3: {stream_key: [[id, [f1, v1, ...]], ...]}
    let messages = match value {
        Value::Nil => return Ok(Vec::new()),
        Value::Array(streams) => match streams.into_iter().next() {
            None => return Ok(Vec::new()),
            Some(Value::Array(stream)) => stream.into_iter().nth(1).ok_or_else(|| {
                BrokerError::Protocol("Stream entry too short".to_string())
            })?,
            Some(other) => {
                return Err(BrokerError::Protocol(format!(
                    "Expected array for stream entry, got {:?}",
                    other
                )))
            }
        },
        Value::Map(streams) => match streams.into_iter().next() {
            None => return Ok(Vec::new()),
            Some((_, messages)) => messages,
        },
        other => {
            return Err(BrokerError::Protocol(format!(
                "Unexpected XREADGROUP response type: {:?}",
                other
            )))
        }
    };

    let messages = match messages {
        Value::Array(messages) => messages,
        Value::Nil => return Ok(Vec::new()),
        other => {
            return Err(BrokerError::Protocol(format!(
                "Expected array for messages, got {:?}",
                other
            )))
        }
    };

    messages.into_iter().map(parse_entry).collect()
}

fn parse_entry(message: Value) -> BrokerResult<StreamEntry> {
    let mut parts = match message {
        Value::Array(parts) => parts.into_iter(),
        other => {
            return Err(BrokerError::Protocol(format!(
                "Expected array for message, got {:?}",
                other
            )))
        }
    };

    let id = parts
        .next()
        .as_ref()
        .and_then(value_to_string)
        .ok_or_else(|| BrokerError::Protocol("Message entry missing id".to_string()))?;

    let fields = match parts.next() {
        None | Some(Value::Nil) => FieldList::new(),
        Some(Value::Array(flat)) => flat
            .chunks_exact(2)
            .filter_map(|pair| Some((value_to_string(&pair[0])?, value_to_string(&pair[1])?)))
            .collect(),
        Some(Value::Map(pairs)) => pairs
            .iter()
            .filter_map(|(k, v)| Some((value_to_string(k)?, value_to_string(v)?)))
            .collect(),
        Some(other) => {
            return Err(BrokerError::Protocol(format!(
                "Expected array for fields, got {:?}",
                other
            )))
        }
    };

    Ok(StreamEntry::new(id, fields))
}
