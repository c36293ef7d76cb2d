//! In-process broker with stream consumer-group semantics.
//!
//! Mirrors what the server does for the commands this crate issues:
//!
//! - XADD assigns `"{millis}-{seq}"` ids that always increase
//! - a group keeps a last-delivered cursor and a pending entries list (PEL)
//!   recording which consumer holds each unacknowledged entry
//! - reading `>` delivers entries past the cursor and records them as pending
//! - reading `0` re-reads the calling consumer's own pending entries
//! - XACK removes ids from the PEL and reports how many it removed
//!
//! [`MemoryConnector`] hands out sessions onto one shared [`MemoryBroker`] and
//! can refuse connects or drop every live session, which is how the
//! reconnect paths are exercised without a server.

use crate::config::{ConnectionOptions, Endpoint};
use crate::error::{BrokerError, BrokerResult};
use crate::session::{
    next_session_id, ChannelMessage, Connector, ReadPosition, StreamEntry, StreamSession,
    Subscriber,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::debug;

type EntryId = (u64, u64);

fn parse_id(id: &str) -> Option<EntryId> {
    let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
    Some((ms.parse().ok()?, seq.parse().ok()?))
}

fn format_id((ms, seq): EntryId) -> String {
    format!("{}-{}", ms, seq)
}

#[derive(Default)]
struct MemoryGroup {
    last_delivered: EntryId,
    /// entry id -> consumer holding it
    pending: BTreeMap<EntryId, String>,
}

#[derive(Default)]
struct MemoryStream {
    entries: BTreeMap<EntryId, Vec<(String, String)>>,
    last_id: EntryId,
    groups: BTreeMap<String, MemoryGroup>,
}

impl MemoryStream {
    fn next_id(&mut self) -> EntryId {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        let id = if now > self.last_id.0 {
            (now, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        self.last_id = id;
        id
    }
}

/// Shared broker state.
pub struct MemoryBroker {
    streams: Mutex<HashMap<String, MemoryStream>>,
    channels: broadcast::Sender<ChannelMessage>,
    subscriptions: Mutex<HashMap<String, u64>>,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        let (channels, _) = broadcast::channel(1024);
        Arc::new(Self {
            streams: Mutex::new(HashMap::new()),
            channels,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    /// Number of entries in `stream` (0 if it does not exist).
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    /// Pending ids of `group`, oldest first.
    pub fn pending_ids(&self, stream: &str, group: &str) -> Vec<String> {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.keys().copied().map(format_id).collect())
            .unwrap_or_default()
    }

    /// Names of the groups on `stream`.
    pub fn groups(&self, stream: &str) -> Vec<String> {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.groups.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn append(&self, stream: &str, fields: &[(String, String)]) -> String {
        let mut streams = self.streams.lock();
        let stream = streams.entry(stream.to_string()).or_default();
        let id = stream.next_id();
        stream.entries.insert(id, fields.to_vec());
        format_id(id)
    }

    fn group_names(&self, stream: &str) -> BrokerResult<Vec<String>> {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.groups.keys().cloned().collect())
            .ok_or_else(|| BrokerError::NoSuchKey(stream.to_string()))
    }

    fn create_group(&self, stream: &str, group: &str, start_id: &str) -> BrokerResult<()> {
        let mut streams = self.streams.lock();
        let entry = streams.entry(stream.to_string()).or_default();

        if entry.groups.contains_key(group) {
            return Err(BrokerError::GroupExists {
                stream: stream.to_string(),
                group: group.to_string(),
            });
        }

        let last_delivered = match start_id {
            "$" => entry.last_id,
            other => parse_id(other)
                .ok_or_else(|| BrokerError::Protocol(format!("invalid start id '{}'", other)))?,
        };

        entry.groups.insert(
            group.to_string(),
            MemoryGroup {
                last_delivered,
                pending: BTreeMap::new(),
            },
        );
        Ok(())
    }

    fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        position: ReadPosition,
        count: Option<usize>,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut streams = self.streams.lock();
        let nogroup = || {
            BrokerError::Protocol(format!(
                "NOGROUP No such key '{}' or consumer group '{}'",
                stream, group
            ))
        };
        let memory_stream = streams.get_mut(stream).ok_or_else(nogroup)?;
        let MemoryStream {
            entries, groups, ..
        } = memory_stream;
        let memory_group = groups.get_mut(group).ok_or_else(nogroup)?;
        let limit = count.filter(|c| *c > 0).unwrap_or(usize::MAX);

        let delivered = match position {
            ReadPosition::NewOnly => {
                let after = memory_group.last_delivered;
                let fresh: Vec<StreamEntry> = entries
                    .range((std::ops::Bound::Excluded(after), std::ops::Bound::Unbounded))
                    .take(limit)
                    .map(|(id, fields)| StreamEntry::new(format_id(*id), fields.clone()))
                    .collect();

                for entry in &fresh {
                    if let Some(id) = parse_id(&entry.id) {
                        memory_group.last_delivered = id;
                        memory_group.pending.insert(id, consumer.to_string());
                    }
                }
                fresh
            }
            ReadPosition::Beginning => memory_group
                .pending
                .iter()
                .filter(|(_, owner)| owner.as_str() == consumer)
                .take(limit)
                .map(|(id, _)| {
                    StreamEntry::new(
                        format_id(*id),
                        entries.get(id).cloned().unwrap_or_default(),
                    )
                })
                .collect(),
        };

        Ok(delivered)
    }

    fn ack(&self, stream: &str, group: &str, id: &str) -> u64 {
        let Some(id) = parse_id(id) else {
            return 0;
        };

        self.streams
            .lock()
            .get_mut(stream)
            .and_then(|s| s.groups.get_mut(group))
            .and_then(|g| g.pending.remove(&id))
            .map(|_| 1)
            .unwrap_or(0)
    }

    fn pending_count(&self, stream: &str, group: &str) -> BrokerResult<u64> {
        self.streams
            .lock()
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len() as u64)
            .ok_or_else(|| {
                BrokerError::Protocol(format!(
                    "NOGROUP No such key '{}' or consumer group '{}'",
                    stream, group
                ))
            })
    }

    fn publish(&self, channel: &str, payload: &str) -> u64 {
        let receivers = self
            .subscriptions
            .lock()
            .get(channel)
            .copied()
            .unwrap_or(0);

        if receivers > 0 {
            let _ = self.channels.send(ChannelMessage {
                channel: channel.to_string(),
                payload: payload.to_string(),
            });
        }
        receivers
    }

    fn track_subscription(&self, channel: &str, delta: i64) {
        let mut subscriptions = self.subscriptions.lock();
        let count = subscriptions.entry(channel.to_string()).or_insert(0);
        *count = count.saturating_add_signed(delta);
        if *count == 0 {
            subscriptions.remove(channel);
        }
    }
}

/// A session onto a [`MemoryBroker`].
pub struct MemorySession {
    id: u64,
    endpoint: String,
    broker: Arc<MemoryBroker>,
    connected: AtomicBool,
}

impl MemorySession {
    fn ensure_connected(&self) -> BrokerResult<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::NotConnected(self.endpoint.clone()))
        }
    }

    /// Simulate the transport going away.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamSession for MemorySession {
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
        self.ensure_connected()?;
        Ok(Some(self.broker.append(stream, fields)))
    }

    async fn group_names(&self, stream: &str) -> BrokerResult<Vec<String>> {
        self.ensure_connected()?;
        self.broker.group_names(stream)
    }

    async fn create_group(&self, stream: &str, group: &str, start_id: &str) -> BrokerResult<()> {
        self.ensure_connected()?;
        self.broker.create_group(stream, group, start_id)
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        position: ReadPosition,
        count: Option<usize>,
    ) -> BrokerResult<Vec<StreamEntry>> {
        self.ensure_connected()?;
        self.broker
            .read_group(stream, group, consumer, position, count)
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> BrokerResult<u64> {
        self.ensure_connected()?;
        Ok(self.broker.ack(stream, group, id))
    }

    async fn pending_count(&self, stream: &str, group: &str) -> BrokerResult<u64> {
        self.ensure_connected()?;
        self.broker.pending_count(stream, group)
    }

    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<u64> {
        self.ensure_connected()?;
        Ok(self.broker.publish(channel, payload))
    }

    async fn subscriber(&self) -> BrokerResult<Box<dyn Subscriber>> {
        self.ensure_connected()?;
        Ok(Box::new(MemorySubscriber {
            broker: self.broker.clone(),
            rx: self.broker.channels.subscribe(),
            channels: HashSet::new(),
        }))
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// Pub/sub receiver on a [`MemoryBroker`].
pub struct MemorySubscriber {
    broker: Arc<MemoryBroker>,
    rx: broadcast::Receiver<ChannelMessage>,
    channels: HashSet<String>,
}

#[async_trait]
impl Subscriber for MemorySubscriber {
    async fn subscribe(&mut self, channel: &str) -> BrokerResult<()> {
        if self.channels.insert(channel.to_string()) {
            self.broker.track_subscription(channel, 1);
        }
        Ok(())
    }

    async fn unsubscribe(&mut self, channel: &str) -> BrokerResult<()> {
        if self.channels.remove(channel) {
            self.broker.track_subscription(channel, -1);
        }
        Ok(())
    }

    async fn next_message(&mut self) -> BrokerResult<Option<ChannelMessage>> {
        loop {
            match self.rx.recv().await {
                Ok(message) if self.channels.contains(&message.channel) => return Ok(Some(message)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped = skipped, "Subscriber lagged, skipping messages");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(None),
            }
        }
    }
}

impl Drop for MemorySubscriber {
    fn drop(&mut self) {
        for channel in &self.channels {
            self.broker.track_subscription(channel, -1);
        }
    }
}

/// Opens [`MemorySession`]s and counts how often it was asked to.
pub struct MemoryConnector {
    broker: Arc<MemoryBroker>,
    connects: AtomicU64,
    fail_next: AtomicU32,
    connect_delay: Option<Duration>,
    sessions: Mutex<Vec<Weak<MemorySession>>>,
}

impl MemoryConnector {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            connects: AtomicU64::new(0),
            fail_next: AtomicU32::new(0),
            connect_delay: None,
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Sleep this long inside every connect, widening race windows in tests.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = Some(delay);
        self
    }

    pub fn broker(&self) -> &Arc<MemoryBroker> {
        &self.broker
    }

    /// Number of connect calls made so far, failed ones included.
    pub fn connect_calls(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Refuse the next `n` connect calls.
    pub fn fail_next_connects(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Mark every live session as disconnected.
    pub fn drop_connections(&self) {
        let mut sessions = self.sessions.lock();
        sessions.retain(|weak| match weak.upgrade() {
            Some(session) => {
                session.disconnect();
                true
            }
            None => false,
        });
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        options: &ConnectionOptions,
    ) -> BrokerResult<Arc<dyn StreamSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.connect_delay {
            tokio::time::sleep(delay).await;
        }

        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(BrokerError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("connection to {} refused", endpoint),
            )));
        }

        let session = Arc::new(MemorySession {
            id: next_session_id(),
            endpoint: endpoint.to_string(),
            broker: self.broker.clone(),
            connected: AtomicBool::new(true),
        });
        self.sessions.lock().push(Arc::downgrade(&session));

        debug!(
            endpoint = %endpoint,
            client_name = %options.client_name,
            session_id = session.id,
            "Opened in-memory session"
        );

        Ok(session)
    }
}
