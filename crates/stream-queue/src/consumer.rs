//! Typed consumer-group reader.
//!
//! A [`StreamConsumer`] is bound to one group and, after [`subscribe`], to
//! one stream. Reads return decoded [`MessageResult`]s in stream order; each
//! one stays pending in the group until it is committed.
//!
//! Entries that cannot be decoded into the message type are left out of the
//! result and parked until [`take_rejected`] hands them to the caller, who
//! can commit them or move them elsewhere.
//!
//! [`subscribe`]: StreamConsumer::subscribe
//! [`take_rejected`]: StreamConsumer::take_rejected

use crate::cancel::CancelSignal;
use crate::codec::from_fields;
use crate::connection::ConnectionManager;
use crate::envelope::{MessageResult, RejectedEntry};
use crate::error::{BrokerError, BrokerResult, CodecError};
use crate::identity::{short_type_name, ConsumerNaming, HostAndType};
use crate::session::{FieldList, ReadPosition, StreamSession, STREAM_BEGINNING};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

pub struct StreamConsumer<T> {
    connection: Arc<ConnectionManager>,
    group: String,
    consumer_name: String,
    stream: OnceLock<String>,
    rejected: Mutex<Vec<RejectedEntry>>,
    _message: PhantomData<fn() -> T>,
}

impl<T> std::fmt::Debug for StreamConsumer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("connection", &self.connection.name())
            .field("group", &self.group)
            .field("consumer_name", &self.consumer_name)
            .field("stream", &self.stream.get())
            .field("rejected", &self.rejected.lock().len())
            .finish()
    }
}

impl<T: DeserializeOwned> StreamConsumer<T> {
    /// Consumer named `"{hostname}-{MessageType}"`.
    pub fn new(connection: Arc<ConnectionManager>, group: impl Into<String>) -> Self {
        Self::with_naming(connection, group, &HostAndType::new())
    }

    pub fn with_naming(
        connection: Arc<ConnectionManager>,
        group: impl Into<String>,
        naming: &dyn ConsumerNaming,
    ) -> Self {
        Self {
            consumer_name: naming.consumer_name(short_type_name::<T>()),
            connection,
            group: group.into(),
            stream: OnceLock::new(),
            rejected: Mutex::new(Vec::new()),
            _message: PhantomData,
        }
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer_name(&self) -> &str {
        &self.consumer_name
    }

    /// The stream this consumer is bound to, once subscribed.
    pub fn stream(&self) -> Option<&str> {
        self.stream.get().map(String::as_str)
    }

    /// Make sure the group exists on `stream` and bind this consumer to it.
    ///
    /// Creates the stream and the group (positioned at the start of the log)
    /// when missing. Returns `false` when the group could not be verified or
    /// created, or when this consumer is already bound to another stream.
    /// Fails only when no connection can be established.
    pub async fn subscribe(&self, stream: &str) -> BrokerResult<bool> {
        if let Some(bound) = self.stream.get() {
            if bound != stream {
                error!(
                    group = %self.group,
                    consumer = %self.consumer_name,
                    bound = %bound,
                    requested = %stream,
                    "Consumer already subscribed to a different stream"
                );
                return Ok(false);
            }
        }

        let session = self.connection.database().await?;
        if !self.ensure_group(session.as_ref(), stream).await {
            return Ok(false);
        }

        match self.stream.get_or_init(|| stream.to_string()) {
            bound if bound == stream => Ok(true),
            bound => {
                error!(
                    group = %self.group,
                    bound = %bound,
                    requested = %stream,
                    "Consumer already subscribed to a different stream"
                );
                Ok(false)
            }
        }
    }

    async fn ensure_group(&self, session: &dyn StreamSession, stream: &str) -> bool {
        match session.group_names(stream).await {
            Ok(groups) if groups.iter().any(|g| g == &self.group) => {
                debug!(stream = %stream, group = %self.group, "Consumer group already exists");
                return true;
            }
            Ok(_) | Err(BrokerError::NoSuchKey(_)) => {}
            Err(e) => {
                error!(
                    stream = %stream,
                    group = %self.group,
                    error = %e,
                    "Failed to list consumer groups"
                );
                return false;
            }
        }

        match session.create_group(stream, &self.group, STREAM_BEGINNING).await {
            Ok(()) => {
                info!(stream = %stream, group = %self.group, "Created consumer group");
                true
            }
            Err(BrokerError::GroupExists { .. }) => {
                debug!(stream = %stream, group = %self.group, "Consumer group created concurrently");
                true
            }
            Err(e) => {
                error!(
                    stream = %stream,
                    group = %self.group,
                    error = %e,
                    "Failed to create consumer group"
                );
                false
            }
        }
    }

    fn bound_stream(&self) -> BrokerResult<&str> {
        self.stream().ok_or(BrokerError::NotSubscribed)
    }

    /// Read up to `count` entries (all available when `None`).
    ///
    /// With `new_only` the read returns entries never delivered to this
    /// group; otherwise it returns this consumer's delivered but
    /// uncommitted entries. Returns `None` when nothing was read.
    pub async fn consume(
        &self,
        count: Option<usize>,
        new_only: bool,
    ) -> BrokerResult<Option<Vec<MessageResult<T>>>> {
        self.consume_cancellable(count, new_only, &CancelSignal::never())
            .await
    }

    pub async fn consume_cancellable(
        &self,
        count: Option<usize>,
        new_only: bool,
        cancel: &CancelSignal,
    ) -> BrokerResult<Option<Vec<MessageResult<T>>>> {
        let stream = self.bound_stream()?;
        let count = count.filter(|c| *c > 0);
        let position = ReadPosition::from_new_only(new_only);

        let result = cancel
            .run(async {
                let session = self.connection.database().await?;
                session
                    .read_group(stream, &self.group, &self.consumer_name, position, count)
                    .await
            })
            .await;

        let entries = match result {
            Ok(entries) => entries,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(
                    stream = %stream,
                    group = %self.group,
                    consumer = %self.consumer_name,
                    error = %e,
                    "Group read failed"
                );
                return Ok(None);
            }
        };

        let messages: Vec<MessageResult<T>> = entries
            .into_iter()
            .filter(|entry| !entry.is_empty())
            .filter_map(|entry| match from_fields::<T>(&entry.fields) {
                Ok(message) => Some(MessageResult::new(entry.id, message)),
                Err(e) => {
                    warn!(
                        stream = %stream,
                        group = %self.group,
                        id = %entry.id,
                        error = %e,
                        "Skipping entry that does not decode"
                    );
                    self.reject(entry.id, entry.fields, e);
                    None
                }
            })
            .collect();

        if messages.is_empty() {
            Ok(None)
        } else {
            Ok(Some(messages))
        }
    }

    fn reject(&self, id: String, fields: FieldList, error: CodecError) {
        let mut rejected = self.rejected.lock();
        if rejected.iter().all(|r| r.id != id) {
            rejected.push(RejectedEntry { id, fields, error });
        }
    }

    /// Entries read since the last call that did not decode, oldest first.
    ///
    /// They remain pending in the group; commit their ids once handled.
    pub fn take_rejected(&self) -> Vec<RejectedEntry> {
        std::mem::take(&mut *self.rejected.lock())
    }

    /// Read at most one entry.
    pub async fn consume_single(&self, new_only: bool) -> BrokerResult<Option<MessageResult<T>>> {
        self.consume_single_cancellable(new_only, &CancelSignal::never())
            .await
    }

    pub async fn consume_single_cancellable(
        &self,
        new_only: bool,
        cancel: &CancelSignal,
    ) -> BrokerResult<Option<MessageResult<T>>> {
        let Some(messages) = self.consume_cancellable(Some(1), new_only, cancel).await? else {
            return Ok(None);
        };

        if messages.len() > 1 {
            warn!(
                stream = self.stream().unwrap_or_default(),
                group = %self.group,
                returned = messages.len(),
                "Single read returned more than one entry, keeping the first"
            );
        }

        Ok(messages.into_iter().next())
    }

    /// Acknowledge `id`. Returns `true` when the group held it as pending.
    pub async fn commit(&self, id: &str) -> BrokerResult<bool> {
        self.commit_cancellable(id, &CancelSignal::never()).await
    }

    pub async fn commit_cancellable(&self, id: &str, cancel: &CancelSignal) -> BrokerResult<bool> {
        let stream = self.bound_stream()?;

        let result = cancel
            .run(async {
                let session = self.connection.database().await?;
                session.ack(stream, &self.group, id).await
            })
            .await;

        let acked = match result {
            Ok(acked) => acked,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!(stream = %stream, group = %self.group, id = %id, error = %e, "Acknowledge failed");
                return Ok(false);
            }
        };

        if acked == 0 {
            debug!(stream = %stream, group = %self.group, id = %id, "Nothing to acknowledge");
        }

        Ok(acked > 0)
    }

    /// Entries delivered to the group and not yet committed, across all consumers.
    pub async fn pending_count(&self) -> BrokerResult<u64> {
        let stream = self.bound_stream()?;
        let session = self.connection.database().await?;
        session.pending_count(stream, &self.group).await
    }
}
