//! Appends typed messages to streams.

use crate::codec::to_fields;
use crate::connection::ConnectionManager;
use crate::error::BrokerResult;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

/// Serializes messages into field lists and appends them with XADD.
#[derive(Debug, Clone)]
pub struct StreamProducer {
    connection: Arc<ConnectionManager>,
}

impl StreamProducer {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    /// Append `message` to `stream`.
    ///
    /// Returns `true` when the broker assigned an entry id. Encoding and
    /// transport failures are logged and returned.
    pub async fn send<T>(&self, stream: &str, message: &T) -> BrokerResult<bool>
    where
        T: Serialize + ?Sized,
    {
        match self.append(stream, message).await {
            Ok(id) => {
                let sent = id.as_deref().is_some_and(|id| !id.is_empty());
                debug!(
                    connection = %self.connection.name(),
                    stream = %stream,
                    id = id.as_deref().unwrap_or(""),
                    "Sent message"
                );
                Ok(sent)
            }
            Err(e) => {
                error!(
                    connection = %self.connection.name(),
                    stream = %stream,
                    error = %e,
                    "Failed to send message"
                );
                Err(e)
            }
        }
    }

    async fn append<T>(&self, stream: &str, message: &T) -> BrokerResult<Option<String>>
    where
        T: Serialize + ?Sized,
    {
        let fields = to_fields(message)?;
        let session = self.connection.database().await?;
        session.append(stream, &fields).await
    }
}
