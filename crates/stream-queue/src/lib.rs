//! stream-queue: typed producers and consumer groups over Redis Streams.
//!
//! Every producer and consumer shares one multiplexed connection per named
//! [`ConnectionManager`]. The manager connects on first use and reconnects
//! when the connection is observed dead; connect attempts are serialized so
//! concurrent callers trigger a single handshake.
//!
//! # Core Guarantees
//!
//! 1. **One Connect**: N concurrent handle requests cause one connect sequence
//! 2. **No Poisoning**: a failed connect is retried on the next request
//! 3. **Group Idempotent**: `subscribe` succeeds when the group already exists
//! 4. **Ack-Gated**: an entry stays pending until `commit` acknowledges it
//!
//! # Flow
//!
//! ```text
//! StreamProducer --XADD--> stream --XREADGROUP--> StreamConsumer<T>
//!                                    ^                  |
//!                                    |_____ XACK <______|
//! ```
//!
//! # Example
//!
//! ```no_run
//! use serde::{Deserialize, Serialize};
//! use std::sync::Arc;
//! use stream_queue::{BrokerConfig, ConnectionRegistry, StreamConsumer, StreamProducer};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Order {
//!     sku: String,
//!     quantity: u32,
//! }
//!
//! # async fn run() -> stream_queue::BrokerResult<()> {
//! let registry = ConnectionRegistry::new();
//! let connection = registry.get_or_create(&BrokerConfig::new("orders"))?;
//!
//! let producer = StreamProducer::new(connection.clone());
//! producer
//!     .send("orders", &Order { sku: "A-1".into(), quantity: 2 })
//!     .await?;
//!
//! let consumer: StreamConsumer<Order> = StreamConsumer::new(Arc::clone(&connection), "billing");
//! if consumer.subscribe("orders").await? {
//!     if let Some(messages) = consumer.consume(Some(10), true).await? {
//!         for message in messages {
//!             consumer.commit(&message.id).await?;
//!         }
//!     }
//! }
//!
//! registry.close_all().await;
//! # Ok(())
//! # }
//! ```

pub mod cancel;
pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod identity;
pub mod memory;
pub mod producer;
pub mod redis_session;
pub mod registry;
pub mod session;

#[cfg(test)]
mod tests;

pub use cancel::{CancelHandle, CancelSignal};
pub use codec::{from_fields, to_fields};
pub use config::{BrokerConfig, ConnectionOptions, Endpoint, RetryPolicy};
pub use connection::{ConnectionManager, ConnectionState};
pub use consumer::StreamConsumer;
pub use envelope::{MessageEnvelope, MessageResult, RejectedEntry};
pub use error::{BrokerError, BrokerResult, CodecError, CodecResult};
pub use identity::{ConsumerNaming, Fixed, HostAndType, Unique};
pub use memory::{MemoryBroker, MemoryConnector};
pub use producer::StreamProducer;
pub use redis_session::RedisConnector;
pub use registry::ConnectionRegistry;
pub use session::{ChannelMessage, Connector, ReadPosition, StreamEntry, StreamSession, Subscriber};
