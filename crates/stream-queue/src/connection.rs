//! Lazily established, shared broker connection.
//!
//! A [`ConnectionManager`] owns at most one live [`StreamSession`] and hands
//! it to every caller. The first request connects; later requests reuse the
//! session as long as it reports connected. When it drops, the next request
//! runs the connect sequence again.
//!
//! Connect attempts are serialized by a single-permit gate. A caller that
//! waited on the gate re-checks for a live session before connecting, so N
//! concurrent callers observing a dead session cause exactly one connect.
//! A failed connect is not remembered: the next request tries again.

use crate::config::{BrokerConfig, ConnectionOptions};
use crate::error::{BrokerError, BrokerResult};
use crate::redis_session::RedisConnector;
use crate::session::{Connector, StreamSession, Subscriber};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Lifecycle of a managed connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closed,
}

/// Shared, self-healing handle onto one broker.
pub struct ConnectionManager {
    name: String,
    options: ConnectionOptions,
    connector: Arc<dyn Connector>,
    gate: Semaphore,
    current: RwLock<Option<Arc<dyn StreamSession>>>,
    state: Mutex<ConnectionState>,
    connects: AtomicU64,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("connects", &self.connect_count())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(
        name: impl Into<String>,
        options: ConnectionOptions,
        connector: Arc<dyn Connector>,
    ) -> Self {
        Self {
            name: name.into(),
            options,
            connector,
            gate: Semaphore::new(1),
            current: RwLock::new(None),
            state: Mutex::new(ConnectionState::Disconnected),
            connects: AtomicU64::new(0),
        }
    }

    /// Manager backed by a real Redis server.
    pub fn redis(name: impl Into<String>, options: ConnectionOptions) -> Self {
        Self::new(name, options, Arc::new(RedisConnector))
    }

    /// Resolve `config` and build a Redis-backed manager named after it.
    pub fn from_config(config: &BrokerConfig) -> BrokerResult<Self> {
        Ok(Self::redis(config.name.clone(), config.resolve()?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// How many connect sequences have run (successful or not).
    pub fn connect_count(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    /// Whether a live session is currently held. Never connects.
    pub fn is_connected(&self) -> bool {
        self.live_session().is_some()
    }

    fn live_session(&self) -> Option<Arc<dyn StreamSession>> {
        self.current
            .read()
            .as_ref()
            .filter(|session| session.is_connected())
            .cloned()
    }

    fn set_state(&self, state: ConnectionState) {
        let mut current = self.state.lock();
        if *current != ConnectionState::Closed {
            *current = state;
        }
    }

    /// The live session, connecting first if there is none.
    pub async fn database(&self) -> BrokerResult<Arc<dyn StreamSession>> {
        if let Some(session) = self.live_session() {
            return Ok(session);
        }
        self.establish().await
    }

    async fn establish(&self) -> BrokerResult<Arc<dyn StreamSession>> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| BrokerError::Closed(self.name.clone()))?;

        // Another caller may have connected while we waited.
        if let Some(session) = self.live_session() {
            return Ok(session);
        }

        if let Some(stale) = self.current.write().take() {
            warn!(
                connection = %self.name,
                session_id = stale.id(),
                endpoint = %stale.endpoint(),
                "Connection lost, reconnecting"
            );
        }

        self.set_state(ConnectionState::Connecting);

        match self.connect_with_retry().await {
            Ok(session) if session.is_connected() => {
                info!(
                    connection = %self.name,
                    session_id = session.id(),
                    endpoint = %session.endpoint(),
                    "Connected to broker"
                );
                *self.current.write() = Some(session.clone());
                self.set_state(ConnectionState::Connected);
                Ok(session)
            }
            Ok(session) => {
                self.set_state(ConnectionState::Disconnected);
                error!(
                    severity = "critical",
                    connection = %self.name,
                    endpoint = %session.endpoint(),
                    "Connect completed but the session is not connected"
                );
                Err(BrokerError::NotConnected(self.name.clone()))
            }
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                error!(
                    severity = "critical",
                    connection = %self.name,
                    error = %e,
                    "Failed to connect to broker"
                );
                Err(e)
            }
        }
    }

    async fn connect_with_retry(&self) -> BrokerResult<Arc<dyn StreamSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        if self.options.endpoints.is_empty() {
            return Err(BrokerError::Config(format!(
                "connection '{}' has no endpoints",
                self.name
            )));
        }

        let attempts = self.options.retry.attempts();
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            for endpoint in &self.options.endpoints {
                let outcome = tokio::time::timeout(
                    self.options.connect_timeout,
                    self.connector.connect(endpoint, &self.options),
                )
                .await;

                match outcome {
                    Ok(Ok(session)) => return Ok(session),
                    Ok(Err(e)) => {
                        debug!(
                            connection = %self.name,
                            endpoint = %endpoint,
                            attempt = attempt,
                            error = %e,
                            "Connect attempt failed"
                        );
                        last_error = e.to_string();
                    }
                    Err(_) => {
                        debug!(
                            connection = %self.name,
                            endpoint = %endpoint,
                            attempt = attempt,
                            timeout_ms = self.options.connect_timeout.as_millis() as u64,
                            "Connect attempt timed out"
                        );
                        last_error = format!("connect to {} timed out", endpoint);
                    }
                }
            }

            if attempt < attempts {
                let delay = self.options.retry.delay_for(attempt);
                warn!(
                    connection = %self.name,
                    attempt = attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Connect failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }

        Err(BrokerError::ConnectionUnavailable {
            name: self.name.clone(),
            attempts,
            reason: last_error,
        })
    }

    /// A pub/sub receiver on this connection.
    pub async fn subscriber(&self) -> BrokerResult<Box<dyn Subscriber>> {
        if !self.options.use_pubsub {
            return Err(BrokerError::PubSubDisabled(self.name.clone()));
        }
        self.database().await?.subscriber().await
    }

    fn config_channel(&self) -> BrokerResult<&str> {
        match (&self.options.config_channel, self.options.use_pubsub) {
            (Some(channel), true) => Ok(channel.as_str()),
            _ => Err(BrokerError::PubSubDisabled(self.name.clone())),
        }
    }

    /// Announce a broker configuration change on the configuration channel.
    /// Returns how many clients received it.
    pub async fn broadcast_reconfigure(&self) -> BrokerResult<u64> {
        let channel = self.config_channel()?;
        let session = self.database().await?;
        let receivers = session.publish(channel, &self.options.client_name).await?;

        info!(
            connection = %self.name,
            channel = %channel,
            receivers = receivers,
            "Broadcast configuration change"
        );
        Ok(receivers)
    }

    /// A subscriber already listening on the configuration channel. Each
    /// message carries the client name of the announcer.
    pub async fn config_changes(&self) -> BrokerResult<Box<dyn Subscriber>> {
        let channel = self.config_channel()?;
        let mut subscriber = self.subscriber().await?;
        subscriber.subscribe(channel).await?;
        Ok(subscriber)
    }

    /// Release the session. Later requests fail with [`BrokerError::Closed`].
    pub async fn close(&self) {
        let permit = self.gate.acquire().await;
        self.gate.close();
        drop(permit);

        *self.state.lock() = ConnectionState::Closed;
        let session = self.current.write().take();

        if let Some(session) = session {
            session.close().await;
            info!(
                connection = %self.name,
                session_id = session.id(),
                "Connection closed"
            );
        }
    }
}
