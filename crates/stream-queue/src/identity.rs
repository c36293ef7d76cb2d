//! Consumer identity strategies.
//!
//! A consumer group hands each entry to exactly one named consumer, and the
//! pending list is tracked per name. Two processes that compute the same
//! name therefore share one pending list. The strategy is injectable so a
//! deployment can pick between one consumer per host and message type
//! (the default) and one consumer per process.

use std::fmt::Debug;

/// Computes the consumer name used inside a group.
pub trait ConsumerNaming: Send + Sync + Debug {
    fn consumer_name(&self, message_type: &str) -> String;
}

/// `"{hostname}-{MessageType}"`. Stable across restarts on the same host.
#[derive(Debug, Clone)]
pub struct HostAndType {
    host: String,
}

impl HostAndType {
    pub fn new() -> Self {
        Self::with_host(local_hostname())
    }

    pub fn with_host(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Default for HostAndType {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerNaming for HostAndType {
    fn consumer_name(&self, message_type: &str) -> String {
        format!("{}-{}", self.host, message_type)
    }
}

/// `"{hostname}-{MessageType}-{uuid}"`. Fresh per consumer instance, so
/// entries left pending by a previous process are not re-read by this one.
#[derive(Debug, Clone)]
pub struct Unique {
    host: String,
}

impl Unique {
    pub fn new() -> Self {
        Self {
            host: local_hostname(),
        }
    }
}

impl Default for Unique {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerNaming for Unique {
    fn consumer_name(&self, message_type: &str) -> String {
        format!("{}-{}-{}", self.host, message_type, uuid::Uuid::new_v4())
    }
}

/// A caller-chosen name, used verbatim.
#[derive(Debug, Clone)]
pub struct Fixed(pub String);

impl ConsumerNaming for Fixed {
    fn consumer_name(&self, _message_type: &str) -> String {
        self.0.clone()
    }
}

/// This machine's hostname, or `"localhost"` if it cannot be read.
pub fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Unqualified name of `T`, e.g. `"Order"` for `my_app::orders::Order`.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Order;

    #[test]
    fn test_host_and_type_is_deterministic() {
        let naming = HostAndType::with_host("worker-7");
        assert_eq!(naming.consumer_name("Order"), "worker-7-Order");
        assert_eq!(naming.consumer_name("Order"), naming.consumer_name("Order"));
        assert_ne!(naming.consumer_name("Order"), naming.consumer_name("Invoice"));
    }

    #[test]
    fn test_unique_differs_per_call() {
        let naming = Unique::new();
        let a = naming.consumer_name("Order");
        let b = naming.consumer_name("Order");
        assert_ne!(a, b);
        assert!(a.contains("-Order-"));
    }

    #[test]
    fn test_fixed_ignores_type() {
        let naming = Fixed("billing-1".to_string());
        assert_eq!(naming.consumer_name("Order"), "billing-1");
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<Order>(), "Order");
        assert_eq!(short_type_name::<Vec<Order>>(), "Vec");
        assert_eq!(short_type_name::<String>(), "String");
    }

    #[test]
    fn test_local_hostname_not_empty() {
        assert!(!local_hostname().is_empty());
    }
}
