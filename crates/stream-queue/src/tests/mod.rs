//! Scenario tests for stream-queue.
//!
//! - `harness.rs`      - In-memory broker, counting connector, stub session
//! - `connection.rs`   - I. Connection Sharing & Recovery
//! - `subscribe.rs`    - II. Group Subscription
//! - `consume.rs`      - III. Reads
//! - `commit.rs`       - IV. Acknowledgement
//! - `end_to_end.rs`   - V. Producer to Consumer
//! - `cancellation.rs` - VI. Cancellation
//! - `live_redis.rs`   - VII. Against a real server (ignored unless `REDIS_URL` is set)

mod commit;
mod connection;
mod end_to_end;
mod live_redis;
