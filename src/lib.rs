//! # franz
//!
//! A pure-Rust async client for the Kafka wire protocol: version-aware
//! binary codecs for every supported API, a consumer-group state machine
//! (join/sync/heartbeat/rebalance), and a metadata-aware producer.
//!
//! ## Features
//!
//! - **Wire protocol all the way down**: no librdkafka, no FFI
//! - **Version negotiation**: field presence follows the configured broker
//!   version through one central table
//! - **Consumer groups**: coordinator discovery, leader-side round-robin
//!   assignment, heartbeats, offset commit/fetch, automatic rejoin and
//!   recovery on membership or topology changes
//! - **Async I/O**: tokio connections multiplexed by correlation id
//! - **SASL**: handshake flow with pluggable mechanisms
//!
//! ## Producer
//!
//! ```rust,no_run
//! use franz::{ProducerBuilder, ProduceRecord};
//!
//! #[tokio::main]
//! async fn main() -> franz::Result<()> {
//!     let producer = ProducerBuilder::new()
//!         .brokers(vec!["localhost:9092"])
//!         .required_acks(1)
//!         .build()?;
//!
//!     let acked = producer
//!         .send(ProduceRecord::new("my-topic", "hello").with_key("user-1"))
//!         .await?;
//!     println!("stored at {}:{}", acked[0].partition, acked[0].offset);
//!     Ok(())
//! }
//! ```
//!
//! ## Consumer group
//!
//! ```rust,no_run
//! use franz::ConsumerBuilder;
//!
//! #[tokio::main]
//! async fn main() -> franz::Result<()> {
//!     let mut consumer = ConsumerBuilder::new()
//!         .brokers(vec!["localhost:9092"])
//!         .group_id("my-group")
//!         .topics(vec!["my-topic"])
//!         .build()?;
//!
//!     let mut records = consumer.records().expect("records taken once");
//!     consumer.start();
//!     while let Some(record) = records.recv().await {
//!         println!(
//!             "{}:{}@{} {:?}",
//!             record.topic, record.partition, record.offset, record.value
//!         );
//!     }
//!     consumer.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cluster;
pub mod config;
pub mod consumer;
pub mod error;
pub mod metrics;
pub mod producer;
pub mod protocol;
pub mod sasl;
pub mod state;
pub mod transport;

pub use config::{
    BrokerVersion, ClientConfig, Compression, ConsumerConfig, DeliveryOrder, OffsetReset,
    ProducerConfig,
};
pub use consumer::{ConsumeRecord, Consumer, ConsumerBuilder, TopicPartition};
pub use error::{describe_error, FranzError, KafkaCode};
pub use metrics::{global_metrics, ClientMetrics, MetricsSnapshot};
pub use producer::{ProduceMetadata, ProduceRecord, Producer, ProducerBuilder};
pub use protocol::message::Message;
pub use sasl::{SaslMechanism, SaslSocket};

/// Client library result type
pub type Result<T> = std::result::Result<T, FranzError>;

/// Client library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_set() {
        assert!(!VERSION.is_empty());
    }
}
