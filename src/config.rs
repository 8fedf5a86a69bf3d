//! Configuration types for the franz client

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::FranzError;

/// A broker software version, parsed from a dotted string such as `"0.10.1.0"`.
///
/// Comparison is numeric per component, never lexicographic, so
/// `"0.10.0.0" > "0.9.0.1"` holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BrokerVersion {
    parts: [u16; 4],
}

impl BrokerVersion {
    pub const V0_8_0: BrokerVersion = BrokerVersion::new(0, 8, 0, 0);
    pub const V0_8_2: BrokerVersion = BrokerVersion::new(0, 8, 2, 0);
    pub const V0_9_0: BrokerVersion = BrokerVersion::new(0, 9, 0, 0);
    pub const V0_10_0: BrokerVersion = BrokerVersion::new(0, 10, 0, 0);
    pub const V0_10_1: BrokerVersion = BrokerVersion::new(0, 10, 1, 0);

    pub const fn new(a: u16, b: u16, c: u16, d: u16) -> Self {
        Self { parts: [a, b, c, d] }
    }

    /// Whether this version is at least `other`.
    pub fn at_least(self, other: BrokerVersion) -> bool {
        self >= other
    }
}

impl Default for BrokerVersion {
    fn default() -> Self {
        Self::V0_10_1
    }
}

impl FromStr for BrokerVersion {
    type Err = FranzError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = [0u16; 4];
        let mut count = 0;
        for piece in s.split('.') {
            if count == 4 {
                return Err(FranzError::invalid_config(format!(
                    "broker version '{s}' has more than four components"
                )));
            }
            parts[count] = piece.parse().map_err(|_| {
                FranzError::invalid_config(format!("broker version '{s}' is not numeric"))
            })?;
            count += 1;
        }
        if count == 0 {
            return Err(FranzError::invalid_config("broker version is empty"));
        }
        Ok(Self { parts })
    }
}

impl fmt::Display for BrokerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.parts;
        write!(f, "{a}.{b}.{c}.{d}")
    }
}

/// Offset reset policy applied when the consumer's position falls outside
/// the broker-retained range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    /// Jump to the latest known high-water mark
    #[default]
    Latest,
    /// Jump back to the earliest retained offset
    Earliest,
}

/// Ordering of commit vs. application delivery for fetched records.
///
/// `CommitThenDeliver` commits the offsets first and only hands records to
/// the application once the commit is acknowledged (at-most-once: a crash
/// between commit and delivery drops the batch). `DeliverThenCommit` hands
/// records out first (at-least-once: a crash before the commit re-delivers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryOrder {
    #[default]
    CommitThenDeliver,
    DeliverThenCommit,
}

/// Base client configuration shared by producer and consumer
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// List of bootstrap broker addresses (`host:port`)
    pub brokers: Vec<String>,
    /// Client identifier sent in every request header
    pub client_id: String,
    /// Broker software version the codecs are negotiated against
    pub broker_version: BrokerVersion,
    /// Connection timeout
    pub connect_timeout: Duration,
    /// Per-request timeout (send to response)
    pub request_timeout: Duration,
    /// Metadata refresh interval
    pub metadata_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            brokers: vec!["localhost:9092".to_string()],
            client_id: "franz".to_string(),
            broker_version: BrokerVersion::default(),
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            metadata_interval: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub(crate) fn validate(&self) -> Result<(), FranzError> {
        if self.brokers.is_empty() {
            return Err(FranzError::invalid_config("no brokers configured"));
        }
        if self.client_id.is_empty() {
            return Err(FranzError::invalid_config("client_id must not be empty"));
        }
        Ok(())
    }
}

/// Consumer-specific configuration
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub client: ClientConfig,
    /// Consumer group id
    pub group_id: String,
    /// Topics to subscribe to
    pub topics: Vec<String>,
    /// Group session timeout
    pub session_timeout: Duration,
    /// Rebalance timeout, only on the wire for brokers that support it
    pub rebalance_timeout: Duration,
    /// Heartbeat interval
    pub heartbeat_interval: Duration,
    /// High-water offset refresh interval
    pub offset_interval: Duration,
    /// Fetch poll interval
    pub fetch_interval: Duration,
    /// Maximum bytes to fetch per partition
    pub max_fetch_bytes: i32,
    /// Minimum bytes the broker should accumulate before answering a fetch
    pub min_fetch_bytes: i32,
    /// Maximum time the broker may hold a fetch before answering
    pub max_fetch_wait: Duration,
    /// Offset reset policy for out-of-range positions
    pub offset_reset: OffsetReset,
    /// Commit-vs-deliver ordering
    pub delivery_order: DeliveryOrder,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            group_id: String::new(),
            topics: Vec::new(),
            session_timeout: Duration::from_secs(30),
            rebalance_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(3),
            offset_interval: Duration::from_secs(2),
            fetch_interval: Duration::from_millis(100),
            max_fetch_bytes: 64 * 1024,
            min_fetch_bytes: 1,
            max_fetch_wait: Duration::from_millis(100),
            offset_reset: OffsetReset::default(),
            delivery_order: DeliveryOrder::default(),
        }
    }
}

impl ConsumerConfig {
    pub(crate) fn validate(&self) -> Result<(), FranzError> {
        self.client.validate()?;
        if self.group_id.is_empty() {
            return Err(FranzError::invalid_config("group_id must not be empty"));
        }
        if self.topics.is_empty() {
            return Err(FranzError::invalid_config(
                "at least one topic must be specified",
            ));
        }
        if self.heartbeat_interval >= self.session_timeout {
            return Err(FranzError::invalid_config(
                "heartbeat_interval must be shorter than session_timeout",
            ));
        }
        Ok(())
    }
}

/// Producer-specific configuration
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    pub client: ClientConfig,
    /// Required acks: 0 = none, 1 = leader, -1 = all in-sync replicas
    pub required_acks: i16,
    /// Broker-side ack timeout
    pub ack_timeout: Duration,
    /// Poll interval of the asynchronous produce loop
    pub produce_interval: Duration,
    /// Message compression
    pub compression: Compression,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            required_acks: 1,
            ack_timeout: Duration::from_secs(5),
            produce_interval: Duration::from_millis(100),
            compression: Compression::None,
        }
    }
}

impl ProducerConfig {
    pub(crate) fn validate(&self) -> Result<(), FranzError> {
        self.client.validate()?;
        if !matches!(self.required_acks, -1 | 0 | 1) {
            return Err(FranzError::invalid_config(
                "required_acks must be -1, 0 or 1",
            ));
        }
        Ok(())
    }
}

/// Message-set compression codec, carried in the message attribute bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum Compression {
    #[default]
    None = 0,
    Gzip = 1,
    /// Recognized on the wire but not implemented; encode and decode fail.
    Snappy = 2,
}

impl Compression {
    pub fn from_attributes(attributes: u8) -> Option<Compression> {
        match attributes & 0x07 {
            0 => Some(Compression::None),
            1 => Some(Compression::Gzip),
            2 => Some(Compression::Snappy),
            _ => None,
        }
    }
}
