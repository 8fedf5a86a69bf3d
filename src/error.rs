//! Error types for the franz client library

use std::borrow::Cow;

use crate::protocol::ProtocolError;

/// Main error type for client operations
#[derive(Debug, thiserror::Error)]
pub enum FranzError {
    /// Connection-related errors
    #[error("connection error: {message}")]
    Connection { message: String },

    /// Wire-format errors from the protocol layer
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Producer-specific errors
    #[error("producer error: {message}")]
    Producer { message: String },

    /// Consumer-specific errors
    #[error("consumer error: {message}")]
    Consumer { message: String },

    /// Consumer group membership errors
    #[error("consumer group error: {message}")]
    ConsumerGroup { message: String },

    /// Invalid configuration
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// No broker in the configured set could be reached
    #[error("no available brokers")]
    NoBrokersAvailable,

    /// Topic does not exist in the current metadata
    #[error("topic '{topic}' does not exist")]
    TopicNotFound { topic: String },

    /// A broker returned a non-zero error code on a path where it is fatal
    #[error("broker error {code}: {message}")]
    Broker { code: i16, message: String },

    /// The broker rejected the SASL mechanism during handshake
    #[error("SASL mechanism '{mechanism}' not supported by broker (supported: {supported})")]
    SaslMechanismRejected { mechanism: String, supported: String },
}

impl FranzError {
    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a new producer error
    pub fn producer<S: Into<String>>(message: S) -> Self {
        Self::Producer {
            message: message.into(),
        }
    }

    /// Create a new consumer error
    pub fn consumer<S: Into<String>>(message: S) -> Self {
        Self::Consumer {
            message: message.into(),
        }
    }

    /// Create a new consumer group error
    pub fn group<S: Into<String>>(message: S) -> Self {
        Self::ConsumerGroup {
            message: message.into(),
        }
    }

    /// Create a new invalid config error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(timeout_ms: u64) -> Self {
        Self::Timeout { timeout_ms }
    }

    /// Create a broker error carrying the code's description
    pub fn broker(code: i16) -> Self {
        Self::Broker {
            code,
            message: describe_error(code).into_owned(),
        }
    }

    /// Check if this error is retryable on a later tick
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Timeout { .. } | Self::NoBrokersAvailable | Self::Io(_)
        )
    }

    /// Check if this error is a connection error
    pub fn is_connection_error(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Io(_))
    }
}

/// Kafka protocol error codes, as returned in response bodies.
///
/// `0` means no error and `-1` is the catch-all unknown server error;
/// every other value identifies a specific broker-side condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum KafkaCode {
    /// Unexpected server error
    Unknown = -1,
    /// No error
    None = 0,
    /// Requested offset is outside the range kept by the server
    OffsetOutOfRange = 1,
    /// Message failed its CRC checksum or is otherwise corrupt
    CorruptMessage = 2,
    /// Topic or partition does not exist on this broker
    UnknownTopicOrPartition = 3,
    /// Negative fetch size requested
    InvalidFetchSize = 4,
    /// Leader election in progress, no leader for this partition
    LeaderNotAvailable = 5,
    /// This broker is not the leader for that topic-partition
    NotLeaderForPartition = 6,
    /// Request exceeded the user-specified time limit
    RequestTimedOut = 7,
    /// Broker is not available
    BrokerNotAvailable = 8,
    /// Replica expected on this broker is not available
    ReplicaNotAvailable = 9,
    /// Message size exceeds the server's maximum
    MessageTooLarge = 10,
    /// Internal error from a stale controller epoch
    StaleControllerEpoch = 11,
    /// Metadata string in an offset commit was too large
    OffsetMetadataTooLarge = 12,
    /// Server disconnected before a response was received
    NetworkException = 13,
    /// Coordinator is loading group state and cannot answer yet
    GroupLoadInProgress = 14,
    /// Group coordinator is not available
    GroupCoordinatorNotAvailable = 15,
    /// This broker is not the coordinator for that group
    NotCoordinatorForGroup = 16,
    /// Request touched an illegal or reserved topic
    InvalidTopic = 17,
    /// Message batch exceeds the maximum segment size
    RecordListTooLarge = 18,
    /// Not enough in-sync replicas to satisfy required acks
    NotEnoughReplicas = 19,
    /// Written to fewer in-sync replicas than required
    NotEnoughReplicasAfterAppend = 20,
    /// Produce request used an invalid required-acks value
    InvalidRequiredAcks = 21,
    /// Generation id in the request is stale
    IllegalGeneration = 22,
    /// Member protocols are incompatible with the rest of the group
    InconsistentGroupProtocol = 23,
    /// The configured group id is invalid
    InvalidGroupId = 24,
    /// Coordinator is not aware of this member id
    UnknownMemberId = 25,
    /// Session timeout outside the broker's allowed range
    InvalidSessionTimeout = 26,
    /// Group is rebalancing, rejoin required
    RebalanceInProgress = 27,
    /// Commit offset data size is invalid
    InvalidCommitOffsetSize = 28,
    /// Not authorized to access that topic
    TopicAuthorizationFailed = 29,
    /// Not authorized to access that group
    GroupAuthorizationFailed = 30,
    /// Cluster authorization failed
    ClusterAuthorizationFailed = 31,
    /// Timestamp of a message is out of acceptable range
    InvalidTimestamp = 32,
    /// Broker does not support the requested SASL mechanism
    UnsupportedSaslMechanism = 33,
    /// Request is not valid in the current SASL state
    IllegalSaslState = 34,
    /// API version not supported by this broker
    UnsupportedVersion = 35,
    /// Topic already exists
    TopicAlreadyExists = 36,
    /// Invalid number of partitions
    InvalidPartitions = 37,
    /// Invalid replication factor
    InvalidReplicationFactor = 38,
    /// Invalid replica assignment
    InvalidReplicaAssignment = 39,
    /// Invalid configuration
    InvalidConfig = 40,
    /// This broker is not the controller
    NotController = 41,
    /// Malformed request
    InvalidRequest = 42,
    /// Message format on disk is too old for this request
    UnsupportedForMessageFormat = 43,
    /// Request violates a configured policy
    PolicyViolation = 44,
    /// Sequence number out of order for this producer
    OutOfOrderSequenceNumber = 45,
    /// Duplicate sequence number for this producer
    DuplicateSequenceNumber = 46,
    /// Producer was fenced by a newer epoch
    InvalidProducerEpoch = 47,
    /// Operation not valid in the current transactional state
    InvalidTxnState = 48,
    /// Producer id was not mapped to a transactional id
    InvalidProducerIdMapping = 49,
    /// Transaction timeout larger than the broker allows
    InvalidTransactionTimeout = 50,
    /// A concurrent transaction is still completing
    ConcurrentTransactions = 51,
    /// Transaction coordinator was fenced by a newer producer
    TransactionCoordinatorFenced = 52,
    /// Transactional id authorization failed
    TransactionalIdAuthorizationFailed = 53,
    /// Security features are disabled on this broker
    SecurityDisabled = 54,
    /// Broker did not attempt the operation
    OperationNotAttempted = 55,
    /// Disk error while handling the request
    KafkaStorageError = 56,
    /// Log directory for the requested partition was not found
    LogDirNotFound = 57,
    /// SASL authentication failed
    SaslAuthenticationFailed = 58,
    /// Producer id unknown to the broker
    UnknownProducerId = 59,
    /// A partition reassignment is in progress
    ReassignmentInProgress = 60,
}

impl KafkaCode {
    /// All defined codes, in wire order.
    const ALL: [KafkaCode; 62] = [
        KafkaCode::Unknown,
        KafkaCode::None,
        KafkaCode::OffsetOutOfRange,
        KafkaCode::CorruptMessage,
        KafkaCode::UnknownTopicOrPartition,
        KafkaCode::InvalidFetchSize,
        KafkaCode::LeaderNotAvailable,
        KafkaCode::NotLeaderForPartition,
        KafkaCode::RequestTimedOut,
        KafkaCode::BrokerNotAvailable,
        KafkaCode::ReplicaNotAvailable,
        KafkaCode::MessageTooLarge,
        KafkaCode::StaleControllerEpoch,
        KafkaCode::OffsetMetadataTooLarge,
        KafkaCode::NetworkException,
        KafkaCode::GroupLoadInProgress,
        KafkaCode::GroupCoordinatorNotAvailable,
        KafkaCode::NotCoordinatorForGroup,
        KafkaCode::InvalidTopic,
        KafkaCode::RecordListTooLarge,
        KafkaCode::NotEnoughReplicas,
        KafkaCode::NotEnoughReplicasAfterAppend,
        KafkaCode::InvalidRequiredAcks,
        KafkaCode::IllegalGeneration,
        KafkaCode::InconsistentGroupProtocol,
        KafkaCode::InvalidGroupId,
        KafkaCode::UnknownMemberId,
        KafkaCode::InvalidSessionTimeout,
        KafkaCode::RebalanceInProgress,
        KafkaCode::InvalidCommitOffsetSize,
        KafkaCode::TopicAuthorizationFailed,
        KafkaCode::GroupAuthorizationFailed,
        KafkaCode::ClusterAuthorizationFailed,
        KafkaCode::InvalidTimestamp,
        KafkaCode::UnsupportedSaslMechanism,
        KafkaCode::IllegalSaslState,
        KafkaCode::UnsupportedVersion,
        KafkaCode::TopicAlreadyExists,
        KafkaCode::InvalidPartitions,
        KafkaCode::InvalidReplicationFactor,
        KafkaCode::InvalidReplicaAssignment,
        KafkaCode::InvalidConfig,
        KafkaCode::NotController,
        KafkaCode::InvalidRequest,
        KafkaCode::UnsupportedForMessageFormat,
        KafkaCode::PolicyViolation,
        KafkaCode::OutOfOrderSequenceNumber,
        KafkaCode::DuplicateSequenceNumber,
        KafkaCode::InvalidProducerEpoch,
        KafkaCode::InvalidTxnState,
        KafkaCode::InvalidProducerIdMapping,
        KafkaCode::InvalidTransactionTimeout,
        KafkaCode::ConcurrentTransactions,
        KafkaCode::TransactionCoordinatorFenced,
        KafkaCode::TransactionalIdAuthorizationFailed,
        KafkaCode::SecurityDisabled,
        KafkaCode::OperationNotAttempted,
        KafkaCode::KafkaStorageError,
        KafkaCode::LogDirNotFound,
        KafkaCode::SaslAuthenticationFailed,
        KafkaCode::UnknownProducerId,
        KafkaCode::ReassignmentInProgress,
    ];

    /// Look up a wire code, returning `None` for values outside the table.
    pub fn from_wire(code: i16) -> Option<KafkaCode> {
        Self::ALL.iter().copied().find(|c| *c as i16 == code)
    }

    /// Whether this code signals an actual error.
    pub fn is_error(self) -> bool {
        self != KafkaCode::None
    }

    /// Human-readable description of this code.
    pub fn describe(self) -> &'static str {
        match self {
            KafkaCode::Unknown => "the server experienced an unexpected error",
            KafkaCode::None => "no error",
            KafkaCode::OffsetOutOfRange => {
                "the requested offset is outside the range of offsets maintained by the server"
            }
            KafkaCode::CorruptMessage => "the message failed its CRC checksum or is corrupt",
            KafkaCode::UnknownTopicOrPartition => {
                "this server does not host that topic-partition"
            }
            KafkaCode::InvalidFetchSize => "the requested fetch size is invalid",
            KafkaCode::LeaderNotAvailable => {
                "there is no leader for that partition while leadership election is in progress"
            }
            KafkaCode::NotLeaderForPartition => {
                "this server is not the leader for that topic-partition"
            }
            KafkaCode::RequestTimedOut => "the request timed out on the server",
            KafkaCode::BrokerNotAvailable => "the broker is not available",
            KafkaCode::ReplicaNotAvailable => "the replica is not available on this broker",
            KafkaCode::MessageTooLarge => {
                "the request included a message larger than the maximum the server will accept"
            }
            KafkaCode::StaleControllerEpoch => "the controller moved to another broker",
            KafkaCode::OffsetMetadataTooLarge => {
                "the metadata field of the offset request was too large"
            }
            KafkaCode::NetworkException => {
                "the server disconnected before a response was received"
            }
            KafkaCode::GroupLoadInProgress => {
                "the coordinator is loading and cannot answer group requests yet"
            }
            KafkaCode::GroupCoordinatorNotAvailable => "the group coordinator is not available",
            KafkaCode::NotCoordinatorForGroup => "this is not the correct coordinator for that group",
            KafkaCode::InvalidTopic => {
                "the request attempted to access an invalid or reserved topic"
            }
            KafkaCode::RecordListTooLarge => {
                "the message batch exceeds the maximum configured segment size"
            }
            KafkaCode::NotEnoughReplicas => {
                "there are fewer in-sync replicas than required to honor the produce request"
            }
            KafkaCode::NotEnoughReplicasAfterAppend => {
                "the message was written to the log but to fewer in-sync replicas than required"
            }
            KafkaCode::InvalidRequiredAcks => "the produce request specified an invalid acks value",
            KafkaCode::IllegalGeneration => "the generation id in the request is not current",
            KafkaCode::InconsistentGroupProtocol => {
                "the member's protocols are incompatible with those of the existing group"
            }
            KafkaCode::InvalidGroupId => "the configured group id is invalid",
            KafkaCode::UnknownMemberId => "the coordinator is not aware of this member id",
            KafkaCode::InvalidSessionTimeout => {
                "the session timeout is outside the range the broker allows"
            }
            KafkaCode::RebalanceInProgress => {
                "the group is rebalancing, this member must rejoin"
            }
            KafkaCode::InvalidCommitOffsetSize => "the commit offset data size is invalid",
            KafkaCode::TopicAuthorizationFailed => "not authorized to access that topic",
            KafkaCode::GroupAuthorizationFailed => "not authorized to access that group",
            KafkaCode::ClusterAuthorizationFailed => "cluster authorization failed",
            KafkaCode::InvalidTimestamp => {
                "the timestamp of the message is out of acceptable range"
            }
            KafkaCode::UnsupportedSaslMechanism => {
                "the broker does not support the requested SASL mechanism"
            }
            KafkaCode::IllegalSaslState => "the request is not valid given the current SASL state",
            KafkaCode::UnsupportedVersion => "the version of the API is not supported",
            KafkaCode::TopicAlreadyExists => "the topic already exists",
            KafkaCode::InvalidPartitions => "the number of partitions is invalid",
            KafkaCode::InvalidReplicationFactor => "the replication factor is invalid",
            KafkaCode::InvalidReplicaAssignment => "the replica assignment is invalid",
            KafkaCode::InvalidConfig => "the configuration is invalid",
            KafkaCode::NotController => "this is not the correct controller for this cluster",
            KafkaCode::InvalidRequest => {
                "the request is malformed or avoided by a newer client format"
            }
            KafkaCode::UnsupportedForMessageFormat => {
                "the message format version on the broker does not support the request"
            }
            KafkaCode::PolicyViolation => "the request violated a configured policy",
            KafkaCode::OutOfOrderSequenceNumber => {
                "the broker received an out-of-order sequence number"
            }
            KafkaCode::DuplicateSequenceNumber => {
                "the broker received a duplicate sequence number"
            }
            KafkaCode::InvalidProducerEpoch => {
                "the producer attempted an operation with an old epoch"
            }
            KafkaCode::InvalidTxnState => {
                "the producer attempted a transactional operation in an invalid state"
            }
            KafkaCode::InvalidProducerIdMapping => {
                "the producer id is not mapped to the given transactional id"
            }
            KafkaCode::InvalidTransactionTimeout => {
                "the transaction timeout is larger than the broker allows"
            }
            KafkaCode::ConcurrentTransactions => {
                "the producer attempted to update a transaction while another one is in progress"
            }
            KafkaCode::TransactionCoordinatorFenced => {
                "the transaction coordinator was fenced by a newer coordinator"
            }
            KafkaCode::TransactionalIdAuthorizationFailed => {
                "transactional id authorization failed"
            }
            KafkaCode::SecurityDisabled => "security features are disabled",
            KafkaCode::OperationNotAttempted => {
                "the broker did not attempt to execute this operation"
            }
            KafkaCode::KafkaStorageError => "a disk error occurred while handling the request",
            KafkaCode::LogDirNotFound => {
                "the user-specified log directory was not found in the broker config"
            }
            KafkaCode::SaslAuthenticationFailed => "SASL authentication failed",
            KafkaCode::UnknownProducerId => {
                "the broker could not locate the producer metadata for that producer id"
            }
            KafkaCode::ReassignmentInProgress => "a partition reassignment is in progress",
        }
    }
}

/// Describe any wire error code, with a generic fallback for unmapped values.
pub fn describe_error(code: i16) -> Cow<'static, str> {
    match KafkaCode::from_wire(code) {
        Some(known) => Cow::Borrowed(known.describe()),
        None => Cow::Owned(format!("unknown error code ({code})")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_roundtrip_all_codes() {
        for code in KafkaCode::ALL {
            assert_eq!(KafkaCode::from_wire(code as i16), Some(code));
        }
    }

    #[test]
    fn describe_known_and_unknown() {
        assert_eq!(describe_error(0), "no error");
        assert_eq!(
            describe_error(6),
            "this server is not the leader for that topic-partition"
        );
        assert_eq!(describe_error(94), "unknown error code (94)");
    }

    #[test]
    fn table_covers_the_full_range() {
        for code in 0..=60 {
            assert!(KafkaCode::from_wire(code).is_some(), "missing code {code}");
        }
        assert_eq!(KafkaCode::from_wire(-1), Some(KafkaCode::Unknown));
        assert_eq!(KafkaCode::from_wire(61), None);
    }

    #[test]
    fn retryable_classification() {
        assert!(FranzError::NoBrokersAvailable.is_retryable());
        assert!(FranzError::timeout(500).is_retryable());
        assert!(!FranzError::invalid_config("bad").is_retryable());
    }
}
