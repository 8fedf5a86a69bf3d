//! Kafka wire protocol: primitives, message sets, per-API codecs and the
//! version-aware registry that ties them together.
//!
//! The protocol is big-endian binary. Strings are `int16`-length-prefixed,
//! byte blobs `int32`-length-prefixed, arrays `int32`-count-prefixed, and
//! nullable fields use `-1` as the null marker. Every frame starts with an
//! `int32` length covering everything after the length field itself.

use thiserror::Error;

use crate::config::BrokerVersion;

pub mod codec;
pub mod message;
pub mod messages;
pub mod registry;
pub mod wire;

/// Errors raised by the encode/decode layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("buffer underrun: needed {needed}, available {available}")]
    Underrun { needed: usize, available: usize },

    #[error("length value {0} is out of range")]
    InvalidLength(i32),

    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    #[error("invalid request data, field `{0}` is undefined")]
    MissingField(&'static str),

    #[error("unsupported API key: {0}")]
    UnsupportedApiKey(i16),

    #[error("compression codec {0} is not supported")]
    UnsupportedCompression(u8),

    #[error("CRC mismatch: stored {stored:#010x}, computed {computed:#010x}")]
    CrcMismatch { stored: u32, computed: u32 },

    #[error("invalid message magic: {0}")]
    InvalidMagic(u8),

    #[error("malformed compressed payload: {0}")]
    BadCompressedPayload(String),

    #[error("unexpected response body for API key {0}")]
    UnexpectedResponse(i16),
}

/// The Kafka APIs this client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i16)]
pub enum ApiKey {
    Produce = 0,
    Fetch = 1,
    ListOffsets = 2,
    Metadata = 3,
    OffsetCommit = 8,
    OffsetFetch = 9,
    GroupCoordinator = 10,
    JoinGroup = 11,
    Heartbeat = 12,
    LeaveGroup = 13,
    SyncGroup = 14,
    DescribeGroups = 15,
    ListGroups = 16,
    SaslHandshake = 17,
    ApiVersions = 18,
}

impl ApiKey {
    pub const ALL: [ApiKey; 15] = [
        ApiKey::Produce,
        ApiKey::Fetch,
        ApiKey::ListOffsets,
        ApiKey::Metadata,
        ApiKey::OffsetCommit,
        ApiKey::OffsetFetch,
        ApiKey::GroupCoordinator,
        ApiKey::JoinGroup,
        ApiKey::Heartbeat,
        ApiKey::LeaveGroup,
        ApiKey::SyncGroup,
        ApiKey::DescribeGroups,
        ApiKey::ListGroups,
        ApiKey::SaslHandshake,
        ApiKey::ApiVersions,
    ];

    pub fn from_wire(key: i16) -> Result<ApiKey, ProtocolError> {
        Self::ALL
            .iter()
            .copied()
            .find(|k| *k as i16 == key)
            .ok_or(ProtocolError::UnsupportedApiKey(key))
    }

    /// The request version put on the wire for a given broker version.
    pub fn wire_version(self, broker: BrokerVersion) -> i16 {
        match self {
            ApiKey::Produce | ApiKey::Fetch => {
                if broker.at_least(BrokerVersion::V0_10_0) {
                    2
                } else if broker.at_least(BrokerVersion::V0_9_0) {
                    1
                } else {
                    0
                }
            }
            ApiKey::ListOffsets => {
                if broker.at_least(BrokerVersion::V0_10_1) {
                    1
                } else {
                    0
                }
            }
            ApiKey::OffsetCommit => {
                if broker.at_least(BrokerVersion::V0_9_0) {
                    2
                } else {
                    0
                }
            }
            ApiKey::OffsetFetch => {
                if broker.at_least(BrokerVersion::V0_8_2) {
                    1
                } else {
                    0
                }
            }
            ApiKey::JoinGroup => {
                if broker.at_least(BrokerVersion::V0_10_1) {
                    1
                } else {
                    0
                }
            }
            _ => 0,
        }
    }
}

/// One row of the field-presence table: a field exists on the wire only for
/// brokers at or above its introduction version.
struct FieldVersion {
    api: ApiKey,
    field: &'static str,
    min: BrokerVersion,
}

/// Central table of version-gated fields. Adding support for a newer broker
/// version means touching this table, not every codec.
const FIELD_VERSIONS: &[FieldVersion] = &[
    FieldVersion {
        api: ApiKey::Produce,
        field: "timestamp",
        min: BrokerVersion::V0_10_0,
    },
    FieldVersion {
        api: ApiKey::Fetch,
        field: "timestamp",
        min: BrokerVersion::V0_10_0,
    },
    FieldVersion {
        api: ApiKey::Produce,
        field: "throttle_time_ms",
        min: BrokerVersion::V0_9_0,
    },
    FieldVersion {
        api: ApiKey::Fetch,
        field: "throttle_time_ms",
        min: BrokerVersion::V0_9_0,
    },
    FieldVersion {
        api: ApiKey::Produce,
        field: "log_append_time",
        min: BrokerVersion::V0_10_0,
    },
    FieldVersion {
        api: ApiKey::JoinGroup,
        field: "rebalance_timeout",
        min: BrokerVersion::V0_10_1,
    },
    FieldVersion {
        api: ApiKey::ListOffsets,
        field: "offset_timestamp",
        min: BrokerVersion::V0_10_1,
    },
    FieldVersion {
        api: ApiKey::OffsetCommit,
        field: "retention_time",
        min: BrokerVersion::V0_9_0,
    },
];

/// Whether `field` is on the wire for `api` at the given broker version.
/// Fields absent from the table are unconditional.
pub fn field_present(api: ApiKey, field: &str, broker: BrokerVersion) -> bool {
    FIELD_VERSIONS
        .iter()
        .find(|f| f.api == api && f.field == field)
        .map(|f| broker.at_least(f.min))
        .unwrap_or(true)
}

/// Message magic byte for a broker version: magic 1 carries timestamps.
pub fn message_magic(broker: BrokerVersion) -> u8 {
    if field_present(ApiKey::Produce, "timestamp", broker) {
        1
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_key_roundtrip() {
        for key in ApiKey::ALL {
            assert_eq!(ApiKey::from_wire(key as i16).unwrap(), key);
        }
        assert_eq!(
            ApiKey::from_wire(99),
            Err(ProtocolError::UnsupportedApiKey(99))
        );
    }

    #[test]
    fn wire_versions_follow_broker_version() {
        let old: BrokerVersion = "0.8.1".parse().unwrap();
        let v9: BrokerVersion = "0.9.0.1".parse().unwrap();
        let v10: BrokerVersion = "0.10.1.0".parse().unwrap();

        assert_eq!(ApiKey::Produce.wire_version(old), 0);
        assert_eq!(ApiKey::Produce.wire_version(v9), 1);
        assert_eq!(ApiKey::Produce.wire_version(v10), 2);
        assert_eq!(ApiKey::JoinGroup.wire_version(v9), 0);
        assert_eq!(ApiKey::JoinGroup.wire_version(v10), 1);
        assert_eq!(ApiKey::Metadata.wire_version(v10), 0);
    }

    #[test]
    fn field_gating_consults_the_table() {
        let v9: BrokerVersion = "0.9.0.1".parse().unwrap();
        let v10_1: BrokerVersion = "0.10.1.0".parse().unwrap();

        assert!(!field_present(ApiKey::JoinGroup, "rebalance_timeout", v9));
        assert!(field_present(ApiKey::JoinGroup, "rebalance_timeout", v10_1));
        assert!(!field_present(ApiKey::Produce, "timestamp", v9));
        assert!(field_present(ApiKey::Produce, "timestamp", v10_1));
        // unconditional fields are always present
        assert!(field_present(ApiKey::Metadata, "topics", v9));
    }

    #[test]
    fn magic_tracks_timestamp_support() {
        assert_eq!(message_magic("0.9.0.1".parse().unwrap()), 0);
        assert_eq!(message_magic("0.10.0.0".parse().unwrap()), 1);
    }
}
