//! Typed request and response structures for every supported API.
//!
//! Each request knows how to validate itself; validation runs before any
//! byte is written and checks required fields in a fixed declared order, so
//! the first failing field deterministically determines the error.

use bytes::{Bytes, BytesMut};

use super::message::{Message, MessageSetEntry};
use super::{wire, ProtocolError};
use crate::config::Compression;

/// Header fields common to every request.
#[derive(Debug, Clone)]
pub struct RequestHeader {
    pub api_key: i16,
    pub api_version: i16,
    pub correlation_id: i32,
    pub client_id: String,
}

// ============================================================================
// PRODUCE (0)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ProduceRequest {
    pub required_acks: i16,
    pub ack_timeout_ms: i32,
    pub compression: Compression,
    pub topics: Vec<ProduceTopic>,
}

#[derive(Debug, Clone)]
pub struct ProduceTopic {
    pub topic: String,
    pub partitions: Vec<ProducePartition>,
}

#[derive(Debug, Clone)]
pub struct ProducePartition {
    pub partition: i32,
    pub messages: Vec<Message>,
}

impl ProduceRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.topics.is_empty() {
            return Err(ProtocolError::MissingField("data"));
        }
        for topic in &self.topics {
            if topic.topic.is_empty() {
                return Err(ProtocolError::MissingField("topic_name"));
            }
            for partition in &topic.partitions {
                if partition.messages.is_empty() {
                    return Err(ProtocolError::MissingField("messages"));
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProduceResponse {
    pub topics: Vec<ProduceTopicResponse>,
    pub throttle_time_ms: Option<i32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProduceTopicResponse {
    pub topic: String,
    pub partitions: Vec<ProducePartitionResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProducePartitionResponse {
    pub partition: i32,
    pub error_code: i16,
    pub base_offset: i64,
    /// Broker-assigned log-append time; only for brokers with message
    /// timestamps.
    pub log_append_time: Option<i64>,
}

// ============================================================================
// FETCH (1)
// ============================================================================

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub max_wait_ms: i32,
    pub min_bytes: i32,
    pub topics: Vec<FetchTopic>,
}

#[derive(Debug, Clone)]
pub struct FetchTopic {
    pub topic: String,
    pub partitions: Vec<FetchPartition>,
}

#[derive(Debug, Clone)]
pub struct FetchPartition {
    pub partition: i32,
    pub fetch_offset: i64,
    pub max_bytes: i32,
}

impl FetchRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.topics.is_empty() {
            return Err(ProtocolError::MissingField("data"));
        }
        for topic in &self.topics {
            if topic.topic.is_empty() {
                return Err(ProtocolError::MissingField("topic_name"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub throttle_time_ms: Option<i32>,
    pub topics: Vec<FetchTopicResponse>,
}

#[derive(Debug, Clone)]
pub struct FetchTopicResponse {
    pub topic: String,
    pub partitions: Vec<FetchPartitionResponse>,
}

#[derive(Debug, Clone)]
pub struct FetchPartitionResponse {
    pub partition: i32,
    pub error_code: i16,
    pub high_watermark: i64,
    pub entries: Vec<MessageSetEntry>,
}

// ============================================================================
// LIST OFFSETS (2)
// ============================================================================

/// Timestamp sentinel asking for the latest offset.
pub const OFFSET_LATEST: i64 = -1;
/// Timestamp sentinel asking for the earliest offset.
pub const OFFSET_EARLIEST: i64 = -2;

#[derive(Debug, Clone)]
pub struct ListOffsetsRequest {
    pub topics: Vec<ListOffsetsTopic>,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsTopic {
    pub topic: String,
    pub partitions: Vec<ListOffsetsPartition>,
}

#[derive(Debug, Clone)]
pub struct ListOffsetsPartition {
    pub partition: i32,
    /// `OFFSET_LATEST`, `OFFSET_EARLIEST`, or a concrete timestamp
    pub timestamp: i64,
    /// v0 only; dropped for brokers that answer with a single offset
    pub max_num_offsets: i32,
}

impl ListOffsetsRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.topics.is_empty() {
            return Err(ProtocolError::MissingField("data"));
        }
        for topic in &self.topics {
            if topic.topic.is_empty() {
                return Err(ProtocolError::MissingField("topic_name"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOffsetsResponse {
    pub topics: Vec<ListOffsetsTopicResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListOffsetsTopicResponse {
    pub topic: String,
    pub partitions: Vec<ListOffsetsPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListOffsetsPartitionResponse {
    pub partition: i32,
    pub error_code: i16,
    /// v0 returns a list; v1 a single offset, decoded as a one-element list
    pub offsets: Vec<i64>,
    /// v1 only
    pub timestamp: Option<i64>,
}

// ============================================================================
// METADATA (3)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct MetadataRequest {
    /// Empty list asks for all topics
    pub topics: Vec<String>,
}

impl MetadataRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        for topic in &self.topics {
            if topic.is_empty() {
                return Err(ProtocolError::MissingField("topic_name"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetadataResponse {
    pub brokers: Vec<BrokerMetadata>,
    pub topics: Vec<TopicMetadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BrokerMetadata {
    pub node_id: i32,
    pub host: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TopicMetadata {
    pub error_code: i16,
    pub topic: String,
    pub partitions: Vec<PartitionMetadata>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PartitionMetadata {
    pub error_code: i16,
    pub partition: i32,
    pub leader: i32,
    pub replicas: Vec<i32>,
    pub isr: Vec<i32>,
}

// ============================================================================
// OFFSET COMMIT (8)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    /// Only on the wire for group-aware commit versions
    pub generation_id: i32,
    pub member_id: String,
    /// `-1` keeps the broker default retention
    pub retention_time_ms: i64,
    pub topics: Vec<OffsetCommitTopic>,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitTopic {
    pub topic: String,
    pub partitions: Vec<OffsetCommitPartition>,
}

#[derive(Debug, Clone)]
pub struct OffsetCommitPartition {
    pub partition: i32,
    pub offset: i64,
    pub metadata: String,
}

impl OffsetCommitRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.group_id.is_empty() {
            return Err(ProtocolError::MissingField("group_id"));
        }
        if self.topics.is_empty() {
            return Err(ProtocolError::MissingField("data"));
        }
        for topic in &self.topics {
            if topic.topic.is_empty() {
                return Err(ProtocolError::MissingField("topic_name"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OffsetCommitResponse {
    pub topics: Vec<OffsetCommitTopicResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffsetCommitTopicResponse {
    pub topic: String,
    pub partitions: Vec<OffsetCommitPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffsetCommitPartitionResponse {
    pub partition: i32,
    pub error_code: i16,
}

// ============================================================================
// OFFSET FETCH (9)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    pub topics: Vec<OffsetFetchTopic>,
}

#[derive(Debug, Clone)]
pub struct OffsetFetchTopic {
    pub topic: String,
    pub partitions: Vec<i32>,
}

impl OffsetFetchRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.group_id.is_empty() {
            return Err(ProtocolError::MissingField("group_id"));
        }
        if self.topics.is_empty() {
            return Err(ProtocolError::MissingField("data"));
        }
        for topic in &self.topics {
            if topic.topic.is_empty() {
                return Err(ProtocolError::MissingField("topic_name"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OffsetFetchResponse {
    pub topics: Vec<OffsetFetchTopicResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffsetFetchTopicResponse {
    pub topic: String,
    pub partitions: Vec<OffsetFetchPartitionResponse>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffsetFetchPartitionResponse {
    pub partition: i32,
    /// `-1` when no offset has been committed
    pub offset: i64,
    pub metadata: String,
    pub error_code: i16,
}

// ============================================================================
// GROUP COORDINATOR (10)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct GroupCoordinatorRequest {
    pub group_id: String,
}

impl GroupCoordinatorRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.group_id.is_empty() {
            return Err(ProtocolError::MissingField("group_id"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GroupCoordinatorResponse {
    pub error_code: i16,
    pub coordinator_id: i32,
    pub host: String,
    pub port: i32,
}

// ============================================================================
// JOIN GROUP (11)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct JoinGroupRequest {
    pub group_id: String,
    pub session_timeout_ms: i32,
    /// Only on the wire for brokers that support it
    pub rebalance_timeout_ms: i32,
    /// Empty on the first join; assigned by the coordinator
    pub member_id: String,
    pub protocol_type: String,
    pub protocols: Vec<JoinGroupProtocol>,
}

#[derive(Debug, Clone)]
pub struct JoinGroupProtocol {
    pub name: String,
    pub metadata: Bytes,
}

impl JoinGroupRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.group_id.is_empty() {
            return Err(ProtocolError::MissingField("group_id"));
        }
        if self.session_timeout_ms <= 0 {
            return Err(ProtocolError::MissingField("session_timeout"));
        }
        if self.protocol_type.is_empty() {
            return Err(ProtocolError::MissingField("protocol_type"));
        }
        if self.protocols.is_empty() {
            return Err(ProtocolError::MissingField("group_protocols"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct JoinGroupResponse {
    pub error_code: i16,
    pub generation_id: i32,
    pub protocol_name: String,
    pub leader_id: String,
    pub member_id: String,
    /// Populated only for the elected leader
    pub members: Vec<JoinGroupMember>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JoinGroupMember {
    pub member_id: String,
    pub metadata: Bytes,
}

// ============================================================================
// HEARTBEAT (12)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
}

impl HeartbeatRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.group_id.is_empty() {
            return Err(ProtocolError::MissingField("group_id"));
        }
        if self.member_id.is_empty() {
            return Err(ProtocolError::MissingField("member_id"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeartbeatResponse {
    pub error_code: i16,
}

// ============================================================================
// LEAVE GROUP (13)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct LeaveGroupRequest {
    pub group_id: String,
    pub member_id: String,
}

impl LeaveGroupRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.group_id.is_empty() {
            return Err(ProtocolError::MissingField("group_id"));
        }
        if self.member_id.is_empty() {
            return Err(ProtocolError::MissingField("member_id"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LeaveGroupResponse {
    pub error_code: i16,
}

// ============================================================================
// SYNC GROUP (14)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct SyncGroupRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    /// Non-empty only when sent by the group leader
    pub assignments: Vec<SyncGroupAssignment>,
}

#[derive(Debug, Clone)]
pub struct SyncGroupAssignment {
    pub member_id: String,
    pub assignment: Bytes,
}

impl SyncGroupRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.group_id.is_empty() {
            return Err(ProtocolError::MissingField("group_id"));
        }
        if self.member_id.is_empty() {
            return Err(ProtocolError::MissingField("member_id"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncGroupResponse {
    pub error_code: i16,
    /// This member's serialized assignment; empty until the leader syncs
    pub assignment: Bytes,
}

// ============================================================================
// DESCRIBE GROUPS (15)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct DescribeGroupsRequest {
    pub group_ids: Vec<String>,
}

impl DescribeGroupsRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.group_ids.is_empty() {
            return Err(ProtocolError::MissingField("group_ids"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DescribeGroupsResponse {
    pub groups: Vec<GroupDescription>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupDescription {
    pub error_code: i16,
    pub group_id: String,
    pub state: String,
    pub protocol_type: String,
    pub protocol: String,
    pub members: Vec<GroupMemberDescription>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupMemberDescription {
    pub member_id: String,
    pub client_id: String,
    pub client_host: String,
    pub metadata: Bytes,
    pub assignment: Bytes,
}

// ============================================================================
// LIST GROUPS (16)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ListGroupsRequest;

impl ListGroupsRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListGroupsResponse {
    pub error_code: i16,
    pub groups: Vec<ListedGroup>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListedGroup {
    pub group_id: String,
    pub protocol_type: String,
}

// ============================================================================
// SASL HANDSHAKE (17)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct SaslHandshakeRequest {
    pub mechanism: String,
}

impl SaslHandshakeRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.mechanism.is_empty() {
            return Err(ProtocolError::MissingField("mechanism"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaslHandshakeResponse {
    pub error_code: i16,
    pub mechanisms: Vec<String>,
}

// ============================================================================
// API VERSIONS (18)
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct ApiVersionsRequest;

impl ApiVersionsRequest {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApiVersionsResponse {
    pub error_code: i16,
    pub api_versions: Vec<ApiVersionRange>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiVersionRange {
    pub api_key: i16,
    pub min_version: i16,
    pub max_version: i16,
}

// ============================================================================
// Request / response envelopes
// ============================================================================

#[derive(Debug, Clone)]
pub enum RequestBody {
    Produce(ProduceRequest),
    Fetch(FetchRequest),
    ListOffsets(ListOffsetsRequest),
    Metadata(MetadataRequest),
    OffsetCommit(OffsetCommitRequest),
    OffsetFetch(OffsetFetchRequest),
    GroupCoordinator(GroupCoordinatorRequest),
    JoinGroup(JoinGroupRequest),
    Heartbeat(HeartbeatRequest),
    LeaveGroup(LeaveGroupRequest),
    SyncGroup(SyncGroupRequest),
    DescribeGroups(DescribeGroupsRequest),
    ListGroups(ListGroupsRequest),
    SaslHandshake(SaslHandshakeRequest),
    ApiVersions(ApiVersionsRequest),
}

impl RequestBody {
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self {
            RequestBody::Produce(r) => r.validate(),
            RequestBody::Fetch(r) => r.validate(),
            RequestBody::ListOffsets(r) => r.validate(),
            RequestBody::Metadata(r) => r.validate(),
            RequestBody::OffsetCommit(r) => r.validate(),
            RequestBody::OffsetFetch(r) => r.validate(),
            RequestBody::GroupCoordinator(r) => r.validate(),
            RequestBody::JoinGroup(r) => r.validate(),
            RequestBody::Heartbeat(r) => r.validate(),
            RequestBody::LeaveGroup(r) => r.validate(),
            RequestBody::SyncGroup(r) => r.validate(),
            RequestBody::DescribeGroups(r) => r.validate(),
            RequestBody::ListGroups(r) => r.validate(),
            RequestBody::SaslHandshake(r) => r.validate(),
            RequestBody::ApiVersions(r) => r.validate(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ResponseBody {
    Produce(ProduceResponse),
    Fetch(FetchResponse),
    ListOffsets(ListOffsetsResponse),
    Metadata(MetadataResponse),
    OffsetCommit(OffsetCommitResponse),
    OffsetFetch(OffsetFetchResponse),
    GroupCoordinator(GroupCoordinatorResponse),
    JoinGroup(JoinGroupResponse),
    Heartbeat(HeartbeatResponse),
    LeaveGroup(LeaveGroupResponse),
    SyncGroup(SyncGroupResponse),
    DescribeGroups(DescribeGroupsResponse),
    ListGroups(ListGroupsResponse),
    SaslHandshake(SaslHandshakeResponse),
    ApiVersions(ApiVersionsResponse),
}

// ============================================================================
// Consumer-protocol payloads carried opaquely inside JoinGroup/SyncGroup
// ============================================================================

/// The subscription a member advertises in its JoinGroup protocol metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Subscription {
    pub version: i16,
    pub topics: Vec<String>,
    pub user_data: Bytes,
}

impl Subscription {
    pub fn new(topics: Vec<String>) -> Self {
        Self {
            version: 0,
            topics,
            user_data: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        wire::put_i16(&mut buf, self.version);
        wire::put_array(&mut buf, &self.topics, |b, t| wire::put_string(b, t));
        wire::put_bytes(&mut buf, &self.user_data);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut cur = std::io::Cursor::new(data);
        let version = wire::get_i16(&mut cur)?;
        let topics = wire::get_array(&mut cur, wire::get_string)?;
        let user_data = wire::get_bytes(&mut cur)?;
        Ok(Self {
            version,
            topics,
            user_data,
        })
    }
}

/// The per-member partition assignment the leader distributes in SyncGroup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberAssignment {
    pub version: i16,
    /// `(topic, partitions)` pairs
    pub partitions: Vec<(String, Vec<i32>)>,
    pub user_data: Bytes,
}

impl MemberAssignment {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        wire::put_i16(&mut buf, self.version);
        wire::put_array(&mut buf, &self.partitions, |b, (topic, partitions)| {
            wire::put_string(b, topic);
            wire::put_array(b, partitions, |b, p| wire::put_i32(b, *p));
        });
        wire::put_bytes(&mut buf, &self.user_data);
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut cur = std::io::Cursor::new(data);
        let version = wire::get_i16(&mut cur)?;
        let partitions = wire::get_array(&mut cur, |cur| {
            let topic = wire::get_string(cur)?;
            let partitions = wire::get_array(cur, wire::get_i32)?;
            Ok((topic, partitions))
        })?;
        let user_data = wire::get_bytes(&mut cur)?;
        Ok(Self {
            version,
            partitions,
            user_data,
        })
    }
}
