//! Version-aware encoder/decoder for each API.
//!
//! One [`ApiCodec`] instance exists per API key for a negotiated broker
//! version (the registry caches them). Requests validate before the first
//! byte is written so a failed encode never emits a partial frame.

use std::io::Cursor;

use bytes::{Bytes, BytesMut};
use tracing::warn;

use super::message::{decode_message_set, encode_message_set};
use super::messages::*;
use super::{field_present, message_magic, wire, ApiKey, ProtocolError};
use crate::config::BrokerVersion;

/// Replica id a normal (non-broker) client sends in fetch/offset requests.
const CONSUMER_REPLICA_ID: i32 = -1;

#[derive(Debug, Clone)]
pub struct ApiCodec {
    api: ApiKey,
    broker: BrokerVersion,
    wire_version: i16,
}

impl ApiCodec {
    pub fn new(api: ApiKey, broker: BrokerVersion) -> Self {
        Self {
            api,
            broker,
            wire_version: api.wire_version(broker),
        }
    }

    pub fn api_key(&self) -> ApiKey {
        self.api
    }

    /// The request version this codec puts in the header.
    pub fn api_version(&self) -> i16 {
        self.wire_version
    }

    fn gated(&self, field: &str) -> bool {
        field_present(self.api, field, self.broker)
    }

    /// Encode a request body. The body variant must match this codec's API.
    pub fn encode_body(&self, body: &RequestBody) -> Result<Bytes, ProtocolError> {
        body.validate()?;
        let mut buf = BytesMut::new();
        match (self.api, body) {
            (ApiKey::Produce, RequestBody::Produce(r)) => self.encode_produce(r, &mut buf)?,
            (ApiKey::Fetch, RequestBody::Fetch(r)) => self.encode_fetch(r, &mut buf),
            (ApiKey::ListOffsets, RequestBody::ListOffsets(r)) => {
                self.encode_list_offsets(r, &mut buf)
            }
            (ApiKey::Metadata, RequestBody::Metadata(r)) => encode_metadata(r, &mut buf),
            (ApiKey::OffsetCommit, RequestBody::OffsetCommit(r)) => {
                self.encode_offset_commit(r, &mut buf)
            }
            (ApiKey::OffsetFetch, RequestBody::OffsetFetch(r)) => {
                encode_offset_fetch(r, &mut buf)
            }
            (ApiKey::GroupCoordinator, RequestBody::GroupCoordinator(r)) => {
                wire::put_string(&mut buf, &r.group_id)
            }
            (ApiKey::JoinGroup, RequestBody::JoinGroup(r)) => self.encode_join_group(r, &mut buf),
            (ApiKey::Heartbeat, RequestBody::Heartbeat(r)) => {
                wire::put_string(&mut buf, &r.group_id);
                wire::put_i32(&mut buf, r.generation_id);
                wire::put_string(&mut buf, &r.member_id);
            }
            (ApiKey::LeaveGroup, RequestBody::LeaveGroup(r)) => {
                wire::put_string(&mut buf, &r.group_id);
                wire::put_string(&mut buf, &r.member_id);
            }
            (ApiKey::SyncGroup, RequestBody::SyncGroup(r)) => encode_sync_group(r, &mut buf),
            (ApiKey::DescribeGroups, RequestBody::DescribeGroups(r)) => {
                wire::put_array(&mut buf, &r.group_ids, |b, g| wire::put_string(b, g))
            }
            (ApiKey::ListGroups, RequestBody::ListGroups(_)) => {}
            (ApiKey::SaslHandshake, RequestBody::SaslHandshake(r)) => {
                wire::put_string(&mut buf, &r.mechanism)
            }
            (ApiKey::ApiVersions, RequestBody::ApiVersions(_)) => {}
            _ => return Err(ProtocolError::UnsupportedApiKey(self.api as i16)),
        }
        Ok(buf.freeze())
    }

    /// Decode a response body (everything after the correlation id).
    pub fn decode_body(&self, data: &[u8]) -> Result<ResponseBody, ProtocolError> {
        let mut cur = Cursor::new(data);
        match self.api {
            ApiKey::Produce => self.decode_produce(&mut cur).map(ResponseBody::Produce),
            ApiKey::Fetch => self.decode_fetch(&mut cur).map(ResponseBody::Fetch),
            ApiKey::ListOffsets => self
                .decode_list_offsets(&mut cur)
                .map(ResponseBody::ListOffsets),
            ApiKey::Metadata => decode_metadata(&mut cur).map(ResponseBody::Metadata),
            ApiKey::OffsetCommit => decode_offset_commit(&mut cur).map(ResponseBody::OffsetCommit),
            ApiKey::OffsetFetch => decode_offset_fetch(&mut cur).map(ResponseBody::OffsetFetch),
            ApiKey::GroupCoordinator => {
                decode_group_coordinator(&mut cur).map(ResponseBody::GroupCoordinator)
            }
            ApiKey::JoinGroup => decode_join_group(&mut cur).map(ResponseBody::JoinGroup),
            ApiKey::Heartbeat => Ok(ResponseBody::Heartbeat(HeartbeatResponse {
                error_code: wire::get_i16(&mut cur)?,
            })),
            ApiKey::LeaveGroup => Ok(ResponseBody::LeaveGroup(LeaveGroupResponse {
                error_code: wire::get_i16(&mut cur)?,
            })),
            ApiKey::SyncGroup => Ok(ResponseBody::SyncGroup(SyncGroupResponse {
                error_code: wire::get_i16(&mut cur)?,
                assignment: wire::get_nullable_bytes(&mut cur)?.unwrap_or_default(),
            })),
            ApiKey::DescribeGroups => {
                decode_describe_groups(&mut cur).map(ResponseBody::DescribeGroups)
            }
            ApiKey::ListGroups => decode_list_groups(&mut cur).map(ResponseBody::ListGroups),
            ApiKey::SaslHandshake => {
                decode_sasl_handshake(&mut cur).map(ResponseBody::SaslHandshake)
            }
            ApiKey::ApiVersions => decode_api_versions(&mut cur).map(ResponseBody::ApiVersions),
        }
    }

    // ------------------------------------------------------------------
    // Produce
    // ------------------------------------------------------------------

    fn encode_produce(&self, r: &ProduceRequest, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let magic = message_magic(self.broker);
        // message sets are built first so a compression failure cannot
        // leave a partially written body
        let mut sets = Vec::new();
        for topic in &r.topics {
            for partition in &topic.partitions {
                sets.push(encode_message_set(
                    &partition.messages,
                    magic,
                    r.compression,
                )?);
            }
        }

        wire::put_i16(buf, r.required_acks);
        wire::put_i32(buf, r.ack_timeout_ms);
        let mut set_index = 0;
        wire::put_i32(buf, r.topics.len() as i32);
        for topic in &r.topics {
            wire::put_string(buf, &topic.topic);
            wire::put_i32(buf, topic.partitions.len() as i32);
            for partition in &topic.partitions {
                wire::put_i32(buf, partition.partition);
                let set: &Bytes = &sets[set_index];
                set_index += 1;
                wire::put_i32(buf, set.len() as i32);
                buf.extend_from_slice(set);
            }
        }
        Ok(())
    }

    fn decode_produce(&self, cur: &mut wire::Reader<'_>) -> Result<ProduceResponse, ProtocolError> {
        let log_append = self.gated("log_append_time");
        let topics = wire::get_array(cur, |cur| {
            let topic = wire::get_string(cur)?;
            let partitions = wire::get_array(cur, |cur| {
                Ok(ProducePartitionResponse {
                    partition: wire::get_i32(cur)?,
                    error_code: wire::get_i16(cur)?,
                    base_offset: wire::get_i64(cur)?,
                    log_append_time: if log_append {
                        Some(wire::get_i64(cur)?)
                    } else {
                        None
                    },
                })
            })?;
            Ok(ProduceTopicResponse { topic, partitions })
        })?;
        let throttle_time_ms = if self.gated("throttle_time_ms") {
            Some(wire::get_i32(cur)?)
        } else {
            None
        };
        Ok(ProduceResponse {
            topics,
            throttle_time_ms,
        })
    }

    // ------------------------------------------------------------------
    // Fetch
    // ------------------------------------------------------------------

    fn encode_fetch(&self, r: &FetchRequest, buf: &mut BytesMut) {
        wire::put_i32(buf, CONSUMER_REPLICA_ID);
        wire::put_i32(buf, r.max_wait_ms);
        wire::put_i32(buf, r.min_bytes);
        wire::put_array(buf, &r.topics, |buf, topic| {
            wire::put_string(buf, &topic.topic);
            wire::put_array(buf, &topic.partitions, |buf, p| {
                wire::put_i32(buf, p.partition);
                wire::put_i64(buf, p.fetch_offset);
                wire::put_i32(buf, p.max_bytes);
            });
        });
    }

    fn decode_fetch(&self, cur: &mut wire::Reader<'_>) -> Result<FetchResponse, ProtocolError> {
        let throttle_time_ms = if self.gated("throttle_time_ms") {
            Some(wire::get_i32(cur)?)
        } else {
            None
        };
        let topics = wire::get_array(cur, |cur| {
            let topic = wire::get_string(cur)?;
            let partitions = wire::get_array(cur, |cur| {
                let partition = wire::get_i32(cur)?;
                let error_code = wire::get_i16(cur)?;
                let high_watermark = wire::get_i64(cur)?;
                let set = wire::get_bytes(cur)?;
                // a corrupt record stops this partition's set; the rest of
                // the response stays usable
                let entries = match decode_message_set(&set) {
                    Ok(entries) => entries,
                    Err(err) => {
                        warn!(partition, %err, "dropping message set");
                        Vec::new()
                    }
                };
                Ok(FetchPartitionResponse {
                    partition,
                    error_code,
                    high_watermark,
                    entries,
                })
            })?;
            Ok(FetchTopicResponse { topic, partitions })
        })?;
        Ok(FetchResponse {
            throttle_time_ms,
            topics,
        })
    }

    // ------------------------------------------------------------------
    // ListOffsets
    // ------------------------------------------------------------------

    fn encode_list_offsets(&self, r: &ListOffsetsRequest, buf: &mut BytesMut) {
        let single_offset = self.gated("offset_timestamp");
        wire::put_i32(buf, CONSUMER_REPLICA_ID);
        wire::put_array(buf, &r.topics, |buf, topic| {
            wire::put_string(buf, &topic.topic);
            wire::put_array(buf, &topic.partitions, |buf, p| {
                wire::put_i32(buf, p.partition);
                wire::put_i64(buf, p.timestamp);
                if !single_offset {
                    wire::put_i32(buf, p.max_num_offsets);
                }
            });
        });
    }

    fn decode_list_offsets(
        &self,
        cur: &mut wire::Reader<'_>,
    ) -> Result<ListOffsetsResponse, ProtocolError> {
        let single_offset = self.gated("offset_timestamp");
        let topics = wire::get_array(cur, |cur| {
            let topic = wire::get_string(cur)?;
            let partitions = wire::get_array(cur, |cur| {
                let partition = wire::get_i32(cur)?;
                let error_code = wire::get_i16(cur)?;
                let (offsets, timestamp) = if single_offset {
                    let timestamp = wire::get_i64(cur)?;
                    let offset = wire::get_i64(cur)?;
                    (vec![offset], Some(timestamp))
                } else {
                    (wire::get_array(cur, wire::get_i64)?, None)
                };
                Ok(ListOffsetsPartitionResponse {
                    partition,
                    error_code,
                    offsets,
                    timestamp,
                })
            })?;
            Ok(ListOffsetsTopicResponse { topic, partitions })
        })?;
        Ok(ListOffsetsResponse { topics })
    }

    // ------------------------------------------------------------------
    // OffsetCommit
    // ------------------------------------------------------------------

    fn encode_offset_commit(&self, r: &OffsetCommitRequest, buf: &mut BytesMut) {
        wire::put_string(buf, &r.group_id);
        if self.gated("retention_time") {
            wire::put_i32(buf, r.generation_id);
            wire::put_string(buf, &r.member_id);
            wire::put_i64(buf, r.retention_time_ms);
        }
        wire::put_array(buf, &r.topics, |buf, topic| {
            wire::put_string(buf, &topic.topic);
            wire::put_array(buf, &topic.partitions, |buf, p| {
                wire::put_i32(buf, p.partition);
                wire::put_i64(buf, p.offset);
                wire::put_string(buf, &p.metadata);
            });
        });
    }

    // ------------------------------------------------------------------
    // JoinGroup
    // ------------------------------------------------------------------

    fn encode_join_group(&self, r: &JoinGroupRequest, buf: &mut BytesMut) {
        wire::put_string(buf, &r.group_id);
        wire::put_i32(buf, r.session_timeout_ms);
        if self.gated("rebalance_timeout") {
            wire::put_i32(buf, r.rebalance_timeout_ms);
        }
        wire::put_string(buf, &r.member_id);
        wire::put_string(buf, &r.protocol_type);
        wire::put_array(buf, &r.protocols, |buf, p| {
            wire::put_string(buf, &p.name);
            wire::put_bytes(buf, &p.metadata);
        });
    }
}

// ----------------------------------------------------------------------
// Version-independent bodies
// ----------------------------------------------------------------------

fn encode_metadata(r: &MetadataRequest, buf: &mut BytesMut) {
    wire::put_array(buf, &r.topics, |b, t| wire::put_string(b, t));
}

fn decode_metadata(cur: &mut wire::Reader<'_>) -> Result<MetadataResponse, ProtocolError> {
    let brokers = wire::get_array(cur, |cur| {
        Ok(BrokerMetadata {
            node_id: wire::get_i32(cur)?,
            host: wire::get_string(cur)?,
            port: wire::get_i32(cur)?,
        })
    })?;
    let topics = wire::get_array(cur, |cur| {
        let error_code = wire::get_i16(cur)?;
        let topic = wire::get_string(cur)?;
        let partitions = wire::get_array(cur, |cur| {
            Ok(PartitionMetadata {
                error_code: wire::get_i16(cur)?,
                partition: wire::get_i32(cur)?,
                leader: wire::get_i32(cur)?,
                replicas: wire::get_array(cur, wire::get_i32)?,
                isr: wire::get_array(cur, wire::get_i32)?,
            })
        })?;
        Ok(TopicMetadata {
            error_code,
            topic,
            partitions,
        })
    })?;
    Ok(MetadataResponse { brokers, topics })
}

fn encode_offset_fetch(r: &OffsetFetchRequest, buf: &mut BytesMut) {
    wire::put_string(buf, &r.group_id);
    wire::put_array(buf, &r.topics, |buf, topic| {
        wire::put_string(buf, &topic.topic);
        wire::put_array(buf, &topic.partitions, |b, p| wire::put_i32(b, *p));
    });
}

fn decode_offset_fetch(cur: &mut wire::Reader<'_>) -> Result<OffsetFetchResponse, ProtocolError> {
    let topics = wire::get_array(cur, |cur| {
        let topic = wire::get_string(cur)?;
        let partitions = wire::get_array(cur, |cur| {
            Ok(OffsetFetchPartitionResponse {
                partition: wire::get_i32(cur)?,
                offset: wire::get_i64(cur)?,
                metadata: wire::get_nullable_string(cur)?.unwrap_or_default(),
                error_code: wire::get_i16(cur)?,
            })
        })?;
        Ok(OffsetFetchTopicResponse { topic, partitions })
    })?;
    Ok(OffsetFetchResponse { topics })
}

fn decode_offset_commit(cur: &mut wire::Reader<'_>) -> Result<OffsetCommitResponse, ProtocolError> {
    let topics = wire::get_array(cur, |cur| {
        let topic = wire::get_string(cur)?;
        let partitions = wire::get_array(cur, |cur| {
            Ok(OffsetCommitPartitionResponse {
                partition: wire::get_i32(cur)?,
                error_code: wire::get_i16(cur)?,
            })
        })?;
        Ok(OffsetCommitTopicResponse { topic, partitions })
    })?;
    Ok(OffsetCommitResponse { topics })
}

fn decode_group_coordinator(
    cur: &mut wire::Reader<'_>,
) -> Result<GroupCoordinatorResponse, ProtocolError> {
    Ok(GroupCoordinatorResponse {
        error_code: wire::get_i16(cur)?,
        coordinator_id: wire::get_i32(cur)?,
        host: wire::get_string(cur)?,
        port: wire::get_i32(cur)?,
    })
}

fn decode_join_group(cur: &mut wire::Reader<'_>) -> Result<JoinGroupResponse, ProtocolError> {
    Ok(JoinGroupResponse {
        error_code: wire::get_i16(cur)?,
        generation_id: wire::get_i32(cur)?,
        protocol_name: wire::get_string(cur)?,
        leader_id: wire::get_string(cur)?,
        member_id: wire::get_string(cur)?,
        members: wire::get_array(cur, |cur| {
            Ok(JoinGroupMember {
                member_id: wire::get_string(cur)?,
                metadata: wire::get_bytes(cur)?,
            })
        })?,
    })
}

fn encode_sync_group(r: &SyncGroupRequest, buf: &mut BytesMut) {
    wire::put_string(buf, &r.group_id);
    wire::put_i32(buf, r.generation_id);
    wire::put_string(buf, &r.member_id);
    wire::put_array(buf, &r.assignments, |buf, a| {
        wire::put_string(buf, &a.member_id);
        wire::put_bytes(buf, &a.assignment);
    });
}

fn decode_describe_groups(
    cur: &mut wire::Reader<'_>,
) -> Result<DescribeGroupsResponse, ProtocolError> {
    let groups = wire::get_array(cur, |cur| {
        Ok(GroupDescription {
            error_code: wire::get_i16(cur)?,
            group_id: wire::get_string(cur)?,
            state: wire::get_string(cur)?,
            protocol_type: wire::get_string(cur)?,
            protocol: wire::get_string(cur)?,
            members: wire::get_array(cur, |cur| {
                Ok(GroupMemberDescription {
                    member_id: wire::get_string(cur)?,
                    client_id: wire::get_string(cur)?,
                    client_host: wire::get_string(cur)?,
                    metadata: wire::get_bytes(cur)?,
                    assignment: wire::get_bytes(cur)?,
                })
            })?,
        })
    })?;
    Ok(DescribeGroupsResponse { groups })
}

fn decode_list_groups(cur: &mut wire::Reader<'_>) -> Result<ListGroupsResponse, ProtocolError> {
    Ok(ListGroupsResponse {
        error_code: wire::get_i16(cur)?,
        groups: wire::get_array(cur, |cur| {
            Ok(ListedGroup {
                group_id: wire::get_string(cur)?,
                protocol_type: wire::get_string(cur)?,
            })
        })?,
    })
}

fn decode_sasl_handshake(
    cur: &mut wire::Reader<'_>,
) -> Result<SaslHandshakeResponse, ProtocolError> {
    Ok(SaslHandshakeResponse {
        error_code: wire::get_i16(cur)?,
        mechanisms: wire::get_array(cur, wire::get_string)?,
    })
}

fn decode_api_versions(cur: &mut wire::Reader<'_>) -> Result<ApiVersionsResponse, ProtocolError> {
    Ok(ApiVersionsResponse {
        error_code: wire::get_i16(cur)?,
        api_versions: wire::get_array(cur, |cur| {
            Ok(ApiVersionRange {
                api_key: wire::get_i16(cur)?,
                min_version: wire::get_i16(cur)?,
                max_version: wire::get_i16(cur)?,
            })
        })?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::message::Message;

    fn v(s: &str) -> BrokerVersion {
        s.parse().unwrap()
    }

    fn codec(api: ApiKey, broker: &str) -> ApiCodec {
        ApiCodec::new(api, v(broker))
    }

    fn produce_request() -> RequestBody {
        RequestBody::Produce(ProduceRequest {
            required_acks: 1,
            ack_timeout_ms: 5000,
            compression: Default::default(),
            topics: vec![ProduceTopic {
                topic: "test".into(),
                partitions: vec![ProducePartition {
                    partition: 0,
                    messages: vec![Message::new("value").with_timestamp(1_000)],
                }],
            }],
        })
    }

    #[test]
    fn produce_encoding_gains_timestamp_at_0_10() {
        let old = codec(ApiKey::Produce, "0.9.0.1")
            .encode_body(&produce_request())
            .unwrap();
        let new = codec(ApiKey::Produce, "0.10.1.0")
            .encode_body(&produce_request())
            .unwrap();
        assert_eq!(new.len(), old.len() + 8, "only the message timestamp differs");
    }

    #[test]
    fn metadata_encoding_is_version_independent() {
        let body = RequestBody::Metadata(MetadataRequest {
            topics: vec!["test".into()],
        });
        let a = codec(ApiKey::Metadata, "0.8.2.2").encode_body(&body).unwrap();
        let b = codec(ApiKey::Metadata, "0.10.1.0").encode_body(&body).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn join_group_gains_rebalance_timeout_at_0_10_1() {
        let body = RequestBody::JoinGroup(JoinGroupRequest {
            group_id: "g".into(),
            session_timeout_ms: 6000,
            rebalance_timeout_ms: 9000,
            member_id: String::new(),
            protocol_type: "consumer".into(),
            protocols: vec![JoinGroupProtocol {
                name: "group".into(),
                metadata: Bytes::new(),
            }],
        });
        let v0 = codec(ApiKey::JoinGroup, "0.9.0.1").encode_body(&body).unwrap();
        let v1 = codec(ApiKey::JoinGroup, "0.10.1.0").encode_body(&body).unwrap();
        assert_eq!(v1.len(), v0.len() + 4);
        assert_eq!(codec(ApiKey::JoinGroup, "0.9.0.1").api_version(), 0);
        assert_eq!(codec(ApiKey::JoinGroup, "0.10.1.0").api_version(), 1);
    }

    #[test]
    fn validation_failure_emits_no_bytes() {
        let body = RequestBody::SyncGroup(SyncGroupRequest::default());
        let result = codec(ApiKey::SyncGroup, "0.10.1.0").encode_body(&body);
        assert_eq!(result, Err(ProtocolError::MissingField("group_id")));
    }

    #[test]
    fn mismatched_body_is_rejected() {
        let body = RequestBody::Heartbeat(HeartbeatRequest {
            group_id: "g".into(),
            generation_id: 1,
            member_id: "m".into(),
        });
        let result = codec(ApiKey::Produce, "0.10.1.0").encode_body(&body);
        assert_eq!(result, Err(ProtocolError::UnsupportedApiKey(0)));
    }

    #[test]
    fn fetch_response_roundtrip_with_throttle() {
        // broker-side frame: throttle, one topic, one partition with one message
        let set = encode_message_set(&[Message::new("v")], 1, Default::default()).unwrap();
        let mut buf = BytesMut::new();
        wire::put_i32(&mut buf, 7); // throttle_time_ms
        wire::put_i32(&mut buf, 1);
        wire::put_string(&mut buf, "test");
        wire::put_i32(&mut buf, 1);
        wire::put_i32(&mut buf, 0); // partition
        wire::put_i16(&mut buf, 0); // error
        wire::put_i64(&mut buf, 45); // high watermark
        wire::put_bytes(&mut buf, &set);

        let decoded = codec(ApiKey::Fetch, "0.10.1.0").decode_body(&buf).unwrap();
        let ResponseBody::Fetch(resp) = decoded else {
            panic!("wrong body type");
        };
        assert_eq!(resp.throttle_time_ms, Some(7));
        let partition = &resp.topics[0].partitions[0];
        assert_eq!(partition.high_watermark, 45);
        assert_eq!(partition.entries.len(), 1);
        assert_eq!(
            partition.entries[0].message.value,
            Some(Bytes::from_static(b"v"))
        );
    }

    #[test]
    fn fetch_response_v0_has_no_throttle() {
        let mut buf = BytesMut::new();
        wire::put_i32(&mut buf, 0); // topic count only
        let decoded = codec(ApiKey::Fetch, "0.8.2.0").decode_body(&buf).unwrap();
        let ResponseBody::Fetch(resp) = decoded else {
            panic!("wrong body type");
        };
        assert_eq!(resp.throttle_time_ms, None);
        assert!(resp.topics.is_empty());
    }

    #[test]
    fn metadata_response_roundtrip() {
        let mut buf = BytesMut::new();
        wire::put_i32(&mut buf, 1);
        wire::put_i32(&mut buf, 0); // node id
        wire::put_string(&mut buf, "broker-a");
        wire::put_i32(&mut buf, 9092);
        wire::put_i32(&mut buf, 1);
        wire::put_i16(&mut buf, 0); // topic error
        wire::put_string(&mut buf, "test");
        wire::put_i32(&mut buf, 2);
        for p in 0..2 {
            wire::put_i16(&mut buf, 0);
            wire::put_i32(&mut buf, p);
            wire::put_i32(&mut buf, 0); // leader
            wire::put_i32(&mut buf, 1);
            wire::put_i32(&mut buf, 0);
            wire::put_i32(&mut buf, 1);
            wire::put_i32(&mut buf, 0);
        }

        let decoded = codec(ApiKey::Metadata, "0.10.1.0").decode_body(&buf).unwrap();
        let ResponseBody::Metadata(resp) = decoded else {
            panic!("wrong body type");
        };
        assert_eq!(resp.brokers[0].host, "broker-a");
        assert_eq!(resp.topics[0].partitions.len(), 2);
        assert_eq!(resp.topics[0].partitions[1].partition, 1);
    }

    #[test]
    fn group_coordinator_response_roundtrip() {
        let mut buf = BytesMut::new();
        wire::put_i16(&mut buf, 0);
        wire::put_i32(&mut buf, 2);
        wire::put_string(&mut buf, "coord.example");
        wire::put_i32(&mut buf, 9092);
        let decoded = codec(ApiKey::GroupCoordinator, "0.10.1.0")
            .decode_body(&buf)
            .unwrap();
        let ResponseBody::GroupCoordinator(resp) = decoded else {
            panic!("wrong body type");
        };
        assert_eq!(resp.coordinator_id, 2);
        assert_eq!(resp.host, "coord.example");
    }

    #[test]
    fn join_group_response_with_zero_members_is_empty_list() {
        let mut buf = BytesMut::new();
        wire::put_i16(&mut buf, 0);
        wire::put_i32(&mut buf, 3); // generation
        wire::put_string(&mut buf, "group");
        wire::put_string(&mut buf, "leader-1");
        wire::put_string(&mut buf, "member-2");
        wire::put_i32(&mut buf, 0); // members: leader-only field, empty here
        let decoded = codec(ApiKey::JoinGroup, "0.10.1.0").decode_body(&buf).unwrap();
        let ResponseBody::JoinGroup(resp) = decoded else {
            panic!("wrong body type");
        };
        assert_eq!(resp.generation_id, 3);
        assert!(resp.members.is_empty());
    }

    #[test]
    fn list_offsets_v0_vs_v1_layout() {
        let request = RequestBody::ListOffsets(ListOffsetsRequest {
            topics: vec![ListOffsetsTopic {
                topic: "test".into(),
                partitions: vec![ListOffsetsPartition {
                    partition: 0,
                    timestamp: OFFSET_LATEST,
                    max_num_offsets: 1,
                }],
            }],
        });
        let v0 = codec(ApiKey::ListOffsets, "0.9.0.1").encode_body(&request).unwrap();
        let v1 = codec(ApiKey::ListOffsets, "0.10.1.0").encode_body(&request).unwrap();
        assert_eq!(v0.len(), v1.len() + 4, "v1 drops max_num_offsets");

        // v0 response: offsets list
        let mut buf = BytesMut::new();
        wire::put_i32(&mut buf, 1);
        wire::put_string(&mut buf, "test");
        wire::put_i32(&mut buf, 1);
        wire::put_i32(&mut buf, 0);
        wire::put_i16(&mut buf, 0);
        wire::put_i32(&mut buf, 2);
        wire::put_i64(&mut buf, 45);
        wire::put_i64(&mut buf, 0);
        let decoded = codec(ApiKey::ListOffsets, "0.9.0.1").decode_body(&buf).unwrap();
        let ResponseBody::ListOffsets(resp) = decoded else {
            panic!("wrong body type");
        };
        assert_eq!(resp.topics[0].partitions[0].offsets, vec![45, 0]);

        // v1 response: timestamp + single offset
        let mut buf = BytesMut::new();
        wire::put_i32(&mut buf, 1);
        wire::put_string(&mut buf, "test");
        wire::put_i32(&mut buf, 1);
        wire::put_i32(&mut buf, 0);
        wire::put_i16(&mut buf, 0);
        wire::put_i64(&mut buf, -1);
        wire::put_i64(&mut buf, 45);
        let decoded = codec(ApiKey::ListOffsets, "0.10.1.0").decode_body(&buf).unwrap();
        let ResponseBody::ListOffsets(resp) = decoded else {
            panic!("wrong body type");
        };
        assert_eq!(resp.topics[0].partitions[0].offsets, vec![45]);
        assert_eq!(resp.topics[0].partitions[0].timestamp, Some(-1));
    }

    #[test]
    fn offset_commit_v2_carries_group_fields() {
        let request = RequestBody::OffsetCommit(OffsetCommitRequest {
            group_id: "g".into(),
            generation_id: 5,
            member_id: "m".into(),
            retention_time_ms: -1,
            topics: vec![OffsetCommitTopic {
                topic: "test".into(),
                partitions: vec![OffsetCommitPartition {
                    partition: 0,
                    offset: 44,
                    metadata: String::new(),
                }],
            }],
        });
        let v0 = codec(ApiKey::OffsetCommit, "0.8.2.0").encode_body(&request).unwrap();
        let v2 = codec(ApiKey::OffsetCommit, "0.10.1.0").encode_body(&request).unwrap();
        // generation (4) + member string (2 + 1) + retention (8)
        assert_eq!(v2.len(), v0.len() + 15);
    }

    #[test]
    fn offset_fetch_response_roundtrip() {
        let mut buf = BytesMut::new();
        wire::put_i32(&mut buf, 1);
        wire::put_string(&mut buf, "test");
        wire::put_i32(&mut buf, 1);
        wire::put_i32(&mut buf, 0);
        wire::put_i64(&mut buf, -1); // nothing committed yet
        wire::put_string(&mut buf, "");
        wire::put_i16(&mut buf, 0);
        let decoded = codec(ApiKey::OffsetFetch, "0.10.1.0").decode_body(&buf).unwrap();
        let ResponseBody::OffsetFetch(resp) = decoded else {
            panic!("wrong body type");
        };
        assert_eq!(resp.topics[0].partitions[0].offset, -1);
    }

    #[test]
    fn sasl_handshake_response_lists_mechanisms() {
        let mut buf = BytesMut::new();
        wire::put_i16(&mut buf, 33);
        wire::put_i32(&mut buf, 2);
        wire::put_string(&mut buf, "PLAIN");
        wire::put_string(&mut buf, "SCRAM-SHA-256");
        let decoded = codec(ApiKey::SaslHandshake, "0.10.1.0").decode_body(&buf).unwrap();
        let ResponseBody::SaslHandshake(resp) = decoded else {
            panic!("wrong body type");
        };
        assert_eq!(resp.error_code, 33);
        assert_eq!(resp.mechanisms, vec!["PLAIN", "SCRAM-SHA-256"]);
    }

    #[test]
    fn api_versions_response_roundtrip() {
        let mut buf = BytesMut::new();
        wire::put_i16(&mut buf, 0);
        wire::put_i32(&mut buf, 2);
        wire::put_i16(&mut buf, 0);
        wire::put_i16(&mut buf, 0);
        wire::put_i16(&mut buf, 2);
        wire::put_i16(&mut buf, 3);
        wire::put_i16(&mut buf, 0);
        wire::put_i16(&mut buf, 1);
        let decoded = codec(ApiKey::ApiVersions, "0.10.1.0").decode_body(&buf).unwrap();
        let ResponseBody::ApiVersions(resp) = decoded else {
            panic!("wrong body type");
        };
        assert_eq!(resp.api_versions.len(), 2);
        assert_eq!(
            resp.api_versions[1],
            ApiVersionRange {
                api_key: 3,
                min_version: 0,
                max_version: 1
            }
        );
    }
}
