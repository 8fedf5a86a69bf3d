//! Consumer group state machine and the high-level consumer.
//!
//! The machine sequences metadata sync, coordinator discovery, group
//! membership (join/sync), and the heartbeat/offset/fetch/commit loops.
//! All machine state is owned by one driver task; I/O runs in short-lived
//! tasks that report back over a channel, so step handlers never race.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::BrokerDirectory;
use crate::config::{ConsumerConfig, DeliveryOrder, OffsetReset};
use crate::error::{describe_error, FranzError, KafkaCode};
use crate::metrics::ClientMetrics;
use crate::protocol::messages::{
    DescribeGroupsRequest, FetchPartition, FetchRequest, FetchTopic, GroupCoordinatorRequest,
    GroupDescription, HeartbeatRequest, JoinGroupMember, JoinGroupProtocol, JoinGroupRequest,
    JoinGroupResponse, LeaveGroupRequest, ListOffsetsPartition, ListOffsetsRequest,
    ListOffsetsResponse, ListOffsetsTopic, ListedGroup, MemberAssignment, MetadataRequest,
    OffsetCommitPartition, OffsetCommitRequest, OffsetCommitResponse, OffsetCommitTopic,
    OffsetFetchRequest, OffsetFetchResponse, OffsetFetchTopic, RequestBody, ResponseBody,
    Subscription, SyncGroupAssignment, SyncGroupRequest, SyncGroupResponse, OFFSET_LATEST,
};
use crate::protocol::registry::ApiRegistry;
use crate::protocol::ApiKey;
use crate::sasl::{SaslAuthenticator, SaslMechanism};
use crate::state::{ContextId, StepKind, StepSpec, StepTable};
use crate::transport::ConnectionPool;

/// Protocol type and assignment strategy announced during join.
const PROTOCOL_TYPE: &str = "consumer";
const ASSIGNMENT_STRATEGY: &str = "group";

/// A topic-partition pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

/// A record delivered to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Option<Bytes>,
    pub timestamp: i64,
}

/// The protocol steps of the consumer machine, in dispatch order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerStep {
    Metadata,
    GetCoordinator,
    JoinGroup,
    SyncGroup,
    Heartbeat,
    Offsets,
    FetchOffset,
    Fetch,
    CommitOffset,
}

impl ConsumerStep {
    pub const ALL: [ConsumerStep; 9] = [
        ConsumerStep::Metadata,
        ConsumerStep::GetCoordinator,
        ConsumerStep::JoinGroup,
        ConsumerStep::SyncGroup,
        ConsumerStep::Heartbeat,
        ConsumerStep::Offsets,
        ConsumerStep::FetchOffset,
        ConsumerStep::Fetch,
        ConsumerStep::CommitOffset,
    ];
}

fn consumer_steps() -> Vec<StepSpec<ConsumerStep>> {
    use ConsumerStep::*;
    vec![
        StepSpec {
            step: Metadata,
            kind: StepKind::Looping,
            prereqs: vec![],
            not_while_processing: None,
        },
        StepSpec {
            step: GetCoordinator,
            kind: StepKind::OneShot,
            prereqs: vec![Metadata],
            not_while_processing: None,
        },
        StepSpec {
            step: JoinGroup,
            kind: StepKind::OneShot,
            prereqs: vec![GetCoordinator],
            not_while_processing: None,
        },
        StepSpec {
            step: SyncGroup,
            kind: StepKind::OneShot,
            prereqs: vec![JoinGroup],
            not_while_processing: None,
        },
        StepSpec {
            step: Heartbeat,
            kind: StepKind::Looping,
            prereqs: vec![SyncGroup],
            not_while_processing: None,
        },
        StepSpec {
            step: Offsets,
            kind: StepKind::FanOut,
            prereqs: vec![SyncGroup],
            not_while_processing: None,
        },
        StepSpec {
            step: FetchOffset,
            kind: StepKind::Looping,
            prereqs: vec![SyncGroup, Offsets],
            not_while_processing: None,
        },
        StepSpec {
            step: Fetch,
            kind: StepKind::FanOut,
            prereqs: vec![FetchOffset],
            // fetch must not race an in-flight commit
            not_while_processing: Some(CommitOffset),
        },
        StepSpec {
            step: CommitOffset,
            kind: StepKind::Looping,
            prereqs: vec![FetchOffset],
            not_while_processing: None,
        },
    ]
}

/// Offset bookkeeping for one assigned partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetState {
    /// Latest available offset, from the offsets step
    pub high_watermark: i64,
    /// Earliest known retained offset
    pub earliest: i64,
    /// Last acknowledged commit; `-1` before the first commit
    pub committed: i64,
    /// Next offset to read
    pub consumer: i64,
    /// Offset captured before an in-flight commit; `-1` when idle
    pub precommit: i64,
}

impl Default for OffsetState {
    fn default() -> Self {
        Self {
            high_watermark: 0,
            earliest: 0,
            committed: -1,
            consumer: 0,
            precommit: -1,
        }
    }
}

/// What a broker error code means for the group machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// No error
    None,
    /// Topology or coordinator problem: restart from coordinator discovery
    Recover,
    /// Membership invalidated: rejoin the group
    Rejoin,
    /// Reposition the affected partition per the reset policy
    ResetOffset,
    /// Transient, logged and ignored for this call
    Ignore,
}

/// Classify a response error code.
pub fn classify(code: i16) -> ErrorAction {
    match KafkaCode::from_wire(code) {
        Some(KafkaCode::None) => ErrorAction::None,
        Some(
            KafkaCode::UnknownTopicOrPartition
            | KafkaCode::NotLeaderForPartition
            | KafkaCode::BrokerNotAvailable
            | KafkaCode::GroupLoadInProgress
            | KafkaCode::GroupCoordinatorNotAvailable
            | KafkaCode::NotCoordinatorForGroup
            | KafkaCode::InvalidTopic
            | KafkaCode::InconsistentGroupProtocol
            | KafkaCode::InvalidGroupId,
        ) => ErrorAction::Recover,
        Some(
            KafkaCode::IllegalGeneration
            | KafkaCode::InvalidSessionTimeout
            | KafkaCode::RebalanceInProgress
            | KafkaCode::UnknownMemberId,
        ) => ErrorAction::Rejoin,
        Some(KafkaCode::OffsetOutOfRange) => ErrorAction::ResetOffset,
        _ => ErrorAction::Ignore,
    }
}

#[derive(Debug, Clone)]
struct Coordinator {
    id: i32,
    addr: String,
}

/// Records produced by handling one fetch response.
#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Records ready for the application right now
    pub deliverable: Vec<ConsumeRecord>,
    /// Whether the whole fan-out drained with this response
    pub completed: bool,
}

/// The pure consumer-group state machine. All methods are synchronous;
/// the driver owns the instance and feeds it decoded responses.
pub struct GroupMachine {
    config: ConsumerConfig,
    pub(crate) steps: StepTable<ConsumerStep>,
    member_id: String,
    generation_id: i32,
    coordinator: Option<Coordinator>,
    assignment: Vec<(String, Vec<i32>)>,
    sync_plan: Vec<SyncGroupAssignment>,
    offsets: HashMap<TopicPartition, OffsetState>,
    pending_delivery: Vec<ConsumeRecord>,
}

impl GroupMachine {
    pub fn new(config: ConsumerConfig) -> Self {
        Self {
            config,
            steps: StepTable::new(consumer_steps()),
            member_id: String::new(),
            generation_id: -1,
            coordinator: None,
            assignment: Vec::new(),
            sync_plan: Vec::new(),
            offsets: HashMap::new(),
            pending_delivery: Vec::new(),
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    pub fn generation_id(&self) -> i32 {
        self.generation_id
    }

    pub fn coordinator_addr(&self) -> Option<String> {
        self.coordinator.as_ref().map(|c| c.addr.clone())
    }

    pub fn coordinator_id(&self) -> Option<i32> {
        self.coordinator.as_ref().map(|c| c.id)
    }

    pub fn assignment(&self) -> &[(String, Vec<i32>)] {
        &self.assignment
    }

    pub fn offset_state(&self, tp: &TopicPartition) -> Option<OffsetState> {
        self.offsets.get(tp).copied()
    }

    // ------------------------------------------------------------------
    // request builders
    // ------------------------------------------------------------------

    pub fn metadata_request(&self) -> MetadataRequest {
        MetadataRequest {
            topics: self.config.topics.clone(),
        }
    }

    pub fn coordinator_request(&self) -> GroupCoordinatorRequest {
        GroupCoordinatorRequest {
            group_id: self.config.group_id.clone(),
        }
    }

    pub fn join_request(&self) -> JoinGroupRequest {
        JoinGroupRequest {
            group_id: self.config.group_id.clone(),
            session_timeout_ms: self.config.session_timeout.as_millis() as i32,
            rebalance_timeout_ms: self.config.rebalance_timeout.as_millis() as i32,
            member_id: self.member_id.clone(),
            protocol_type: PROTOCOL_TYPE.to_string(),
            protocols: vec![JoinGroupProtocol {
                name: ASSIGNMENT_STRATEGY.to_string(),
                metadata: Subscription::new(self.config.topics.clone()).encode(),
            }],
        }
    }

    pub fn sync_request(&mut self) -> SyncGroupRequest {
        SyncGroupRequest {
            group_id: self.config.group_id.clone(),
            generation_id: self.generation_id,
            member_id: self.member_id.clone(),
            assignments: std::mem::take(&mut self.sync_plan),
        }
    }

    pub fn heartbeat_request(&self) -> HeartbeatRequest {
        HeartbeatRequest {
            group_id: self.config.group_id.clone(),
            generation_id: self.generation_id,
            member_id: self.member_id.clone(),
        }
    }

    pub fn leave_request(&self) -> Option<LeaveGroupRequest> {
        if self.member_id.is_empty() {
            return None;
        }
        Some(LeaveGroupRequest {
            group_id: self.config.group_id.clone(),
            member_id: self.member_id.clone(),
        })
    }

    /// One high-water offsets request per partition-leader broker.
    pub fn offsets_requests(
        &self,
        directory: &BrokerDirectory,
    ) -> Vec<(i32, ListOffsetsRequest)> {
        self.per_leader(directory, |partitions| ListOffsetsRequest {
            topics: partitions
                .chunk_by(|a, b| a.topic == b.topic)
                .map(|chunk| ListOffsetsTopic {
                    topic: chunk[0].topic.clone(),
                    partitions: chunk
                        .iter()
                        .map(|tp| ListOffsetsPartition {
                            partition: tp.partition,
                            timestamp: OFFSET_LATEST,
                            // the trailing entry of a multi-offset answer
                            // is the earliest retained offset
                            max_num_offsets: 2,
                        })
                        .collect(),
                })
                .collect(),
        })
    }

    pub fn fetch_offset_request(&self) -> OffsetFetchRequest {
        OffsetFetchRequest {
            group_id: self.config.group_id.clone(),
            topics: self
                .assignment
                .iter()
                .map(|(topic, partitions)| OffsetFetchTopic {
                    topic: topic.clone(),
                    partitions: partitions.clone(),
                })
                .collect(),
        }
    }

    /// One fetch request per partition-leader broker, positioned at each
    /// partition's consumer offset.
    pub fn fetch_requests(&self, directory: &BrokerDirectory) -> Vec<(i32, FetchRequest)> {
        let offsets = &self.offsets;
        let max_bytes = self.config.max_fetch_bytes;
        self.per_leader(directory, |partitions| FetchRequest {
            max_wait_ms: self.config.max_fetch_wait.as_millis() as i32,
            min_bytes: self.config.min_fetch_bytes,
            topics: partitions
                .chunk_by(|a, b| a.topic == b.topic)
                .map(|chunk| FetchTopic {
                    topic: chunk[0].topic.clone(),
                    partitions: chunk
                        .iter()
                        .map(|tp| FetchPartition {
                            partition: tp.partition,
                            fetch_offset: offsets
                                .get(tp)
                                .map(|o| o.consumer)
                                .unwrap_or_default(),
                            max_bytes,
                        })
                        .collect(),
                })
                .collect(),
        })
    }

    /// The offsets captured by the last fetch that still need committing.
    pub fn commit_request(&mut self) -> Option<OffsetCommitRequest> {
        let mut topics: HashMap<String, Vec<OffsetCommitPartition>> = HashMap::new();
        for (tp, state) in &self.offsets {
            if state.precommit >= 0 && state.precommit != state.committed {
                topics
                    .entry(tp.topic.clone())
                    .or_default()
                    .push(OffsetCommitPartition {
                        partition: tp.partition,
                        offset: state.precommit,
                        metadata: String::new(),
                    });
            }
        }
        if topics.is_empty() {
            return None;
        }
        Some(OffsetCommitRequest {
            group_id: self.config.group_id.clone(),
            generation_id: self.generation_id,
            member_id: self.member_id.clone(),
            retention_time_ms: -1,
            topics: topics
                .into_iter()
                .map(|(topic, partitions)| OffsetCommitTopic { topic, partitions })
                .collect(),
        })
    }

    fn per_leader<R>(
        &self,
        directory: &BrokerDirectory,
        mut build: impl FnMut(&[TopicPartition]) -> R,
    ) -> Vec<(i32, R)> {
        let pairs = self.assignment.iter().flat_map(|(topic, partitions)| {
            partitions.iter().map(move |p| (topic.clone(), *p))
        });
        let mut grouped: Vec<(i32, Vec<TopicPartition>)> = directory
            .group_by_leader(pairs)
            .into_iter()
            .map(|(leader, pairs)| {
                let mut tps: Vec<TopicPartition> = pairs
                    .into_iter()
                    .map(|(topic, partition)| TopicPartition::new(topic, partition))
                    .collect();
                tps.sort();
                (leader, tps)
            })
            .collect();
        grouped.sort_by_key(|(leader, _)| *leader);
        grouped
            .into_iter()
            .map(|(leader, tps)| (leader, build(&tps)))
            .collect()
    }

    // ------------------------------------------------------------------
    // response handlers
    // ------------------------------------------------------------------

    pub fn on_metadata(&mut self, topology_changed: bool) {
        self.steps.succeed(ConsumerStep::Metadata);
        if topology_changed {
            debug!("topology changed, recovering group state");
            self.recover();
        }
    }

    pub fn on_coordinator(
        &mut self,
        resp: &crate::protocol::messages::GroupCoordinatorResponse,
    ) {
        if resp.error_code != 0 {
            self.steps.fail(ConsumerStep::GetCoordinator);
            self.handle_error(resp.error_code, None);
            return;
        }
        self.coordinator = Some(Coordinator {
            id: resp.coordinator_id,
            addr: format!("{}:{}", resp.host, resp.port),
        });
        debug!(id = resp.coordinator_id, addr = %format!("{}:{}", resp.host, resp.port), "coordinator located");
        self.steps.succeed(ConsumerStep::GetCoordinator);
    }

    pub fn on_join(&mut self, resp: &JoinGroupResponse, directory: &BrokerDirectory) {
        if resp.error_code != 0 {
            self.steps.fail(ConsumerStep::JoinGroup);
            self.handle_error(resp.error_code, None);
            return;
        }
        self.member_id = resp.member_id.clone();
        self.generation_id = resp.generation_id;
        if resp.member_id == resp.leader_id {
            self.sync_plan = plan_assignments(&resp.members, directory);
            info!(
                generation = resp.generation_id,
                members = resp.members.len(),
                "joined as group leader"
            );
        } else {
            self.sync_plan.clear();
            info!(generation = resp.generation_id, "joined group");
        }
        self.steps.succeed(ConsumerStep::JoinGroup);
    }

    pub fn on_sync(&mut self, resp: &SyncGroupResponse) {
        if resp.error_code != 0 {
            self.steps.fail(ConsumerStep::SyncGroup);
            self.handle_error(resp.error_code, None);
            return;
        }
        match MemberAssignment::decode(&resp.assignment) {
            Ok(assignment) => {
                self.assignment = assignment.partitions;
                for (topic, partitions) in &self.assignment {
                    for partition in partitions {
                        self.offsets
                            .entry(TopicPartition::new(topic.clone(), *partition))
                            .or_default();
                    }
                }
                info!(topics = self.assignment.len(), "assignment received");
                self.steps.succeed(ConsumerStep::SyncGroup);
            }
            Err(err) => {
                // an empty assignment is legal when the group over-provisions
                if resp.assignment.is_empty() {
                    self.assignment.clear();
                    self.steps.succeed(ConsumerStep::SyncGroup);
                } else {
                    warn!(%err, "undecodable assignment");
                    self.steps.fail(ConsumerStep::SyncGroup);
                }
            }
        }
    }

    pub fn on_heartbeat(&mut self, error_code: i16) {
        if error_code != 0 {
            self.steps.fail(ConsumerStep::Heartbeat);
            self.handle_error(error_code, None);
            return;
        }
        self.steps.succeed(ConsumerStep::Heartbeat);
    }

    pub fn on_offsets(&mut self, ctx: ContextId, resp: &ListOffsetsResponse) -> bool {
        for topic in &resp.topics {
            for partition in &topic.partitions {
                let tp = TopicPartition::new(topic.topic.clone(), partition.partition);
                if partition.error_code != 0 {
                    self.handle_error(partition.error_code, Some(&tp));
                    continue;
                }
                let state = self.offsets.entry(tp).or_default();
                if let Some(latest) = partition.offsets.first() {
                    state.high_watermark = *latest;
                }
                if partition.offsets.len() > 1 {
                    if let Some(earliest) = partition.offsets.iter().min() {
                        state.earliest = *earliest;
                    }
                }
            }
        }
        self.steps.complete(ConsumerStep::Offsets, ctx)
    }

    pub fn on_fetch_offset(&mut self, resp: &OffsetFetchResponse) {
        for topic in &resp.topics {
            for partition in &topic.partitions {
                let tp = TopicPartition::new(topic.topic.clone(), partition.partition);
                if partition.error_code != 0 {
                    self.handle_error(partition.error_code, Some(&tp));
                    continue;
                }
                let reset = self.reset_target(&tp);
                let state = self.offsets.entry(tp).or_default();
                state.committed = partition.offset;
                state.consumer = if partition.offset >= 0 {
                    partition.offset + 1
                } else {
                    reset
                };
            }
        }
        self.steps.succeed(ConsumerStep::FetchOffset);
    }

    pub fn on_fetch(
        &mut self,
        ctx: ContextId,
        resp: &crate::protocol::messages::FetchResponse,
    ) -> FetchOutcome {
        let mut fetched = Vec::new();
        for topic in &resp.topics {
            for partition in &topic.partitions {
                let tp = TopicPartition::new(topic.topic.clone(), partition.partition);
                if partition.error_code != 0 {
                    self.handle_error(partition.error_code, Some(&tp));
                    continue;
                }
                let state = self.offsets.entry(tp.clone()).or_default();
                state.high_watermark = state.high_watermark.max(partition.high_watermark);
                let mut last_offset = None;
                for entry in &partition.entries {
                    // replays below the current position are skipped
                    if entry.offset < state.consumer {
                        continue;
                    }
                    last_offset = Some(entry.offset);
                    fetched.push(ConsumeRecord {
                        topic: tp.topic.clone(),
                        partition: tp.partition,
                        offset: entry.offset,
                        key: entry.message.key.clone(),
                        value: entry.message.value.clone(),
                        timestamp: entry.message.timestamp,
                    });
                }
                if let Some(last) = last_offset {
                    state.precommit = last;
                    state.consumer = last + 1;
                }
            }
        }

        let deliverable = match self.config.delivery_order {
            DeliveryOrder::DeliverThenCommit => fetched,
            DeliveryOrder::CommitThenDeliver => {
                self.pending_delivery.extend(fetched);
                Vec::new()
            }
        };
        let completed = self.steps.complete(ConsumerStep::Fetch, ctx);
        FetchOutcome {
            deliverable,
            completed,
        }
    }

    /// Returns records whose commit was confirmed and may now be delivered.
    pub fn on_commit(&mut self, resp: &OffsetCommitResponse) -> Vec<ConsumeRecord> {
        let mut failed = false;
        for topic in &resp.topics {
            for partition in &topic.partitions {
                let tp = TopicPartition::new(topic.topic.clone(), partition.partition);
                if partition.error_code != 0 {
                    failed = true;
                    self.handle_error(partition.error_code, Some(&tp));
                    continue;
                }
                if let Some(state) = self.offsets.get_mut(&tp) {
                    if state.precommit >= 0 {
                        state.committed = state.precommit;
                        state.precommit = -1;
                    }
                }
            }
        }
        self.steps.succeed(ConsumerStep::CommitOffset);
        if failed {
            // unconfirmed records stay parked until a later commit lands
            Vec::new()
        } else {
            std::mem::take(&mut self.pending_delivery)
        }
    }

    // ------------------------------------------------------------------
    // error handling and recovery
    // ------------------------------------------------------------------

    /// Route a broker error code through the classification table.
    pub fn handle_error(&mut self, code: i16, partition: Option<&TopicPartition>) {
        match classify(code) {
            ErrorAction::None => {}
            ErrorAction::Recover => {
                warn!(code, reason = %describe_error(code), "recoverable error");
                self.offsets.clear();
                self.recover();
            }
            ErrorAction::Rejoin => {
                warn!(code, reason = %describe_error(code), "membership invalidated");
                if KafkaCode::from_wire(code) == Some(KafkaCode::UnknownMemberId) {
                    self.member_id.clear();
                }
                self.offsets.clear();
                self.rejoin();
            }
            ErrorAction::ResetOffset => {
                if let Some(tp) = partition {
                    let target = self.reset_target(tp);
                    if let Some(state) = self.offsets.get_mut(tp) {
                        warn!(
                            topic = %tp.topic,
                            partition = tp.partition,
                            target,
                            "offset out of range, repositioning"
                        );
                        state.consumer = target;
                        state.precommit = -1;
                    }
                }
            }
            ErrorAction::Ignore => {
                warn!(code, reason = %describe_error(code), "ignoring transient error");
            }
        }
    }

    fn reset_target(&self, tp: &TopicPartition) -> i64 {
        let state = self.offsets.get(tp).copied().unwrap_or_default();
        match self.config.offset_reset {
            OffsetReset::Latest => state.high_watermark,
            OffsetReset::Earliest => state.earliest,
        }
    }

    /// Restart from coordinator discovery, keeping metadata state.
    pub fn recover(&mut self) {
        for step in ConsumerStep::ALL {
            if step != ConsumerStep::Metadata {
                self.steps.reset(step);
            }
        }
        self.assignment.clear();
        self.sync_plan.clear();
        self.pending_delivery.clear();
        self.coordinator = None;
        debug!("group state reset for recovery");
    }

    /// Restart from join, keeping the known coordinator. A no-op while a
    /// join is already in flight so rejoin storms collapse into one.
    pub fn rejoin(&mut self) {
        if self.steps.is_processing(ConsumerStep::JoinGroup) {
            debug!("join already in flight, skipping rejoin");
            return;
        }
        for step in [
            ConsumerStep::JoinGroup,
            ConsumerStep::SyncGroup,
            ConsumerStep::Heartbeat,
            ConsumerStep::Offsets,
            ConsumerStep::FetchOffset,
            ConsumerStep::Fetch,
            ConsumerStep::CommitOffset,
        ] {
            self.steps.reset(step);
        }
        self.assignment.clear();
        self.sync_plan.clear();
        self.pending_delivery.clear();
        debug!("rejoining group");
    }
}

/// Leader-side round-robin assignment: all partitions of all subscribed
/// topics dealt across members by `running_count % member_count`, grouped
/// by topic within each member's bucket.
fn plan_assignments(
    members: &[JoinGroupMember],
    directory: &BrokerDirectory,
) -> Vec<SyncGroupAssignment> {
    if members.is_empty() {
        return Vec::new();
    }
    let mut topics: Vec<String> = Vec::new();
    for member in members {
        match Subscription::decode(&member.metadata) {
            Ok(subscription) => {
                for topic in subscription.topics {
                    if !topics.contains(&topic) {
                        topics.push(topic);
                    }
                }
            }
            Err(err) => {
                warn!(member = %member.member_id, %err, "undecodable subscription");
            }
        }
    }
    topics.sort();

    let mut buckets: Vec<Vec<(String, i32)>> = vec![Vec::new(); members.len()];
    let mut running = 0usize;
    for topic in &topics {
        let Some(partitions) = directory.partitions(topic) else {
            warn!(%topic, "topic not in metadata, skipping assignment");
            continue;
        };
        for partition in partitions {
            buckets[running % members.len()].push((topic.clone(), partition));
            running += 1;
        }
    }

    members
        .iter()
        .zip(buckets)
        .map(|(member, bucket)| {
            let mut grouped: Vec<(String, Vec<i32>)> = Vec::new();
            for (topic, partition) in bucket {
                match grouped.iter_mut().find(|(t, _)| *t == topic) {
                    Some((_, partitions)) => partitions.push(partition),
                    None => grouped.push((topic, vec![partition])),
                }
            }
            SyncGroupAssignment {
                member_id: member.member_id.clone(),
                assignment: MemberAssignment {
                    version: 0,
                    partitions: grouped,
                    user_data: Bytes::new(),
                }
                .encode(),
            }
        })
        .collect()
}

// ======================================================================
// Async driver
// ======================================================================

enum StepEvent {
    Done {
        step: ConsumerStep,
        ctx: ContextId,
        result: Result<ResponseBody, FranzError>,
    },
}

/// High-level consumer: owns the connections, the registry and the driver
/// task that runs the group machine.
pub struct Consumer {
    config: ConsumerConfig,
    registry: Arc<ApiRegistry>,
    directory: Arc<BrokerDirectory>,
    metrics: Arc<ClientMetrics>,
    cancel: CancellationToken,
    records_rx: Option<mpsc::UnboundedReceiver<ConsumeRecord>>,
    records_tx: mpsc::UnboundedSender<ConsumeRecord>,
    driver: Option<JoinHandle<()>>,
}

impl Consumer {
    pub fn new(config: ConsumerConfig) -> Result<Self, FranzError> {
        Self::with_sasl(config, None)
    }

    pub fn with_sasl(
        config: ConsumerConfig,
        mechanism: Option<Arc<dyn SaslMechanism>>,
    ) -> Result<Self, FranzError> {
        config.validate()?;
        let registry = Arc::new(ApiRegistry::new(
            config.client.broker_version,
            config.client.client_id.clone(),
        ));
        let sasl = mechanism.map(|m| SaslAuthenticator::new(m, (*registry).clone()));
        let pool = Arc::new(ConnectionPool::new(
            config.client.connect_timeout,
            config.client.request_timeout,
            sasl,
        ));
        let directory = Arc::new(BrokerDirectory::new(config.client.brokers.clone(), pool));
        let (records_tx, records_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            registry,
            directory,
            metrics: Arc::new(ClientMetrics::default()),
            cancel: CancellationToken::new(),
            records_rx: Some(records_rx),
            records_tx,
            driver: None,
        })
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> {
        self.metrics.clone()
    }

    /// Take the record channel. Records arrive once `start` is called.
    pub fn records(&mut self) -> Option<mpsc::UnboundedReceiver<ConsumeRecord>> {
        self.records_rx.take()
    }

    /// Spawn the driver task.
    pub fn start(&mut self) {
        if self.driver.is_some() {
            return;
        }
        let driver = ConsumerDriver {
            machine: GroupMachine::new(self.config.clone()),
            config: self.config.clone(),
            registry: self.registry.clone(),
            directory: self.directory.clone(),
            metrics: self.metrics.clone(),
            records_tx: self.records_tx.clone(),
            cancel: self.cancel.clone(),
        };
        self.driver = Some(tokio::spawn(driver.run()));
    }

    /// Stop the driver, leave the group and tear down every connection.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
        self.directory.shutdown();
        info!("consumer shut down");
    }

    /// List all groups known to any reachable broker.
    pub async fn list_groups(&self) -> Result<Vec<ListedGroup>, FranzError> {
        let conn = self.directory.any_connection().await?;
        let response = conn
            .request(
                &self.registry,
                ApiKey::ListGroups,
                &RequestBody::ListGroups(Default::default()),
            )
            .await?;
        match response {
            ResponseBody::ListGroups(resp) if resp.error_code == 0 => Ok(resp.groups),
            ResponseBody::ListGroups(resp) => Err(FranzError::broker(resp.error_code)),
            _ => Err(FranzError::group("unexpected list-groups response")),
        }
    }

    /// Describe this consumer's group.
    pub async fn describe_group(&self) -> Result<Vec<GroupDescription>, FranzError> {
        let conn = self.directory.any_connection().await?;
        let response = conn
            .request(
                &self.registry,
                ApiKey::DescribeGroups,
                &RequestBody::DescribeGroups(DescribeGroupsRequest {
                    group_ids: vec![self.config.group_id.clone()],
                }),
            )
            .await?;
        match response {
            ResponseBody::DescribeGroups(resp) => Ok(resp.groups),
            _ => Err(FranzError::group("unexpected describe-groups response")),
        }
    }
}

struct ConsumerDriver {
    machine: GroupMachine,
    config: ConsumerConfig,
    registry: Arc<ApiRegistry>,
    directory: Arc<BrokerDirectory>,
    metrics: Arc<ClientMetrics>,
    records_tx: mpsc::UnboundedSender<ConsumeRecord>,
    cancel: CancellationToken,
}

impl ConsumerDriver {
    async fn run(mut self) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut tick = tokio::time::interval(Duration::from_millis(50));
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_run: HashMap<ConsumerStep, Instant> = HashMap::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                _ = tick.tick() => {
                    for step in ConsumerStep::ALL {
                        if self.due(step, &last_run) && self.machine.steps.check_run(step) {
                            last_run.insert(step, Instant::now());
                            self.dispatch(step, &event_tx);
                        }
                    }
                }

                Some(event) = event_rx.recv() => {
                    self.handle(event, &event_tx);
                }
            }
        }

        self.leave_group().await;
    }

    fn interval(&self, step: ConsumerStep) -> Duration {
        match step {
            ConsumerStep::Metadata => self.config.client.metadata_interval,
            ConsumerStep::Heartbeat => self.config.heartbeat_interval,
            ConsumerStep::Offsets => self.config.offset_interval,
            ConsumerStep::Fetch => self.config.fetch_interval,
            _ => Duration::ZERO,
        }
    }

    fn due(&self, step: ConsumerStep, last_run: &HashMap<ConsumerStep, Instant>) -> bool {
        match last_run.get(&step) {
            Some(at) => at.elapsed() >= self.interval(step),
            None => true,
        }
    }

    fn dispatch(&mut self, step: ConsumerStep, event_tx: &mpsc::UnboundedSender<StepEvent>) {
        match step {
            ConsumerStep::Metadata => {
                let body = RequestBody::Metadata(self.machine.metadata_request());
                self.machine.steps.begin(step);
                self.spawn_any(step, 0, ApiKey::Metadata, body, event_tx);
            }
            ConsumerStep::GetCoordinator => {
                let body = RequestBody::GroupCoordinator(self.machine.coordinator_request());
                self.machine.steps.begin(step);
                self.spawn_any(step, 0, ApiKey::GroupCoordinator, body, event_tx);
            }
            ConsumerStep::JoinGroup => {
                let body = RequestBody::JoinGroup(self.machine.join_request());
                self.spawn_coordinator(step, ApiKey::JoinGroup, body, event_tx);
            }
            ConsumerStep::SyncGroup => {
                let body = RequestBody::SyncGroup(self.machine.sync_request());
                self.spawn_coordinator(step, ApiKey::SyncGroup, body, event_tx);
            }
            ConsumerStep::Heartbeat => {
                let body = RequestBody::Heartbeat(self.machine.heartbeat_request());
                self.spawn_coordinator(step, ApiKey::Heartbeat, body, event_tx);
            }
            ConsumerStep::Offsets => {
                let requests = self.machine.offsets_requests(&self.directory);
                self.spawn_fan_out(
                    step,
                    ApiKey::ListOffsets,
                    requests
                        .into_iter()
                        .map(|(broker, r)| (broker, RequestBody::ListOffsets(r)))
                        .collect(),
                    event_tx,
                );
            }
            ConsumerStep::FetchOffset => {
                let body = RequestBody::OffsetFetch(self.machine.fetch_offset_request());
                self.spawn_coordinator(step, ApiKey::OffsetFetch, body, event_tx);
            }
            ConsumerStep::Fetch => {
                let requests = self.machine.fetch_requests(&self.directory);
                self.spawn_fan_out(
                    step,
                    ApiKey::Fetch,
                    requests
                        .into_iter()
                        .map(|(broker, r)| (broker, RequestBody::Fetch(r)))
                        .collect(),
                    event_tx,
                );
            }
            ConsumerStep::CommitOffset => {
                match self.machine.commit_request() {
                    Some(request) => {
                        let body = RequestBody::OffsetCommit(request);
                        self.spawn_coordinator(step, ApiKey::OffsetCommit, body, event_tx);
                    }
                    None => {
                        // nothing to commit this round
                        self.machine.steps.succeed(step);
                    }
                }
            }
        }
    }

    fn spawn_any(
        &self,
        step: ConsumerStep,
        ctx: ContextId,
        api: ApiKey,
        body: RequestBody,
        event_tx: &mpsc::UnboundedSender<StepEvent>,
    ) {
        let registry = self.registry.clone();
        let directory = self.directory.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let conn = directory.any_connection().await?;
                conn.request(&registry, api, &body).await
            }
            .await;
            let _ = event_tx.send(StepEvent::Done { step, ctx, result });
        });
    }

    fn spawn_coordinator(
        &mut self,
        step: ConsumerStep,
        api: ApiKey,
        body: RequestBody,
        event_tx: &mpsc::UnboundedSender<StepEvent>,
    ) {
        let Some(addr) = self.machine.coordinator_addr() else {
            warn!(?step, "no coordinator known");
            return;
        };
        self.machine.steps.begin(step);
        let registry = self.registry.clone();
        let directory = self.directory.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let conn = directory
                    .addr_connection(&addr)
                    .await
                    .ok_or(FranzError::NoBrokersAvailable)?;
                conn.request(&registry, api, &body).await
            }
            .await;
            let _ = event_tx.send(StepEvent::Done { step, ctx: 0, result });
        });
    }

    fn spawn_fan_out(
        &mut self,
        step: ConsumerStep,
        api: ApiKey,
        requests: Vec<(i32, RequestBody)>,
        event_tx: &mpsc::UnboundedSender<StepEvent>,
    ) {
        if requests.is_empty() {
            return;
        }
        self.machine
            .steps
            .begin_fan_out(step, requests.iter().map(|(broker, _)| *broker as ContextId));
        for (broker, body) in requests {
            let registry = self.registry.clone();
            let directory = self.directory.clone();
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                let result = async {
                    let conn = directory
                        .data_connection(broker)
                        .await
                        .ok_or(FranzError::NoBrokersAvailable)?;
                    conn.request(&registry, api, &body).await
                }
                .await;
                let _ = event_tx.send(StepEvent::Done {
                    step,
                    ctx: broker as ContextId,
                    result,
                });
            });
        }
    }

    fn handle(&mut self, event: StepEvent, event_tx: &mpsc::UnboundedSender<StepEvent>) {
        let StepEvent::Done { step, ctx, result } = event;
        let body = match result {
            Ok(body) => body,
            Err(err) => {
                // transport failures end this iteration; the step retries
                // on its next scheduled tick
                warn!(?step, %err, "step iteration failed");
                self.metrics.record_connection_error();
                self.machine.steps.fail(step);
                return;
            }
        };

        match (step, body) {
            (ConsumerStep::Metadata, ResponseBody::Metadata(resp)) => {
                let changed = self.directory.apply_metadata(&resp);
                self.machine.on_metadata(changed);
            }
            (ConsumerStep::GetCoordinator, ResponseBody::GroupCoordinator(resp)) => {
                self.machine.on_coordinator(&resp);
            }
            (ConsumerStep::JoinGroup, ResponseBody::JoinGroup(resp)) => {
                self.machine.on_join(&resp, &self.directory);
            }
            (ConsumerStep::SyncGroup, ResponseBody::SyncGroup(resp)) => {
                self.machine.on_sync(&resp);
            }
            (ConsumerStep::Heartbeat, ResponseBody::Heartbeat(resp)) => {
                self.machine.on_heartbeat(resp.error_code);
            }
            (ConsumerStep::Offsets, ResponseBody::ListOffsets(resp)) => {
                self.machine.on_offsets(ctx, &resp);
            }
            (ConsumerStep::FetchOffset, ResponseBody::OffsetFetch(resp)) => {
                self.machine.on_fetch_offset(&resp);
            }
            (ConsumerStep::Fetch, ResponseBody::Fetch(resp)) => {
                let outcome = self.machine.on_fetch(ctx, &resp);
                self.deliver(outcome.deliverable);
                if outcome.completed && self.machine.steps.check_run(ConsumerStep::CommitOffset) {
                    // pipeline the commit instead of waiting for a tick
                    self.dispatch(ConsumerStep::CommitOffset, event_tx);
                }
            }
            (ConsumerStep::CommitOffset, ResponseBody::OffsetCommit(resp)) => {
                let released = self.machine.on_commit(&resp);
                self.deliver(released);
            }
            (step, _) => {
                error!(?step, "mismatched response body");
                self.machine.steps.fail(step);
            }
        }
    }

    fn deliver(&self, records: Vec<ConsumeRecord>) {
        for record in records {
            let bytes = record.value.as_ref().map(|v| v.len()).unwrap_or(0) as u64;
            self.metrics.record_consume(1, bytes);
            if self.records_tx.send(record).is_err() {
                debug!("record receiver dropped");
                return;
            }
        }
    }

    async fn leave_group(&mut self) {
        let Some(request) = self.machine.leave_request() else {
            return;
        };
        let Some(addr) = self.machine.coordinator_addr() else {
            return;
        };
        if let Some(conn) = self.directory.addr_connection(&addr).await {
            let body = RequestBody::LeaveGroup(request);
            if let Err(err) = conn.request(&self.registry, ApiKey::LeaveGroup, &body).await {
                debug!(%err, "leave group failed");
            } else {
                info!("left consumer group");
            }
        }
    }
}

/// Builder for [`Consumer`], mirroring the config builder surface.
pub struct ConsumerBuilder {
    config: ConsumerConfig,
    sasl: Option<Arc<dyn SaslMechanism>>,
}

impl ConsumerBuilder {
    pub fn new() -> Self {
        Self {
            config: ConsumerConfig::default(),
            sasl: None,
        }
    }

    pub fn brokers<I, S>(mut self, brokers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.client.brokers = brokers.into_iter().map(Into::into).collect();
        self
    }

    pub fn client_id<S: Into<String>>(mut self, client_id: S) -> Self {
        self.config.client.client_id = client_id.into();
        self
    }

    pub fn broker_version(mut self, version: crate::config::BrokerVersion) -> Self {
        self.config.client.broker_version = version;
        self
    }

    pub fn group_id<S: Into<String>>(mut self, group_id: S) -> Self {
        self.config.group_id = group_id.into();
        self
    }

    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn session_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_timeout = timeout;
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.config.heartbeat_interval = interval;
        self
    }

    pub fn offset_reset(mut self, policy: OffsetReset) -> Self {
        self.config.offset_reset = policy;
        self
    }

    pub fn delivery_order(mut self, order: DeliveryOrder) -> Self {
        self.config.delivery_order = order;
        self
    }

    pub fn sasl(mut self, mechanism: Arc<dyn SaslMechanism>) -> Self {
        self.sasl = Some(mechanism);
        self
    }

    pub fn build(self) -> Result<Consumer, FranzError> {
        Consumer::with_sasl(self.config, self.sasl)
    }
}

impl Default for ConsumerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{
        BrokerMetadata, FetchPartitionResponse, FetchResponse, FetchTopicResponse,
        GroupCoordinatorResponse, ListOffsetsPartitionResponse, ListOffsetsTopicResponse,
        MetadataResponse, OffsetCommitPartitionResponse, OffsetCommitTopicResponse,
        OffsetFetchPartitionResponse, OffsetFetchTopicResponse, PartitionMetadata, TopicMetadata,
    };
    use crate::protocol::message::{Message, MessageSetEntry};
    use crate::state::Status;

    fn config() -> ConsumerConfig {
        let mut config = ConsumerConfig::default();
        config.group_id = "test-group".into();
        config.topics = vec!["test".into()];
        config
    }

    fn machine() -> GroupMachine {
        GroupMachine::new(config())
    }

    fn directory_with_test_topic(partitions: i32) -> BrokerDirectory {
        let pool = Arc::new(ConnectionPool::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            None,
        ));
        let directory = BrokerDirectory::new(vec!["localhost:9092".into()], pool);
        directory.apply_metadata(&MetadataResponse {
            brokers: vec![BrokerMetadata {
                node_id: 0,
                host: "a".into(),
                port: 9092,
            }],
            topics: vec![TopicMetadata {
                error_code: 0,
                topic: "test".into(),
                partitions: (0..partitions)
                    .map(|p| PartitionMetadata {
                        error_code: 0,
                        partition: p,
                        leader: 0,
                        replicas: vec![0],
                        isr: vec![0],
                    })
                    .collect(),
            }],
        });
        directory
    }

    /// Walk the machine to the post-sync steady state.
    fn joined_machine() -> GroupMachine {
        let mut m = machine();
        let directory = directory_with_test_topic(2);
        m.on_metadata(true); // first sync always "changes"
        m.on_metadata(false);
        m.on_coordinator(&GroupCoordinatorResponse {
            error_code: 0,
            coordinator_id: 0,
            host: "a".into(),
            port: 9092,
        });
        m.steps.begin(ConsumerStep::JoinGroup);
        m.on_join(
            &JoinGroupResponse {
                error_code: 0,
                generation_id: 1,
                protocol_name: "group".into(),
                leader_id: "member-1".into(),
                member_id: "member-1".into(),
                members: vec![JoinGroupMember {
                    member_id: "member-1".into(),
                    metadata: Subscription::new(vec!["test".into()]).encode(),
                }],
            },
            &directory,
        );
        m.steps.begin(ConsumerStep::SyncGroup);
        let plan = m.sync_request();
        m.on_sync(&SyncGroupResponse {
            error_code: 0,
            assignment: plan.assignments[0].assignment.clone(),
        });
        m
    }

    #[test]
    fn dependency_chain_is_enforced() {
        let mut m = machine();
        assert!(m.steps.check_run(ConsumerStep::Metadata));
        assert!(!m.steps.check_run(ConsumerStep::GetCoordinator));
        assert!(!m.steps.check_run(ConsumerStep::JoinGroup));

        m.on_metadata(false);
        assert!(m.steps.check_run(ConsumerStep::GetCoordinator));
        assert!(!m.steps.check_run(ConsumerStep::JoinGroup));

        m.on_coordinator(&GroupCoordinatorResponse {
            error_code: 0,
            coordinator_id: 0,
            host: "a".into(),
            port: 9092,
        });
        assert!(m.steps.check_run(ConsumerStep::JoinGroup));
        assert!(!m.steps.check_run(ConsumerStep::Heartbeat), "needs sync");
    }

    #[test]
    fn one_shots_do_not_refire_after_finish() {
        let m = joined_machine();
        assert!(!m.steps.check_run(ConsumerStep::GetCoordinator));
        assert!(!m.steps.check_run(ConsumerStep::JoinGroup));
        assert!(!m.steps.check_run(ConsumerStep::SyncGroup));
        assert!(m.steps.check_run(ConsumerStep::Heartbeat));
        assert!(m.steps.check_run(ConsumerStep::Offsets));
    }

    #[test]
    fn fetch_gated_on_in_flight_commit() {
        let mut m = joined_machine();
        m.steps.succeed(ConsumerStep::Offsets);
        m.steps.succeed(ConsumerStep::FetchOffset);
        assert!(m.steps.check_run(ConsumerStep::Fetch));
        m.steps.begin(ConsumerStep::CommitOffset);
        assert!(!m.steps.check_run(ConsumerStep::Fetch));
        m.steps.succeed(ConsumerStep::CommitOffset);
        assert!(m.steps.check_run(ConsumerStep::Fetch));
    }

    #[test]
    fn leader_plans_round_robin_assignment() {
        let directory = directory_with_test_topic(5);
        let members = vec![
            JoinGroupMember {
                member_id: "m0".into(),
                metadata: Subscription::new(vec!["test".into()]).encode(),
            },
            JoinGroupMember {
                member_id: "m1".into(),
                metadata: Subscription::new(vec!["test".into()]).encode(),
            },
        ];
        let plan = plan_assignments(&members, &directory);
        assert_eq!(plan.len(), 2);
        let a0 = MemberAssignment::decode(&plan[0].assignment).unwrap();
        let a1 = MemberAssignment::decode(&plan[1].assignment).unwrap();
        // running_count % member_count deals partitions alternately
        assert_eq!(a0.partitions, vec![("test".to_string(), vec![0, 2, 4])]);
        assert_eq!(a1.partitions, vec![("test".to_string(), vec![1, 3])]);
    }

    #[test]
    fn fetch_then_commit_offset_arithmetic() {
        let mut m = joined_machine();
        m.steps.succeed(ConsumerStep::Offsets);
        m.steps.succeed(ConsumerStep::FetchOffset);

        let tp = TopicPartition::new("test", 0);
        m.steps.begin_fan_out(ConsumerStep::Fetch, [0]);
        let outcome = m.on_fetch(
            0,
            &FetchResponse {
                throttle_time_ms: None,
                topics: vec![FetchTopicResponse {
                    topic: "test".into(),
                    partitions: vec![FetchPartitionResponse {
                        partition: 0,
                        error_code: 0,
                        high_watermark: 45,
                        entries: (43..=44)
                            .map(|offset| MessageSetEntry {
                                offset,
                                message: Message::new(format!("m{offset}")),
                            })
                            .collect(),
                    }],
                }],
            },
        );
        assert!(outcome.completed);

        let state = m.offset_state(&tp).unwrap();
        assert_eq!(state.consumer, 45, "next read position");
        assert_eq!(state.precommit, 44, "captured for the commit round");

        let commit = m.commit_request().unwrap();
        assert_eq!(commit.topics[0].partitions[0].offset, 44);

        m.steps.begin(ConsumerStep::CommitOffset);
        m.on_commit(&OffsetCommitResponse {
            topics: vec![OffsetCommitTopicResponse {
                topic: "test".into(),
                partitions: vec![OffsetCommitPartitionResponse {
                    partition: 0,
                    error_code: 0,
                }],
            }],
        });
        let state = m.offset_state(&tp).unwrap();
        assert_eq!(state.committed, 44);
        assert_eq!(state.consumer, state.committed + 1);
    }

    #[test]
    fn empty_fetch_does_not_regress_offsets() {
        let mut m = joined_machine();
        let tp = TopicPartition::new("test", 0);
        m.steps.begin_fan_out(ConsumerStep::Fetch, [0]);
        m.on_fetch(
            0,
            &FetchResponse {
                throttle_time_ms: None,
                topics: vec![FetchTopicResponse {
                    topic: "test".into(),
                    partitions: vec![FetchPartitionResponse {
                        partition: 0,
                        error_code: 0,
                        high_watermark: 45,
                        entries: vec![],
                    }],
                }],
            },
        );
        let state = m.offset_state(&tp).unwrap();
        assert_eq!(state.consumer, 0);
        assert_eq!(state.precommit, -1);
        assert!(m.commit_request().is_none(), "nothing to commit");
    }

    #[test]
    fn recoverable_error_resets_all_but_metadata() {
        let mut m = joined_machine();
        let metadata_before = m.steps.status(ConsumerStep::Metadata);

        // NOT_LEADER_FOR_PARTITION
        m.handle_error(6, None);

        assert_eq!(m.steps.status(ConsumerStep::Metadata), metadata_before);
        assert_eq!(m.steps.status(ConsumerStep::GetCoordinator), Status::INIT);
        assert_eq!(m.steps.status(ConsumerStep::JoinGroup), Status::INIT);
        assert_eq!(m.steps.status(ConsumerStep::SyncGroup), Status::INIT);
        assert!(m.assignment().is_empty());
    }

    #[test]
    fn unknown_member_clears_id_and_rejoins() {
        let mut m = joined_machine();
        assert_eq!(m.member_id(), "member-1");
        let coordinator_before = m.steps.status(ConsumerStep::GetCoordinator);

        // UNKNOWN_MEMBER_ID
        m.handle_error(25, None);

        assert!(m.member_id().is_empty());
        assert_eq!(
            m.steps.status(ConsumerStep::GetCoordinator),
            coordinator_before,
            "rejoin keeps the coordinator"
        );
        assert_eq!(m.steps.status(ConsumerStep::JoinGroup), Status::INIT);
    }

    #[test]
    fn rejoin_is_noop_while_join_in_flight() {
        let mut m = joined_machine();
        m.steps.reset(ConsumerStep::JoinGroup);
        m.steps.begin(ConsumerStep::JoinGroup);
        let sync_before = m.steps.status(ConsumerStep::SyncGroup);
        m.rejoin();
        assert_eq!(m.steps.status(ConsumerStep::SyncGroup), sync_before);
        assert!(m.steps.is_processing(ConsumerStep::JoinGroup));
    }

    #[test]
    fn offset_out_of_range_resets_by_policy() {
        let mut m = joined_machine();
        let tp = TopicPartition::new("test", 0);
        m.steps.begin_fan_out(ConsumerStep::Offsets, [0]);
        m.on_offsets(
            0,
            &ListOffsetsResponse {
                topics: vec![ListOffsetsTopicResponse {
                    topic: "test".into(),
                    partitions: vec![ListOffsetsPartitionResponse {
                        partition: 0,
                        error_code: 0,
                        offsets: vec![90, 10],
                        timestamp: None,
                    }],
                }],
            },
        );
        let state = m.offset_state(&tp).unwrap();
        assert_eq!(state.high_watermark, 90);
        assert_eq!(state.earliest, 10);

        // latest policy (default)
        m.handle_error(1, Some(&tp));
        assert_eq!(m.offset_state(&tp).unwrap().consumer, 90);

        let mut earliest_config = config();
        earliest_config.offset_reset = OffsetReset::Earliest;
        let mut m2 = GroupMachine::new(earliest_config);
        m2.offsets.insert(
            tp.clone(),
            OffsetState {
                high_watermark: 90,
                earliest: 10,
                committed: -1,
                consumer: 100,
                precommit: -1,
            },
        );
        m2.handle_error(1, Some(&tp));
        assert_eq!(m2.offset_state(&tp).unwrap().consumer, 10);
    }

    #[test]
    fn topology_change_triggers_recovery() {
        let mut m = joined_machine();
        assert!(!m.assignment().is_empty());
        m.on_metadata(true);
        assert!(m.assignment().is_empty());
        assert_eq!(m.steps.status(ConsumerStep::JoinGroup), Status::INIT);
        assert!(
            m.steps.has_finished(ConsumerStep::Metadata),
            "metadata keeps its own status"
        );
    }

    #[test]
    fn committed_offset_resume_and_reset_fallback() {
        let mut m = joined_machine();
        m.steps.succeed(ConsumerStep::Offsets);
        let tp0 = TopicPartition::new("test", 0);
        let tp1 = TopicPartition::new("test", 1);
        m.offsets.get_mut(&tp1).unwrap().high_watermark = 30;

        m.steps.begin(ConsumerStep::FetchOffset);
        m.on_fetch_offset(&OffsetFetchResponse {
            topics: vec![OffsetFetchTopicResponse {
                topic: "test".into(),
                partitions: vec![
                    OffsetFetchPartitionResponse {
                        partition: 0,
                        offset: 41,
                        metadata: String::new(),
                        error_code: 0,
                    },
                    OffsetFetchPartitionResponse {
                        partition: 1,
                        offset: -1, // nothing committed yet
                        metadata: String::new(),
                        error_code: 0,
                    },
                ],
            }],
        });
        assert_eq!(m.offset_state(&tp0).unwrap().consumer, 42);
        assert_eq!(
            m.offset_state(&tp1).unwrap().consumer,
            30,
            "latest policy starts at the high-water mark"
        );
    }

    #[test]
    fn commit_then_deliver_parks_records_until_ack() {
        let mut m = joined_machine(); // default order commits first
        m.steps.begin_fan_out(ConsumerStep::Fetch, [0]);
        let outcome = m.on_fetch(
            0,
            &FetchResponse {
                throttle_time_ms: None,
                topics: vec![FetchTopicResponse {
                    topic: "test".into(),
                    partitions: vec![FetchPartitionResponse {
                        partition: 0,
                        error_code: 0,
                        high_watermark: 1,
                        entries: vec![MessageSetEntry {
                            offset: 0,
                            message: Message::new("first"),
                        }],
                    }],
                }],
            },
        );
        assert!(outcome.deliverable.is_empty(), "parked until commit ack");

        m.steps.begin(ConsumerStep::CommitOffset);
        let released = m.on_commit(&OffsetCommitResponse {
            topics: vec![OffsetCommitTopicResponse {
                topic: "test".into(),
                partitions: vec![OffsetCommitPartitionResponse {
                    partition: 0,
                    error_code: 0,
                }],
            }],
        });
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].value, Some(Bytes::from_static(b"first")));
    }

    #[test]
    fn deliver_then_commit_hands_records_out_immediately() {
        let mut cfg = config();
        cfg.delivery_order = DeliveryOrder::DeliverThenCommit;
        let mut m = GroupMachine::new(cfg);
        m.offsets.insert(TopicPartition::new("test", 0), OffsetState::default());
        m.steps.begin_fan_out(ConsumerStep::Fetch, [0]);
        let outcome = m.on_fetch(
            0,
            &FetchResponse {
                throttle_time_ms: None,
                topics: vec![FetchTopicResponse {
                    topic: "test".into(),
                    partitions: vec![FetchPartitionResponse {
                        partition: 0,
                        error_code: 0,
                        high_watermark: 1,
                        entries: vec![MessageSetEntry {
                            offset: 0,
                            message: Message::new("now"),
                        }],
                    }],
                }],
            },
        );
        assert_eq!(outcome.deliverable.len(), 1);
    }

    #[test]
    fn multi_context_offsets_step_finishes_when_drained() {
        let mut m = joined_machine();
        m.steps.begin_fan_out(ConsumerStep::Offsets, [0, 1]);
        let empty = ListOffsetsResponse { topics: vec![] };
        assert!(!m.on_offsets(0, &empty));
        assert!(!m.steps.has_finished(ConsumerStep::Offsets));
        assert!(m.on_offsets(1, &empty));
        assert!(m.steps.has_finished(ConsumerStep::Offsets));
    }
}
