//! Producer state machine and the high-level producer.
//!
//! Routing resolves each record's partition against the broker directory
//! (caller-chosen when valid, uniformly random otherwise), groups records
//! by the partition leader's broker id and batches same-topic-same-partition
//! records into one request per broker. Records with a blank topic or value,
//! or an unknown topic, are dropped before batching; callers needing strict
//! accounting must validate up front.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::BrokerDirectory;
use crate::config::{Compression, ProducerConfig};
use crate::consumer::{classify, ErrorAction};
use crate::error::{describe_error, FranzError};
use crate::metrics::ClientMetrics;
use crate::protocol::message::Message;
use crate::protocol::messages::{
    MetadataRequest, ProducePartition, ProduceRequest, ProduceResponse, ProduceTopic, RequestBody,
    ResponseBody,
};
use crate::protocol::registry::ApiRegistry;
use crate::protocol::ApiKey;
use crate::sasl::{SaslAuthenticator, SaslMechanism};
use crate::state::{ContextId, StepKind, StepSpec, StepTable};
use crate::transport::ConnectionPool;

/// A record to produce.
#[derive(Debug, Clone)]
pub struct ProduceRecord {
    pub topic: String,
    /// Preferred partition; falls back to a random live partition when
    /// absent or invalid
    pub partition: Option<i32>,
    pub key: Option<Bytes>,
    pub value: Bytes,
    pub timestamp: i64,
}

impl ProduceRecord {
    pub fn new<T: Into<String>, V: Into<Bytes>>(topic: T, value: V) -> Self {
        Self {
            topic: topic.into(),
            partition: None,
            key: None,
            value: value.into(),
            timestamp: -1,
        }
    }

    pub fn with_key<K: Into<Bytes>>(mut self, key: K) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_partition(mut self, partition: i32) -> Self {
        self.partition = Some(partition);
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Where an acknowledged record landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProduceMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// The protocol steps of the producer machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProducerStep {
    Metadata,
    Produce,
}

fn producer_steps() -> Vec<StepSpec<ProducerStep>> {
    vec![
        StepSpec {
            step: ProducerStep::Metadata,
            kind: StepKind::Looping,
            prereqs: vec![],
            not_while_processing: None,
        },
        StepSpec {
            step: ProducerStep::Produce,
            kind: StepKind::FanOut,
            prereqs: vec![ProducerStep::Metadata],
            not_while_processing: None,
        },
    ]
}

/// Resolve partitions and group records into one produce request per
/// leader broker. Invalid records are silently dropped.
pub(crate) fn route_records(
    records: Vec<ProduceRecord>,
    directory: &BrokerDirectory,
    config: &ProducerConfig,
) -> Vec<(i32, ProduceRequest)> {
    // broker -> topic -> partition -> messages
    let mut routed: HashMap<i32, HashMap<String, HashMap<i32, Vec<Message>>>> = HashMap::new();
    let mut rng = rand::thread_rng();

    for record in records {
        if record.topic.is_empty() || record.value.is_empty() {
            debug!("dropping record with blank topic or value");
            continue;
        }
        let Some(partitions) = directory.partitions(&record.topic) else {
            debug!(topic = %record.topic, "dropping record for unknown topic");
            continue;
        };
        let partition = match record.partition {
            Some(p) if partitions.contains(&p) => p,
            _ => match partitions.choose(&mut rng) {
                Some(p) => *p,
                None => continue,
            },
        };
        let Some(leader) = directory.leader(&record.topic, partition) else {
            debug!(topic = %record.topic, partition, "dropping record with no leader");
            continue;
        };
        routed
            .entry(leader)
            .or_default()
            .entry(record.topic)
            .or_default()
            .entry(partition)
            .or_default()
            .push(Message {
                key: record.key,
                value: Some(record.value),
                timestamp: record.timestamp,
            });
    }

    let mut requests: Vec<(i32, ProduceRequest)> = routed
        .into_iter()
        .map(|(broker, topics)| {
            let topics = topics
                .into_iter()
                .map(|(topic, partitions)| ProduceTopic {
                    topic,
                    partitions: partitions
                        .into_iter()
                        .map(|(partition, messages)| ProducePartition {
                            partition,
                            messages,
                        })
                        .collect(),
                })
                .collect();
            (
                broker,
                ProduceRequest {
                    required_acks: config.required_acks,
                    ack_timeout_ms: config.ack_timeout.as_millis() as i32,
                    compression: config.compression,
                    topics,
                },
            )
        })
        .collect();
    requests.sort_by_key(|(broker, _)| *broker);
    requests
}

/// The pure producer state machine.
pub struct ProducerMachine {
    pub(crate) steps: StepTable<ProducerStep>,
}

impl ProducerMachine {
    pub fn new() -> Self {
        Self {
            steps: StepTable::new(producer_steps()),
        }
    }

    pub fn on_metadata(&mut self, topology_changed: bool) {
        self.steps.succeed(ProducerStep::Metadata);
        if topology_changed {
            debug!("topology changed, partition routing will be recomputed");
        }
    }

    /// Handle one broker's produce response; returns acknowledgements.
    pub fn on_produce(&mut self, ctx: ContextId, resp: &ProduceResponse) -> Vec<ProduceMetadata> {
        let mut acked = Vec::new();
        for topic in &resp.topics {
            for partition in &topic.partitions {
                if partition.error_code != 0 {
                    warn!(
                        topic = %topic.topic,
                        partition = partition.partition,
                        reason = %describe_error(partition.error_code),
                        "produce failed"
                    );
                    if classify(partition.error_code) == ErrorAction::Recover {
                        // stale leadership: force a metadata refresh before
                        // the next produce round
                        self.steps.reset(ProducerStep::Metadata);
                    }
                    continue;
                }
                acked.push(ProduceMetadata {
                    topic: topic.topic.clone(),
                    partition: partition.partition,
                    offset: partition.base_offset,
                });
            }
        }
        self.steps.complete(ProducerStep::Produce, ctx);
        acked
    }
}

impl Default for ProducerMachine {
    fn default() -> Self {
        Self::new()
    }
}

// ======================================================================
// High-level producer
// ======================================================================

/// High-level producer client.
pub struct Producer {
    config: ProducerConfig,
    registry: Arc<ApiRegistry>,
    directory: Arc<BrokerDirectory>,
    metrics: Arc<ClientMetrics>,
    cancel: CancellationToken,
    queue_tx: mpsc::UnboundedSender<ProduceRecord>,
    queue_rx: Option<mpsc::UnboundedReceiver<ProduceRecord>>,
    driver: Option<JoinHandle<()>>,
}

impl Producer {
    pub fn new(config: ProducerConfig) -> Result<Self, FranzError> {
        Self::with_sasl(config, None)
    }

    pub fn with_sasl(
        config: ProducerConfig,
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
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            registry,
            directory,
            metrics: Arc::new(ClientMetrics::default()),
            cancel: CancellationToken::new(),
            queue_tx,
            queue_rx: Some(queue_rx),
            driver: None,
        })
    }

    pub fn metrics(&self) -> Arc<ClientMetrics> {
        self.metrics.clone()
    }

    /// Send one record synchronously and await its acknowledgement.
    pub async fn send(&self, record: ProduceRecord) -> Result<Vec<ProduceMetadata>, FranzError> {
        self.send_batch(vec![record]).await
    }

    /// Send a batch synchronously: one produce request per leader broker,
    /// awaited inline. With required acks 0 the broker sends no response
    /// and the returned list is empty.
    pub async fn send_batch(
        &self,
        records: Vec<ProduceRecord>,
    ) -> Result<Vec<ProduceMetadata>, FranzError> {
        if records.is_empty() {
            return Ok(Vec::new());
        }
        self.ensure_metadata(&records).await?;
        let routed = route_records(records, &self.directory, &self.config);

        let mut acked = Vec::new();
        for (broker, request) in routed {
            let conn = self
                .directory
                .data_connection(broker)
                .await
                .ok_or(FranzError::NoBrokersAvailable)?;
            let records_sent: u64 = request
                .topics
                .iter()
                .flat_map(|t| &t.partitions)
                .map(|p| p.messages.len() as u64)
                .sum();
            let bytes_sent: u64 = request
                .topics
                .iter()
                .flat_map(|t| &t.partitions)
                .flat_map(|p| &p.messages)
                .map(|m| m.value.as_ref().map(|v| v.len()).unwrap_or(0) as u64)
                .sum();
            let body = RequestBody::Produce(request);

            if self.config.required_acks == 0 {
                conn.send_no_reply(&self.registry, ApiKey::Produce, &body)?;
                self.metrics.record_send(records_sent, bytes_sent);
                continue;
            }

            let response = conn.request(&self.registry, ApiKey::Produce, &body).await?;
            let ResponseBody::Produce(resp) = response else {
                return Err(FranzError::producer("unexpected produce response"));
            };
            self.metrics.record_send(records_sent, bytes_sent);
            for topic in resp.topics {
                for partition in topic.partitions {
                    if partition.error_code != 0 {
                        self.metrics.record_send_error();
                        return Err(FranzError::broker(partition.error_code));
                    }
                    acked.push(ProduceMetadata {
                        topic: topic.topic.clone(),
                        partition: partition.partition,
                        offset: partition.base_offset,
                    });
                }
            }
        }
        Ok(acked)
    }

    /// Queue a record for the asynchronous produce loop.
    pub fn enqueue(&self, record: ProduceRecord) -> Result<(), FranzError> {
        self.queue_tx
            .send(record)
            .map_err(|_| FranzError::producer("producer is shut down"))
    }

    /// Spawn the asynchronous driver: metadata refresh plus a produce loop
    /// that drains the queue on every due tick.
    pub fn start(&mut self) {
        if self.driver.is_some() {
            return;
        }
        let Some(queue_rx) = self.queue_rx.take() else {
            return;
        };
        let driver = ProducerDriver {
            machine: ProducerMachine::new(),
            config: self.config.clone(),
            registry: self.registry.clone(),
            directory: self.directory.clone(),
            metrics: self.metrics.clone(),
            queue_rx,
            backlog: Vec::new(),
            cancel: self.cancel.clone(),
        };
        self.driver = Some(tokio::spawn(driver.run()));
    }

    /// Stop the driver and tear down every connection. Queued but unsent
    /// records are abandoned.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
        self.directory.shutdown();
        info!("producer shut down");
    }

    /// Make sure every referenced topic is in the directory, refreshing
    /// metadata once for the missing set.
    async fn ensure_metadata(&self, records: &[ProduceRecord]) -> Result<(), FranzError> {
        let mut missing: Vec<String> = records
            .iter()
            .filter(|r| !r.topic.is_empty())
            .filter(|r| self.directory.partitions(&r.topic).is_none())
            .map(|r| r.topic.clone())
            .collect();
        missing.sort();
        missing.dedup();
        if missing.is_empty() {
            return Ok(());
        }

        let conn = self.directory.any_connection().await?;
        let body = RequestBody::Metadata(MetadataRequest { topics: missing });
        let response = conn.request(&self.registry, ApiKey::Metadata, &body).await?;
        let ResponseBody::Metadata(resp) = response else {
            return Err(FranzError::producer("unexpected metadata response"));
        };
        self.directory.apply_metadata(&resp);
        Ok(())
    }
}

enum ProducerEvent {
    Done {
        step: ProducerStep,
        ctx: ContextId,
        result: Result<ResponseBody, FranzError>,
    },
}

struct ProducerDriver {
    machine: ProducerMachine,
    config: ProducerConfig,
    registry: Arc<ApiRegistry>,
    directory: Arc<BrokerDirectory>,
    metrics: Arc<ClientMetrics>,
    queue_rx: mpsc::UnboundedReceiver<ProduceRecord>,
    backlog: Vec<ProduceRecord>,
    cancel: CancellationToken,
}

impl ProducerDriver {
    async fn run(mut self) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let mut tick = tokio::time::interval(self.config.produce_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut metadata_tick = tokio::time::interval(self.config.client.metadata_interval);
        metadata_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(record) = self.queue_rx.recv() => {
                    self.backlog.push(record);
                }

                _ = metadata_tick.tick() => {
                    if self.machine.steps.check_run(ProducerStep::Metadata) {
                        self.dispatch_metadata(&event_tx);
                    }
                }

                _ = tick.tick() => {
                    if !self.backlog.is_empty()
                        && self.machine.steps.check_run(ProducerStep::Produce)
                    {
                        self.dispatch_produce(&event_tx);
                    }
                }

                Some(event) = event_rx.recv() => {
                    self.handle(event);
                }
            }
        }
    }

    fn dispatch_metadata(&mut self, event_tx: &mpsc::UnboundedSender<ProducerEvent>) {
        self.machine.steps.begin(ProducerStep::Metadata);
        let topics: Vec<String> = self.directory.topic_names();
        let body = RequestBody::Metadata(MetadataRequest { topics });
        let registry = self.registry.clone();
        let directory = self.directory.clone();
        let event_tx = event_tx.clone();
        tokio::spawn(async move {
            let result = async {
                let conn = directory.any_connection().await?;
                conn.request(&registry, ApiKey::Metadata, &body).await
            }
            .await;
            let _ = event_tx.send(ProducerEvent::Done {
                step: ProducerStep::Metadata,
                ctx: 0,
                result,
            });
        });
    }

    fn dispatch_produce(&mut self, event_tx: &mpsc::UnboundedSender<ProducerEvent>) {
        let records = std::mem::take(&mut self.backlog);
        let routed = route_records(records, &self.directory, &self.config);
        if routed.is_empty() {
            return;
        }

        if self.config.required_acks == 0 {
            // fire-and-forget: the broker sends nothing back, the step
            // finishes on write
            self.machine.steps.begin(ProducerStep::Produce);
            for (broker, request) in routed {
                let body = RequestBody::Produce(request);
                let registry = self.registry.clone();
                let directory = self.directory.clone();
                tokio::spawn(async move {
                    if let Some(conn) = directory.data_connection(broker).await {
                        if let Err(err) = conn.send_no_reply(&registry, ApiKey::Produce, &body) {
                            warn!(broker, %err, "fire-and-forget produce failed");
                        }
                    }
                });
            }
            self.machine.steps.succeed(ProducerStep::Produce);
            return;
        }

        self.machine.steps.begin_fan_out(
            ProducerStep::Produce,
            routed.iter().map(|(broker, _)| *broker as ContextId),
        );
        for (broker, request) in routed {
            let body = RequestBody::Produce(request);
            let registry = self.registry.clone();
            let directory = self.directory.clone();
            let event_tx = event_tx.clone();
            tokio::spawn(async move {
                let result = async {
                    let conn = directory
                        .data_connection(broker)
                        .await
                        .ok_or(FranzError::NoBrokersAvailable)?;
                    conn.request(&registry, ApiKey::Produce, &body).await
                }
                .await;
                let _ = event_tx.send(ProducerEvent::Done {
                    step: ProducerStep::Produce,
                    ctx: broker as ContextId,
                    result,
                });
            });
        }
    }

    fn handle(&mut self, event: ProducerEvent) {
        let ProducerEvent::Done { step, ctx, result } = event;
        let body = match result {
            Ok(body) => body,
            Err(err) => {
                warn!(?step, %err, "step iteration failed");
                self.metrics.record_connection_error();
                self.machine.steps.fail(step);
                return;
            }
        };
        match (step, body) {
            (ProducerStep::Metadata, ResponseBody::Metadata(resp)) => {
                let changed = self.directory.apply_metadata(&resp);
                self.machine.on_metadata(changed);
            }
            (ProducerStep::Produce, ResponseBody::Produce(resp)) => {
                let acked = self.machine.on_produce(ctx, &resp);
                self.metrics.record_send(acked.len() as u64, 0);
            }
            (step, _) => {
                error!(?step, "mismatched response body");
                self.machine.steps.fail(step);
            }
        }
    }
}

/// Builder for [`Producer`].
pub struct ProducerBuilder {
    config: ProducerConfig,
    sasl: Option<Arc<dyn SaslMechanism>>,
}

impl ProducerBuilder {
    pub fn new() -> Self {
        Self {
            config: ProducerConfig::default(),
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

    pub fn required_acks(mut self, acks: i16) -> Self {
        self.config.required_acks = acks;
        self
    }

    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.ack_timeout = timeout;
        self
    }

    pub fn compression(mut self, compression: Compression) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn sasl(mut self, mechanism: Arc<dyn SaslMechanism>) -> Self {
        self.sasl = Some(mechanism);
        self
    }

    pub fn build(self) -> Result<Producer, FranzError> {
        Producer::with_sasl(self.config, self.sasl)
    }
}

impl Default for ProducerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
