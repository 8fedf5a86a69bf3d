//! Broker connections: framing, correlation matching and pooling.
//!
//! Each broker connection runs one I/O task over a [`Framed`] stream.
//! Callers hand it a fully encoded frame plus a oneshot for the reply;
//! responses are matched to callers by the correlation id echoed in the
//! first four payload bytes. A request timeout closes the connection, so
//! the pool will reconnect lazily on the next use.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use rand::seq::SliceRandom;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::FranzError;
use crate::protocol::messages::{RequestBody, ResponseBody};
use crate::protocol::registry::ApiRegistry;
use crate::protocol::{wire, ApiKey};
use crate::sasl::SaslAuthenticator;

/// Upper bound on a single response frame; larger lengths are treated as a
/// corrupt stream rather than an allocation request.
const MAX_FRAME_LEN: i32 = 256 * 1024 * 1024;

/// Length-prefix framing. Outbound frames already carry their length
/// prefix (the registry writes it), so encoding is a plain copy; decoding
/// strips the prefix and yields the payload.
pub struct FrameCodec;

impl Encoder<Bytes> for FrameCodec {
    type Error = FranzError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FranzError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let frame_len = (&src[0..4]).get_i32();
        if !(0..=MAX_FRAME_LEN).contains(&frame_len) {
            return Err(FranzError::connection(format!(
                "invalid frame length {frame_len}"
            )));
        }
        let frame_len = frame_len as usize;
        if src.len() < 4 + frame_len {
            return Ok(None);
        }
        let mut frame = src.split_to(4 + frame_len).freeze();
        frame.advance(4);
        Ok(Some(frame))
    }
}

type Reply = oneshot::Sender<Result<Bytes, FranzError>>;

struct Outbound {
    frame: Bytes,
    correlation_id: i32,
    /// `None` for fire-and-forget sends (required acks 0)
    reply: Option<Reply>,
}

/// A single multiplexed connection to one broker.
pub struct BrokerConnection {
    pub addr: String,
    correlation: AtomicI32,
    request_timeout: Duration,
    request_tx: mpsc::UnboundedSender<Outbound>,
    cancel: CancellationToken,
}

impl BrokerConnection {
    pub fn spawn(
        addr: String,
        stream: TcpStream,
        request_timeout: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let framed = Framed::new(stream, FrameCodec);
        let loop_addr = addr.clone();
        let loop_cancel = cancel.clone();
        tokio::spawn(async move {
            connection_loop(loop_addr, framed, request_rx, loop_cancel).await;
        });
        Arc::new(Self {
            addr,
            correlation: AtomicI32::new(1),
            request_timeout,
            request_tx,
            cancel,
        })
    }

    pub fn next_correlation_id(&self) -> i32 {
        self.correlation.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_healthy(&self) -> bool {
        !self.request_tx.is_closed()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Encode, send and await one request over this connection.
    pub async fn request(
        &self,
        registry: &ApiRegistry,
        api: ApiKey,
        body: &RequestBody,
    ) -> Result<ResponseBody, FranzError> {
        let correlation_id = self.next_correlation_id();
        let frame = registry.encode_request(api, correlation_id, body)?;
        let payload = self.send_frame(frame, correlation_id).await?;
        let (echoed, decoded) = registry.decode_response(api, &payload)?;
        if echoed != correlation_id {
            return Err(FranzError::connection(format!(
                "correlation mismatch: sent {correlation_id}, received {echoed}"
            )));
        }
        Ok(decoded)
    }

    /// Send a request the broker will not answer (required acks 0).
    pub fn send_no_reply(
        &self,
        registry: &ApiRegistry,
        api: ApiKey,
        body: &RequestBody,
    ) -> Result<(), FranzError> {
        let correlation_id = self.next_correlation_id();
        let frame = registry.encode_request(api, correlation_id, body)?;
        self.request_tx
            .send(Outbound {
                frame,
                correlation_id,
                reply: None,
            })
            .map_err(|_| FranzError::connection("connection closed"))
    }

    async fn send_frame(&self, frame: Bytes, correlation_id: i32) -> Result<Bytes, FranzError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(Outbound {
                frame,
                correlation_id,
                reply: Some(reply_tx),
            })
            .map_err(|_| FranzError::connection("connection closed"))?;

        match timeout(self.request_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FranzError::connection("connection dropped the request")),
            Err(_) => {
                // a read timeout poisons the whole connection
                self.close();
                Err(FranzError::timeout(self.request_timeout.as_millis() as u64))
            }
        }
    }
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("addr", &self.addr)
            .field("healthy", &self.is_healthy())
            .finish()
    }
}

async fn connection_loop(
    addr: String,
    mut framed: Framed<TcpStream, FrameCodec>,
    mut request_rx: mpsc::UnboundedReceiver<Outbound>,
    cancel: CancellationToken,
) {
    let mut in_flight: HashMap<i32, Reply> = HashMap::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%addr, "connection cancelled");
                break;
            }

            outbound = request_rx.recv() => {
                let Some(outbound) = outbound else {
                    debug!(%addr, "request channel closed");
                    break;
                };
                if let Err(err) = framed.send(outbound.frame).await {
                    error!(%addr, %err, "failed to send request");
                    if let Some(reply) = outbound.reply {
                        let _ = reply.send(Err(FranzError::connection(err.to_string())));
                    }
                    break;
                }
                if let Some(reply) = outbound.reply {
                    in_flight.insert(outbound.correlation_id, reply);
                }
            }

            response = framed.next() => {
                match response {
                    Some(Ok(payload)) => {
                        let Ok(correlation_id) = wire::get_i32(&mut Cursor::new(&payload[..])) else {
                            warn!(%addr, "short response frame");
                            continue;
                        };
                        match in_flight.remove(&correlation_id) {
                            Some(reply) => {
                                let _ = reply.send(Ok(payload));
                            }
                            None => {
                                warn!(%addr, correlation_id, "response with no in-flight request");
                            }
                        }
                    }
                    Some(Err(err)) => {
                        error!(%addr, %err, "receive error");
                        break;
                    }
                    None => {
                        debug!(%addr, "stream closed by broker");
                        break;
                    }
                }
            }
        }
    }

    // abandoned in-flight requests fail with a connection error
    for (_, reply) in in_flight.drain() {
        let _ = reply.send(Err(FranzError::connection("connection closed")));
    }
    info!(%addr, "connection closed");
}

/// Pool of lazily created broker connections, keyed by address.
pub struct ConnectionPool {
    connections: DashMap<String, Arc<BrokerConnection>>,
    connect_timeout: Duration,
    request_timeout: Duration,
    sasl: Option<SaslAuthenticator>,
    cancel: CancellationToken,
}

impl ConnectionPool {
    pub fn new(
        connect_timeout: Duration,
        request_timeout: Duration,
        sasl: Option<SaslAuthenticator>,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            connect_timeout,
            request_timeout,
            sasl,
            cancel: CancellationToken::new(),
        }
    }

    /// Get or open a connection to a specific broker address.
    pub async fn get(&self, addr: &str) -> Result<Arc<BrokerConnection>, FranzError> {
        if let Some(conn) = self.connections.get(addr) {
            if conn.is_healthy() {
                return Ok(conn.clone());
            }
            drop(conn);
            self.connections.remove(addr);
        }

        let conn = self.connect(addr).await?;
        self.connections.insert(addr.to_string(), conn.clone());
        Ok(conn)
    }

    /// Connect to any of the given brokers, trying them in shuffled order
    /// to spread load across the cluster.
    pub async fn any(&self, brokers: &[String]) -> Result<Arc<BrokerConnection>, FranzError> {
        if brokers.is_empty() {
            return Err(FranzError::NoBrokersAvailable);
        }
        let mut candidates: Vec<&String> = brokers.iter().collect();
        candidates.shuffle(&mut rand::thread_rng());
        for addr in candidates {
            match self.get(addr).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    warn!(%addr, %err, "broker unavailable");
                }
            }
        }
        Err(FranzError::NoBrokersAvailable)
    }

    async fn connect(&self, addr: &str) -> Result<Arc<BrokerConnection>, FranzError> {
        debug!(%addr, "opening connection");
        let mut stream = timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| FranzError::timeout(self.connect_timeout.as_millis() as u64))?
            .map_err(|e| FranzError::connection(format!("failed to connect to {addr}: {e}")))?;

        if let Some(sasl) = &self.sasl {
            sasl.authenticate(&mut stream).await?;
        }

        let conn = BrokerConnection::spawn(
            addr.to_string(),
            stream,
            self.request_timeout,
            self.cancel.child_token(),
        );
        info!(%addr, "connected");
        Ok(conn)
    }

    /// Close every pooled connection.
    pub fn close_all(&self) {
        self.cancel.cancel();
        self.connections.clear();
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_codec_waits_for_complete_frames() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();

        buf.extend_from_slice(&[0x00, 0x00]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.clear();
        buf.extend_from_slice(&8i32.to_be_bytes());
        buf.extend_from_slice(&[1, 2, 3]);
        assert!(codec.decode(&mut buf).unwrap().is_none(), "partial payload");

        buf.extend_from_slice(&[4, 5, 6, 7, 8]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert!(buf.is_empty());
    }

    #[test]
    fn frame_codec_handles_multiple_frames_per_read() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        for payload in [&[0xaa][..], &[0xbb, 0xcc][..]] {
            buf.extend_from_slice(&(payload.len() as i32).to_be_bytes());
            buf.extend_from_slice(payload);
        }
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], &[0xaa]);
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], &[0xbb, 0xcc]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn frame_codec_rejects_negative_length() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&(-5i32).to_be_bytes());
        assert!(codec.decode(&mut buf).is_err());
    }

    #[tokio::test]
    async fn request_response_over_loopback() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // echo broker: read one frame, answer with the correlation id and a
        // zero error code
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut len_buf = [0u8; 4];
            socket.read_exact(&mut len_buf).await.unwrap();
            let len = i32::from_be_bytes(len_buf) as usize;
            let mut frame = vec![0u8; len];
            socket.read_exact(&mut frame).await.unwrap();
            let correlation = &frame[4..8];

            let mut reply = Vec::new();
            reply.extend_from_slice(&6i32.to_be_bytes());
            reply.extend_from_slice(correlation);
            reply.extend_from_slice(&0i16.to_be_bytes());
            socket.write_all(&reply).await.unwrap();
        });

        let pool = ConnectionPool::new(Duration::from_secs(5), Duration::from_secs(5), None);
        let conn = pool.get(&addr).await.unwrap();
        let registry = ApiRegistry::new("0.10.1.0".parse().unwrap(), "franz-test");
        let body = RequestBody::Heartbeat(crate::protocol::messages::HeartbeatRequest {
            group_id: "g".into(),
            generation_id: 1,
            member_id: "m".into(),
        });
        let response = conn.request(&registry, ApiKey::Heartbeat, &body).await.unwrap();
        let ResponseBody::Heartbeat(hb) = response else {
            panic!("wrong body type");
        };
        assert_eq!(hb.error_code, 0);
        pool.close_all();
    }

    #[tokio::test]
    async fn pool_reports_no_brokers_when_all_fail() {
        let pool = ConnectionPool::new(Duration::from_millis(200), Duration::from_secs(1), None);
        // a port from the reserved range nothing listens on
        let result = pool.any(&["127.0.0.1:1".to_string()]).await;
        assert!(matches!(result, Err(FranzError::NoBrokersAvailable)));
    }
}
