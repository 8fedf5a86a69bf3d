//! SASL authentication flow.
//!
//! The flow owns two things: the SASL_HANDSHAKE request/response exchange
//! that announces the mechanism to the broker, and the raw length-prefixed
//! blob transport the mechanism exchange runs over. Mechanism semantics
//! (PLAIN credential packing, SCRAM challenges, GSSAPI tokens) live outside
//! this crate behind [`SaslMechanism`]; authentication happens on a freshly
//! connected socket before it joins the multiplexed pool.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::error::{describe_error, FranzError, KafkaCode};
use crate::protocol::messages::{RequestBody, ResponseBody, SaslHandshakeRequest};
use crate::protocol::registry::ApiRegistry;
use crate::protocol::ApiKey;

/// A SASL mechanism implementation (PLAIN, SCRAM-*, GSSAPI, ...).
///
/// `exchange` drives the mechanism-specific challenge/response dialogue over
/// the blob socket until the mechanism declares success or failure.
#[async_trait]
pub trait SaslMechanism: Send + Sync {
    /// Mechanism name as announced in the handshake, e.g. `"PLAIN"`.
    fn name(&self) -> &str;

    async fn exchange(&self, socket: &mut SaslSocket<'_>) -> Result<(), FranzError>;
}

/// Raw length-prefixed blob transport used during the mechanism exchange.
pub struct SaslSocket<'a> {
    stream: &'a mut TcpStream,
}

impl SaslSocket<'_> {
    /// Write one `int32`-length-prefixed blob.
    pub async fn send_blob(&mut self, blob: &[u8]) -> Result<(), FranzError> {
        self.stream.write_i32(blob.len() as i32).await?;
        self.stream.write_all(blob).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Read one `int32`-length-prefixed blob.
    pub async fn receive_blob(&mut self) -> Result<Bytes, FranzError> {
        let len = self.stream.read_i32().await?;
        if len < 0 {
            return Err(FranzError::connection(format!(
                "invalid SASL blob length {len}"
            )));
        }
        let mut blob = vec![0u8; len as usize];
        self.stream.read_exact(&mut blob).await?;
        Ok(Bytes::from(blob))
    }
}

/// Drives handshake-then-exchange on a fresh connection.
pub struct SaslAuthenticator {
    mechanism: Arc<dyn SaslMechanism>,
    registry: ApiRegistry,
}

impl SaslAuthenticator {
    pub fn new(mechanism: Arc<dyn SaslMechanism>, registry: ApiRegistry) -> Self {
        Self {
            mechanism,
            registry,
        }
    }

    pub async fn authenticate(&self, stream: &mut TcpStream) -> Result<(), FranzError> {
        self.handshake(stream).await?;
        let mut socket = SaslSocket { stream };
        self.mechanism.exchange(&mut socket).await?;
        info!(mechanism = self.mechanism.name(), "SASL authentication complete");
        Ok(())
    }

    async fn handshake(&self, stream: &mut TcpStream) -> Result<(), FranzError> {
        let body = RequestBody::SaslHandshake(SaslHandshakeRequest {
            mechanism: self.mechanism.name().to_string(),
        });
        let frame = self
            .registry
            .encode_request(ApiKey::SaslHandshake, 0, &body)?;
        stream.write_all(&frame).await?;
        stream.flush().await?;

        let len = stream.read_i32().await?;
        if len < 4 {
            return Err(FranzError::connection(format!(
                "invalid handshake frame length {len}"
            )));
        }
        let mut payload = vec![0u8; len as usize];
        stream.read_exact(&mut payload).await?;

        let (_, decoded) = self
            .registry
            .decode_response(ApiKey::SaslHandshake, &payload)?;
        let ResponseBody::SaslHandshake(response) = decoded else {
            return Err(FranzError::connection("unexpected handshake response"));
        };
        if response.error_code != KafkaCode::None as i16 {
            debug!(
                code = response.error_code,
                reason = %describe_error(response.error_code),
                "handshake rejected"
            );
            return Err(FranzError::SaslMechanismRejected {
                mechanism: self.mechanism.name().to_string(),
                supported: response.mechanisms.join(", "),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SaslAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslAuthenticator")
            .field("mechanism", &self.mechanism.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::wire;
    use bytes::BytesMut;

    struct TestMechanism;

    #[async_trait]
    impl SaslMechanism for TestMechanism {
        fn name(&self) -> &str {
            "PLAIN"
        }

        async fn exchange(&self, socket: &mut SaslSocket<'_>) -> Result<(), FranzError> {
            socket.send_blob(b"\0user\0secret").await?;
            let reply = socket.receive_blob().await?;
            if reply.is_empty() {
                Ok(())
            } else {
                Err(FranzError::connection("authentication rejected"))
            }
        }
    }

    fn registry() -> ApiRegistry {
        ApiRegistry::new("0.10.1.0".parse().unwrap(), "franz-test")
    }

    async fn mock_broker(
        listener: tokio::net::TcpListener,
        handshake_error: i16,
    ) {
        let (mut socket, _) = listener.accept().await.unwrap();

        // handshake request
        let len = socket.read_i32().await.unwrap();
        let mut frame = vec![0u8; len as usize];
        socket.read_exact(&mut frame).await.unwrap();
        let correlation = &frame[4..8];

        // handshake response: correlation, error, supported mechanisms
        let mut body = BytesMut::new();
        body.extend_from_slice(correlation);
        wire::put_i16(&mut body, handshake_error);
        wire::put_i32(&mut body, 1);
        wire::put_string(&mut body, "SCRAM-SHA-256");
        socket.write_i32(body.len() as i32).await.unwrap();
        socket.write_all(&body).await.unwrap();

        if handshake_error != 0 {
            return;
        }

        // mechanism exchange: read client blob, reply with empty blob
        let len = socket.read_i32().await.unwrap();
        let mut blob = vec![0u8; len as usize];
        socket.read_exact(&mut blob).await.unwrap();
        assert_eq!(&blob, b"\0user\0secret");
        socket.write_i32(0).await.unwrap();
    }

    #[tokio::test]
    async fn successful_handshake_and_exchange() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(mock_broker(listener, 0));

        let auth = SaslAuthenticator::new(Arc::new(TestMechanism), registry());
        let mut stream = TcpStream::connect(addr).await.unwrap();
        auth.authenticate(&mut stream).await.unwrap();
    }

    #[tokio::test]
    async fn rejected_mechanism_fails_fast_with_supported_list() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(mock_broker(listener, KafkaCode::UnsupportedSaslMechanism as i16));

        let auth = SaslAuthenticator::new(Arc::new(TestMechanism), registry());
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let err = auth.authenticate(&mut stream).await.unwrap_err();
        match err {
            FranzError::SaslMechanismRejected {
                mechanism,
                supported,
            } => {
                assert_eq!(mechanism, "PLAIN");
                assert_eq!(supported, "SCRAM-SHA-256");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
