//! Per-version codec registry and request/response framing.
//!
//! One registry exists per negotiated broker version. It caches one
//! [`ApiCodec`] per API key for the lifetime of the client and assembles
//! complete frames: `int32 length`, then `api_key, api_version,
//! correlation_id, client_id` and the encoded body.

use std::collections::HashMap;
use std::io::Cursor;

use bytes::{Bytes, BytesMut};

use super::codec::ApiCodec;
use super::messages::{RequestBody, ResponseBody};
use super::{wire, ApiKey, ProtocolError};
use crate::config::BrokerVersion;

pub use crate::error::describe_error;

#[derive(Debug, Clone)]
pub struct ApiRegistry {
    client_id: String,
    codecs: HashMap<ApiKey, ApiCodec>,
}

impl ApiRegistry {
    pub fn new(broker: BrokerVersion, client_id: impl Into<String>) -> Self {
        let codecs = ApiKey::ALL
            .iter()
            .map(|api| (*api, ApiCodec::new(*api, broker)))
            .collect();
        Self {
            client_id: client_id.into(),
            codecs,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    fn codec(&self, api: ApiKey) -> Result<&ApiCodec, ProtocolError> {
        self.codecs
            .get(&api)
            .ok_or(ProtocolError::UnsupportedApiKey(api as i16))
    }

    /// The request version negotiated for an API.
    pub fn api_version(&self, api: ApiKey) -> Result<i16, ProtocolError> {
        Ok(self.codec(api)?.api_version())
    }

    /// Encode a complete request frame, length prefix included.
    pub fn encode_request(
        &self,
        api: ApiKey,
        correlation_id: i32,
        body: &RequestBody,
    ) -> Result<Bytes, ProtocolError> {
        let codec = self.codec(api)?;
        let encoded_body = codec.encode_body(body)?;

        let mut buf = BytesMut::new();
        wire::put_i32(&mut buf, 0); // patched below
        wire::put_i16(&mut buf, api as i16);
        wire::put_i16(&mut buf, codec.api_version());
        wire::put_i32(&mut buf, correlation_id);
        wire::put_string(&mut buf, &self.client_id);
        buf.extend_from_slice(&encoded_body);

        let frame_len = (buf.len() - 4) as i32;
        buf[0..4].copy_from_slice(&frame_len.to_be_bytes());
        Ok(buf.freeze())
    }

    /// Decode a response payload (after the length prefix) into the echoed
    /// correlation id and the typed body.
    pub fn decode_response(
        &self,
        api: ApiKey,
        payload: &[u8],
    ) -> Result<(i32, ResponseBody), ProtocolError> {
        let codec = self.codec(api)?;
        let mut cur = Cursor::new(payload);
        let correlation_id = wire::get_i32(&mut cur)?;
        let body = codec.decode_body(&payload[cur.position() as usize..])?;
        Ok((correlation_id, body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::messages::{
        JoinGroupProtocol, JoinGroupRequest, MetadataRequest, Subscription,
    };

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    fn registry(version: &str) -> ApiRegistry {
        ApiRegistry::new(version.parse().unwrap(), "kafka-php")
    }

    #[test]
    fn join_group_v0_matches_reference_bytes() {
        let body = RequestBody::JoinGroup(JoinGroupRequest {
            group_id: "test".into(),
            session_timeout_ms: 6000,
            rebalance_timeout_ms: 0,
            member_id: String::new(),
            protocol_type: "consumer".into(),
            protocols: vec![JoinGroupProtocol {
                name: "group".into(),
                metadata: Subscription::new(vec!["test".into()]).encode(),
            }],
        });
        let frame = registry("0.9.0.1")
            .encode_request(ApiKey::JoinGroup, 11, &body)
            .unwrap();
        assert_eq!(
            hex(&frame),
            "00000048000b00000000000b00096b61666b612d706870000474657374000017700000\
             0008636f6e73756d657200000001000567726f757000000010000000000001000474657\
             37400000000"
                .replace(char::is_whitespace, "")
        );
    }

    #[test]
    fn metadata_request_bytes_identical_across_versions() {
        let body = RequestBody::Metadata(MetadataRequest {
            topics: vec!["test".into()],
        });
        let expected = "0000001d000300000000000300096b61666b612d70687000000001000474657374";
        for version in ["0.8.2.2", "0.9.0.1", "0.10.1.0"] {
            let frame = registry(version)
                .encode_request(ApiKey::Metadata, 3, &body)
                .unwrap();
            assert_eq!(hex(&frame), expected, "at broker version {version}");
        }
    }

    #[test]
    fn frame_length_covers_everything_after_the_prefix() {
        let body = RequestBody::Metadata(MetadataRequest::default());
        let frame = registry("0.10.1.0")
            .encode_request(ApiKey::Metadata, 1, &body)
            .unwrap();
        let declared = i32::from_be_bytes(frame[0..4].try_into().unwrap()) as usize;
        assert_eq!(declared, frame.len() - 4);
    }

    #[test]
    fn correlation_id_roundtrips_through_decode() {
        let mut payload = BytesMut::new();
        wire::put_i32(&mut payload, 77);
        wire::put_i16(&mut payload, 0); // heartbeat error code
        let (correlation, _) = registry("0.10.1.0")
            .decode_response(ApiKey::Heartbeat, &payload)
            .unwrap();
        assert_eq!(correlation, 77);
    }

    #[test]
    fn every_api_gets_a_cached_codec() {
        let registry = registry("0.10.1.0");
        for api in ApiKey::ALL {
            assert!(registry.api_version(api).is_ok());
        }
    }
}
