//! In-frame message codec.
//!
//! Layout (big-endian):
//! `[u8 type][u8 service][16 ASCII id][u32 payload_len][payload]`
//!
//! The connection id is never on the wire; decode returns it empty and the
//! receiver stamps it.

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Service discriminators. User services start at [`service::USER_BASE`].
pub mod service {
    pub const SYSTEM: u8 = 1;
    pub const RESPONSE: u8 = 2;
    pub const USER_BASE: u8 = 10;
}

/// Message type discriminators. Response codes live in the response
/// service namespace and reuse the low values.
pub mod msg_type {
    pub const HEARTBEAT: u8 = 1;
    pub const AUTH: u8 = 2;
    pub const RESPONSE_OK: u8 = 1;
    pub const RESPONSE_FAIL: u8 = 2;
}

pub const MESSAGE_ID_LEN: usize = 16;
/// type + service + id + payload_len
pub const HEADER_LEN: usize = 1 + 1 + MESSAGE_ID_LEN + 4;

/// Generate a message id: the first 16 hex chars of a UUIDv4 simple
/// encoding. 64 bits of entropy, unique within a sender for any realistic
/// process lifetime.
pub fn generate_message_id() -> String {
    let mut id = uuid::Uuid::new_v4().simple().to_string();
    id.truncate(MESSAGE_ID_LEN);
    id
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub msg_type: u8,
    pub service: u8,
    pub id: String,
    pub payload: Vec<u8>,
    /// Local connection id, stamped by the receiver on decode and by the
    /// sender on construction. Never serialized.
    pub conn_id: String,
}

/// Envelope carried in the payload of response-service messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponsePayload {
    pub origin_msg_id: String,
    /// Result bytes on success, error text on failure; the outer message
    /// type distinguishes the two.
    pub data: Vec<u8>,
}

impl Message {
    /// Build a message with a fresh id and raw payload bytes.
    pub fn new(msg_type: u8, service: u8, conn_id: &str, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            service,
            id: generate_message_id(),
            payload,
            conn_id: conn_id.to_string(),
        }
    }

    /// Build a message whose payload is the JSON encoding of `value`.
    pub fn with_json<T: Serialize>(
        msg_type: u8,
        service: u8,
        conn_id: &str,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(msg_type, service, conn_id, serde_json::to_vec(value)?))
    }

    /// Success response wrapping `result` in the response envelope.
    pub fn success_response<T: Serialize>(
        conn_id: &str,
        origin_id: &str,
        result: &T,
    ) -> Result<Self, serde_json::Error> {
        let envelope = ResponsePayload {
            origin_msg_id: origin_id.to_string(),
            data: serde_json::to_vec(result)?,
        };
        Self::with_json(msg_type::RESPONSE_OK, service::RESPONSE, conn_id, &envelope)
    }

    /// Fail response carrying the error text as the envelope data.
    pub fn fail_response(conn_id: &str, origin_id: &str, error: &str) -> Self {
        let envelope = ResponsePayload {
            origin_msg_id: origin_id.to_string(),
            data: error.as_bytes().to_vec(),
        };
        // The envelope has no non-serializable field; encoding cannot fail.
        let payload = serde_json::to_vec(&envelope).unwrap_or_default();
        Self::new(msg_type::RESPONSE_FAIL, service::RESPONSE, conn_id, payload)
    }

    /// Encode into the in-frame byte layout.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        if self.id.len() != MESSAGE_ID_LEN || !self.id.is_ascii() {
            return Err(CodecError::TooShort(self.id.len()));
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.push(self.msg_type);
        buf.push(self.service);
        buf.extend_from_slice(self.id.as_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_be_bytes());
        buf.extend_from_slice(&self.payload);
        Ok(buf)
    }

    /// Decode from in-frame bytes. The returned `conn_id` is empty.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN {
            return Err(CodecError::TooShort(bytes.len()));
        }
        let msg_type = bytes[0];
        let svc = bytes[1];
        let id = String::from_utf8_lossy(&bytes[2..2 + MESSAGE_ID_LEN]).into_owned();
        let len_bytes: [u8; 4] = [bytes[18], bytes[19], bytes[20], bytes[21]];
        let payload_len = u32::from_be_bytes(len_bytes) as usize;
        let actual = bytes.len() - HEADER_LEN;
        if actual < payload_len {
            return Err(CodecError::PayloadTooShort { expected: payload_len, actual });
        }
        Ok(Self {
            msg_type,
            service: svc,
            id,
            payload: bytes[HEADER_LEN..HEADER_LEN + payload_len].to_vec(),
            conn_id: String::new(),
        })
    }

    /// The singleton heartbeat frame. Fixed payload, one allocation for the
    /// process lifetime.
    pub fn heartbeat() -> &'static Message {
        static HEARTBEAT: Lazy<Message> = Lazy::new(|| {
            Message::new(msg_type::HEARTBEAT, service::SYSTEM, "", b"null".to_vec())
        });
        &HEARTBEAT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_round_trip_excludes_conn_id() {
        let msg = Message::new(3, service::USER_BASE, "conn-1", b"{\"k\":1}".to_vec());
        let decoded = Message::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.msg_type, msg.msg_type);
        assert_eq!(decoded.service, msg.service);
        assert_eq!(decoded.id, msg.id);
        assert_eq!(decoded.payload, msg.payload);
        assert!(decoded.conn_id.is_empty());
    }

    #[test]
    fn test_decode_too_short() {
        assert!(matches!(Message::decode(&[1, 2, 3]), Err(CodecError::TooShort(3))));
    }

    #[test]
    fn test_decode_payload_too_short() {
        let mut bytes = Message::new(1, 1, "", b"abcdef".to_vec()).encode().unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(
            Message::decode(&bytes),
            Err(CodecError::PayloadTooShort { expected: 6, actual: 3 })
        ));
    }

    #[test]
    fn test_message_ids_unique_and_well_formed() {
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = generate_message_id();
            assert_eq!(id.len(), MESSAGE_ID_LEN);
            assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            assert!(seen.insert(id), "duplicate message id");
        }
    }

    #[test]
    fn test_version_nibble_preserved() {
        // Char 12 of a v4 simple encoding is the version nibble.
        let id = generate_message_id();
        assert_eq!(id.as_bytes()[12], b'4');
    }

    #[test]
    fn test_response_envelope() {
        let ok = Message::success_response("c", "abcdefabcdefabcd", &serde_json::json!({"x": 1}))
            .unwrap();
        assert_eq!(ok.msg_type, msg_type::RESPONSE_OK);
        assert_eq!(ok.service, service::RESPONSE);
        let env: ResponsePayload = serde_json::from_slice(&ok.payload).unwrap();
        assert_eq!(env.origin_msg_id, "abcdefabcdefabcd");
        assert_eq!(env.data, b"{\"x\":1}");

        let fail = Message::fail_response("c", "abcdefabcdefabcd", "boom");
        assert_eq!(fail.msg_type, msg_type::RESPONSE_FAIL);
        let env: ResponsePayload = serde_json::from_slice(&fail.payload).unwrap();
        assert_eq!(env.data, b"boom");
    }

    #[test]
    fn test_heartbeat_singleton() {
        let a = Message::heartbeat();
        let b = Message::heartbeat();
        assert_eq!(a.id, b.id);
        assert_eq!(a.payload, b"null");
        assert_eq!(a.service, service::SYSTEM);
        assert!(a.conn_id.is_empty());
    }
}
