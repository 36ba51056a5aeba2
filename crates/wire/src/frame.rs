use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::codec::LengthDelimitedCodec;

/// Upper bound on a single frame. Recorded bodies are capped well below
/// this; anything larger is a protocol violation, not data.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to serialize frame: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("failed to deserialize frame: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Codec for the mock IPC socket: u32 big-endian length prefix.
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(MAX_FRAME_BYTES)
        .new_codec()
}

pub fn encode_frame<T: Serialize>(value: &T) -> Result<Bytes, WireError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(WireError::Serialize)
}

pub fn decode_frame<T: DeserializeOwned>(payload: &[u8]) -> Result<T, WireError> {
    serde_json::from_slice(payload).map_err(WireError::Deserialize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockRequest, MockResponse};
    use futures::{SinkExt, StreamExt};
    use serde_json::json;
    use tokio_util::codec::Framed;

    #[test]
    fn test_encode_decode_round_trip() {
        let request = MockRequest {
            trace_id: "trc_1".to_string(),
            package_name: "pg".to_string(),
            submodule_name: "query".to_string(),
            schema_hash: None,
            input_value: json!({"sql": "SELECT 1"}),
        };
        let bytes = encode_frame(&request).unwrap();
        let back: MockRequest = decode_frame(&bytes).unwrap();
        assert_eq!(back.trace_id, "trc_1");
        assert_eq!(back.input_value, json!({"sql": "SELECT 1"}));
    }

    #[test]
    fn test_decode_garbage_is_an_error() {
        let err = decode_frame::<MockResponse>(b"not json").unwrap_err();
        assert!(matches!(err, WireError::Deserialize(_)));
    }

    #[tokio::test]
    async fn test_framed_duplex_carries_length_prefix() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = Framed::new(client, frame_codec());
        let mut server = Framed::new(server, frame_codec());

        let response = MockResponse::miss("malformed");
        client.send(encode_frame(&response).unwrap()).await.unwrap();
        drop(client);

        let frame = server.next().await.unwrap().unwrap();
        let back: MockResponse = decode_frame(&frame).unwrap();
        assert!(!back.found);
        assert_eq!(back.reason.as_deref(), Some("malformed"));
        assert!(server.next().await.is_none());
    }
}
