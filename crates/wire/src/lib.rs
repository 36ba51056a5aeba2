//! Wire types shared by the mock server, the SDK protocol, and the cloud API
//!
//! Every payload is a length-prefixed JSON frame: a 4-byte big-endian length
//! followed by the serialized body. The same framing is used on the mock IPC
//! socket and inside cloud request bodies, so both sides share one codec.

pub mod cloud;
pub mod frame;
pub mod mock;

pub use frame::{decode_frame, encode_frame, frame_codec, WireError, MAX_FRAME_BYTES};
pub use mock::{MockRequest, MockResponse};
