//! Wire framing shared by the vendor decoders. Each codec buffers raw bytes
//! so a logical unit split across reads is only surfaced once complete.

pub mod eventstream;
pub mod ndjson;
pub mod sse;
