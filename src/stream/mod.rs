//! Framed response stream decoding

pub mod assembler;
pub mod utf8;

pub use assembler::{decode_all, DecodedEvent, StreamAssembler, DATA_PREFIX, FRAME_DELIMITER};
pub use utf8::Utf8ChunkDecoder;
