//! Shared fixtures for integration tests.

#![allow(dead_code)]

use rune_core::tokens::{is_special, TextCodec};
use rune_core::{Result, RuneError};

/// Offset of byte tokens past the four special ids.
pub const BYTE_OFFSET: u32 = 4;

/// Vocabulary of [`ByteCodec`]: four special ids plus 256 bytes.
pub const BYTE_VOCAB: usize = 260;

/// One token per UTF-8 byte.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteCodec;

impl TextCodec for ByteCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| b as u32 + BYTE_OFFSET).collect())
    }

    fn decode(&self, tokens: &[u32]) -> Result<String> {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter(|&&t| !is_special(t))
            .map(|&t| (t - BYTE_OFFSET) as u8)
            .collect();
        String::from_utf8(bytes).map_err(|e| RuneError::Tokenizer(e.to_string()))
    }
}

/// Install a test subscriber once; respects `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
