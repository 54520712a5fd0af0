use crate::tarpipe::compress::{Compressor, CompressorBuilder};
use crate::tarpipe::result_error::result::Result;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::Write;
use validator::Validate;

static DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Configuration for Zstandard compression
#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct ZstdConfig {
    /// Compression level (1-22), 3 when unset
    #[validate(range(min = 1, max = 22))]
    pub level: Option<i32>,

    /// Worker threads for the encoder; unset or 0 keeps compression on the stage thread
    pub thread: Option<u32>,
}

impl<W: Write> CompressorBuilder<W> for ZstdConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
        let thread = self.thread.unwrap_or(0);
        tracing::debug!("Creating zstd compressor with level={}, threads={}", level, thread);

        let mut encoder = zstd::stream::write::Encoder::new(writer, level)?;
        if thread > 0 {
            encoder.multithread(thread)?;
        }
        Ok(Compressor::Zstd(encoder))
    }
}
