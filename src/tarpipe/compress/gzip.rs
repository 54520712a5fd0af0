use crate::tarpipe::compress::{Compressor, CompressorBuilder};
use crate::tarpipe::result_error::result::Result;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::Write;
use validator::Validate;

static DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Configuration for gzip (DEFLATE) compression
#[skip_serializing_none]
#[derive(Clone, Default, Validate, Serialize, Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct GzipConfig {
    /// Compression level (0-9), 6 when unset
    #[validate(range(min = 0, max = 9))]
    pub level: Option<u32>,
}

impl<W: Write> CompressorBuilder<W> for GzipConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        let level = self.level.unwrap_or(DEFAULT_COMPRESSION_LEVEL);
        tracing::debug!("Creating gzip compressor with level={}", level);
        Ok(Compressor::Gzip(GzEncoder::new(writer, Compression::new(level))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_level_range() {
        assert!(GzipConfig { level: Some(0) }.validate().is_ok());
        assert!(GzipConfig { level: Some(9) }.validate().is_ok());
        assert!(GzipConfig { level: Some(10) }.validate().is_err());
        assert!(GzipConfig::default().validate().is_ok());
    }
}
