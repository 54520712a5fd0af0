pub mod gzip;
pub mod lz4;
pub mod xz;
pub mod zstandard;

use crate::tarpipe::file_ext::FileExtProvider;
use crate::tarpipe::finish::Finish;
use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use crate::tarpipe::result_error::WithDebugObjectAndFnName;
use crate::tarpipe::stream::{copy_buffered, copy_decoded};
use crate::tarpipe::transform::StreamTransform;
use derive_more::Display;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use io_enum::{Read, Write};
use liblzma::read::XzDecoder;
use liblzma::write::XzEncoder;
use crate::tarpipe::compress::lz4::Lz4Encoder;
use lz4_flex::frame::FrameDecoder;
use serde::{Deserialize, Serialize};
use std::io;
use std::io::{BufReader, Read, Write};
use std::result;
use std::str::FromStr;
use validator::{Validate, ValidationErrors};

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionKind {
    #[display("none")]
    None,
    #[display("gzip")]
    Gzip,
    #[display("zstd")]
    Zstd,
    #[display("lz4")]
    Lz4,
    #[display("xz")]
    Xz,
}

impl FileExtProvider for CompressionKind {
    fn file_ext(&self) -> &'static str {
        match self {
            CompressionKind::None => "",
            CompressionKind::Gzip => ".gz",
            CompressionKind::Zstd => ".zst",
            CompressionKind::Lz4 => ".lz4",
            CompressionKind::Xz => ".xz",
        }
    }
}

impl FromStr for CompressionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(CompressionKind::None),
            "gzip" | "gz" => Ok(CompressionKind::Gzip),
            "zstd" | "zst" => Ok(CompressionKind::Zstd),
            "lz4" => Ok(CompressionKind::Lz4),
            "xz" => Ok(CompressionKind::Xz),
            other => Err(Error::Configuration(format!(
                "unknown compression method {other:?}, expected one of none, gzip, zstd, lz4, xz"
            ))),
        }
    }
}

#[derive(Write)]
pub enum Compressor<W: Write> {
    None(W),
    Gzip(GzEncoder<W>),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Lz4(Lz4Encoder<W>),
    Xz(XzEncoder<W>),
}

#[derive(Read)]
pub enum Decompressor<R: Read> {
    None(R),
    Gzip(MultiGzDecoder<R>),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<R>>),
    Lz4(FrameDecoder<R>),
    Xz(XzDecoder<R>),
}

#[derive(Clone, Default, Serialize, Deserialize, Debug)]
#[serde(tag = "compressor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum CompressorConfig {
    #[default]
    None,
    Gzip(gzip::GzipConfig),
    Zstd(zstandard::ZstdConfig),
    Lz4,
    Xz(xz::XzConfig),
}

impl CompressorConfig {
    /// Default settings for a method, as used when the method was inferred from a file name.
    pub fn from_kind(kind: CompressionKind) -> Self {
        match kind {
            CompressionKind::None => CompressorConfig::None,
            CompressionKind::Gzip => CompressorConfig::Gzip(Default::default()),
            CompressionKind::Zstd => CompressorConfig::Zstd(Default::default()),
            CompressionKind::Lz4 => CompressorConfig::Lz4,
            CompressionKind::Xz => CompressorConfig::Xz(Default::default()),
        }
    }

    pub fn kind(&self) -> CompressionKind {
        match self {
            CompressorConfig::None => CompressionKind::None,
            CompressorConfig::Gzip(_) => CompressionKind::Gzip,
            CompressorConfig::Zstd(_) => CompressionKind::Zstd,
            CompressorConfig::Lz4 => CompressionKind::Lz4,
            CompressorConfig::Xz(_) => CompressionKind::Xz,
        }
    }
}

impl Validate for CompressorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            CompressorConfig::None | CompressorConfig::Lz4 => Ok(()),
            CompressorConfig::Gzip(gzip) => gzip.validate(),
            CompressorConfig::Zstd(zstd) => zstd.validate(),
            CompressorConfig::Xz(xz) => xz.validate(),
        }
    }
}

impl FileExtProvider for CompressorConfig {
    fn file_ext(&self) -> &'static str {
        self.kind().file_ext()
    }
}

pub trait CompressorBuilder<W: Write> {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>>;
}

pub trait DecompressorBuilder<R: Read> {
    fn build_decompressor(&self, reader: R) -> Result<Decompressor<R>>;
}

impl<W: Write> Finish<W> for Compressor<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            Compressor::None(w) => Ok(w),
            Compressor::Gzip(w) => Finish::finish(w),
            Compressor::Zstd(w) => Finish::finish(w),
            Compressor::Lz4(w) => Finish::finish(w),
            Compressor::Xz(w) => Finish::finish(w),
        }
    }
}

impl<W: Write> CompressorBuilder<W> for CompressorConfig {
    fn build_compressor(&self, writer: W) -> Result<Compressor<W>> {
        match self {
            CompressorConfig::None => Ok(Compressor::None(writer)),
            CompressorConfig::Gzip(gzip) => gzip.build_compressor(writer),
            CompressorConfig::Zstd(zstd) => zstd.build_compressor(writer),
            CompressorConfig::Lz4 => Ok(Compressor::Lz4(Lz4Encoder::new(writer))),
            CompressorConfig::Xz(xz) => xz.build_compressor(writer),
        }
        .with_debug_object_and_fn_name(self.clone(), "build_compressor")
    }
}

impl<R: Read> DecompressorBuilder<R> for CompressorConfig {
    fn build_decompressor(&self, reader: R) -> Result<Decompressor<R>> {
        Ok(match self {
            CompressorConfig::None => Decompressor::None(reader),
            CompressorConfig::Gzip(_) => Decompressor::Gzip(MultiGzDecoder::new(reader)),
            CompressorConfig::Zstd(_) => {
                Decompressor::Zstd(zstd::stream::read::Decoder::new(reader)?)
            }
            CompressorConfig::Lz4 => Decompressor::Lz4(FrameDecoder::new(reader)),
            CompressorConfig::Xz(_) => Decompressor::Xz(XzDecoder::new(reader)),
        })
    }
}

impl StreamTransform for CompressorConfig {
    fn encode<R: Read + Send, W: Write + Send>(
        &self,
        mut input: R,
        output: W,
        buffer_size: usize,
    ) -> Result<W> {
        let mut compressor = self.build_compressor(output)?;
        copy_buffered(&mut input, &mut compressor, buffer_size)?;
        Ok(compressor.finish()?)
    }

    fn decode<R: Read + Send, W: Write + Send>(
        &self,
        input: R,
        mut output: W,
        buffer_size: usize,
    ) -> Result<W> {
        let mut decompressor = self.build_decompressor(input)?;
        copy_decoded(&mut decompressor, &mut output, buffer_size)?;
        Ok(output)
    }
}
