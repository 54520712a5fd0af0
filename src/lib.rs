//! # k-tarpipe
//!
//! Encrypted, compressed tar backups streamed through a pipeline of concurrent stages.
//!
//! ## Features
//!
//! - **Backup**: walk a file or directory into a tar stream, compress it, encrypt it and commit
//!   the result atomically as `backup_<name>_<timestamp>.tar<.gz|.zst|.lz4|.xz>.<gpg|age>`
//! - **Restore**: decrypt, decompress and extract, refusing any entry that would land outside
//!   the destination
//! - **Verify**: a quick envelope check from the first bytes, or a full streaming decode
//! - **Compression**: gzip, zstd, lz4 and xz, or none
//! - **Encryption**: age (passphrase or x25519 keys) and OpenPGP through `gpg`
//!
//! ## Quick Start
//!
//! ```no_run
//! use k_tarpipe::tarpipe::compress::{CompressionKind, CompressorConfig};
//! use k_tarpipe::tarpipe::encrypt::{EncryptionKind, EncryptorConfig, KeyMaterial};
//! use k_tarpipe::tarpipe::pipeline::backup::BackupJob;
//!
//! let keys = KeyMaterial::builder().passphrase("correct horse battery".into()).build();
//! let outcome = BackupJob::builder()
//!     .source("/home/me/documents")
//!     .destination("/srv/backups")
//!     .compressor(CompressorConfig::from_kind(CompressionKind::Zstd))
//!     .encryptor(EncryptorConfig::from_kind(EncryptionKind::Age, keys))
//!     .build()
//!     .run()?;
//! # Ok::<(), k_tarpipe::tarpipe::result_error::error::Error>(())
//! ```

pub mod tarpipe;
