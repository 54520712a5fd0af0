use crate::tarpipe::archive::encode::ExcludePattern;
use crate::tarpipe::compress::CompressorConfig;
use crate::tarpipe::encrypt::{DecryptionSettings, EncryptorConfig};
use crate::tarpipe::pipeline::PipelineOptions;
use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use crate::tarpipe::result_error::WithMsg;
use crate::tarpipe::validate::validate_writable_dir;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::fs::File;
use std::path::{Path, PathBuf};
use validator::Validate;

/// Settings read from the optional YAML configuration file
///
/// Every field has a default, so an empty document is a valid configuration. Command line flags
/// take precedence over anything set here.
///
/// ```yaml
/// compressor:
///   compressor_type: zstd
///   level: 9
/// encryptor:
///   encryptor_type: age
///   keys:
///     recipients: ["age1..."]
///     identity_file: /etc/k-tarpipe/identity.txt
/// exclude: ["**/*.tmp", "cache"]
/// pipeline:
///   buffer_size: 131072
///   depth: 8
/// backup_dir: /srv/backups
/// ```
#[skip_serializing_none]
#[derive(Clone, Default, Serialize, Deserialize, Debug, Validate)]
#[serde(deny_unknown_fields)]
pub struct ToolConfig {
    #[serde(default)]
    #[validate(nested)]
    pub compressor: CompressorConfig,
    #[validate(nested)]
    pub encryptor: Option<EncryptorConfig>,
    #[serde(default)]
    pub exclude: Vec<ExcludePattern>,
    #[serde(default)]
    #[validate(nested)]
    pub pipeline: PipelineOptions,
    /// Directory new backups are written to when none is given on the command line
    #[validate(custom(function = validate_writable_dir))]
    pub backup_dir: Option<PathBuf>,
}

impl ToolConfig {
    pub fn load(path: &Path) -> Result<ToolConfig> {
        let config = File::open(path)
            .map_err(Error::from)
            .and_then(|f| serde_yml::from_reader::<_, ToolConfig>(f).map_err(Error::from))
            .with_msg(format!("Parse YAML config failed: {:?}", path))?;
        config
            .validate()
            .map_err(Error::from)
            .with_msg(format!("Config validation failed: {:?}", path))?;
        tracing::debug!("Loaded config {:?}", path);
        Ok(config)
    }

    /// Decryption settings derived from the configured encryptor, if any.
    pub fn decryption(&self) -> DecryptionSettings {
        self.encryptor
            .clone()
            .map(DecryptionSettings::from)
            .unwrap_or_default()
    }
}
