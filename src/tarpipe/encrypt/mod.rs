pub mod age;
pub mod gpg;

use crate::tarpipe::encrypt::age::AgeConfig;
use crate::tarpipe::encrypt::gpg::GpgConfig;
use crate::tarpipe::file_ext::FileExtProvider;
use crate::tarpipe::redacted::RedactedString;
use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use crate::tarpipe::result_error::WithDebugObjectAndFnName;
use crate::tarpipe::transform::StreamTransform;
use crate::tarpipe::validate::validate_file_exist;
use bon::Builder;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::result;
use std::str::FromStr;
use validator::{Validate, ValidationErrors};

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionKind {
    #[display("gpg")]
    Gpg,
    #[display("age")]
    Age,
}

impl FileExtProvider for EncryptionKind {
    fn file_ext(&self) -> &'static str {
        match self {
            EncryptionKind::Gpg => ".gpg",
            EncryptionKind::Age => ".age",
        }
    }
}

impl FromStr for EncryptionKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "gpg" | "pgp" => Ok(EncryptionKind::Gpg),
            "age" => Ok(EncryptionKind::Age),
            other => Err(Error::Configuration(format!(
                "unknown encryption method {other:?}, expected gpg or age"
            ))),
        }
    }
}

/// Keys and secrets shared by both encryption methods.
///
/// Encrypting needs either a passphrase or recipients. Decrypting needs the passphrase or the
/// identities (age) / a keyring that holds the secret key (gpg).
#[skip_serializing_none]
#[derive(Clone, Default, Serialize, Deserialize, Debug, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct KeyMaterial {
    #[validate(nested)]
    pub passphrase: Option<RedactedString>,
    #[serde(default)]
    #[builder(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    #[builder(default)]
    pub identities: Vec<RedactedString>,
    #[validate(custom(function = validate_file_exist))]
    pub identity_file: Option<PathBuf>,
    /// Write an ASCII-armored envelope instead of a binary one
    #[serde(default)]
    #[builder(default)]
    pub armor: bool,
}

#[derive(Clone, Serialize, Deserialize, Debug)]
#[serde(tag = "encryptor_type")]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum EncryptorConfig {
    Gpg(GpgConfig),
    Age(AgeConfig),
}

impl EncryptorConfig {
    pub fn from_kind(kind: EncryptionKind, keys: KeyMaterial) -> Self {
        match kind {
            EncryptionKind::Gpg => EncryptorConfig::Gpg(GpgConfig::builder().keys(keys).build()),
            EncryptionKind::Age => EncryptorConfig::Age(AgeConfig::builder().keys(keys).build()),
        }
    }

    pub fn kind(&self) -> EncryptionKind {
        match self {
            EncryptorConfig::Gpg(_) => EncryptionKind::Gpg,
            EncryptorConfig::Age(_) => EncryptionKind::Age,
        }
    }

    pub fn keys(&self) -> &KeyMaterial {
        match self {
            EncryptorConfig::Gpg(gpg) => &gpg.keys,
            EncryptorConfig::Age(age) => &age.keys,
        }
    }

    /// Fails early when the configuration cannot possibly encrypt.
    pub fn check_can_encrypt(&self) -> Result<()> {
        let keys = self.keys();
        if keys.passphrase.is_none() && keys.recipients.is_empty() {
            return Err(Error::user_actionable(
                format!("{} encryption needs a passphrase or at least one recipient", self.kind()),
                "provide a passphrase or a recipient",
            ));
        }
        if let EncryptorConfig::Age(age) = self {
            age.build_encryptor_handle()
                .map(|_| ())
                .with_debug_object_and_fn_name(self.clone(), "check_can_encrypt")?;
        }
        Ok(())
    }
}

/// Decryption settings for a backup whose method may only be known from its file name.
#[derive(Clone, Default, Debug, Builder)]
pub struct DecryptionSettings {
    /// Explicit method; detected from the file name when unset
    pub kind: Option<EncryptionKind>,
    #[builder(default)]
    pub keys: KeyMaterial,
    #[builder(into)]
    pub gpg_program: Option<PathBuf>,
    #[builder(into)]
    pub gpg_homedir: Option<PathBuf>,
}

impl DecryptionSettings {
    pub fn for_kind(&self, kind: EncryptionKind) -> EncryptorConfig {
        match kind {
            EncryptionKind::Gpg => EncryptorConfig::Gpg(GpgConfig {
                keys: self.keys.clone(),
                program: self.gpg_program.clone(),
                homedir: self.gpg_homedir.clone(),
            }),
            EncryptionKind::Age => EncryptorConfig::from_kind(kind, self.keys.clone()),
        }
    }
}

impl From<EncryptorConfig> for DecryptionSettings {
    fn from(config: EncryptorConfig) -> Self {
        let kind = Some(config.kind());
        match config {
            EncryptorConfig::Gpg(gpg) => Self {
                kind,
                keys: gpg.keys,
                gpg_program: gpg.program,
                gpg_homedir: gpg.homedir,
            },
            EncryptorConfig::Age(age) => Self {
                kind,
                keys: age.keys,
                gpg_program: None,
                gpg_homedir: None,
            },
        }
    }
}

impl Validate for EncryptorConfig {
    fn validate(&self) -> result::Result<(), ValidationErrors> {
        match self {
            EncryptorConfig::Gpg(inner) => inner.validate(),
            EncryptorConfig::Age(inner) => inner.validate(),
        }
    }
}

impl FileExtProvider for EncryptorConfig {
    fn file_ext(&self) -> &'static str {
        self.kind().file_ext()
    }
}

impl StreamTransform for EncryptorConfig {
    fn encode<R: Read + Send, W: Write + Send>(
        &self,
        input: R,
        output: W,
        buffer_size: usize,
    ) -> Result<W> {
        match self {
            EncryptorConfig::Gpg(gpg) => gpg.encode(input, output, buffer_size),
            EncryptorConfig::Age(age) => age.encode(input, output, buffer_size),
        }
    }

    fn decode<R: Read + Send, W: Write + Send>(
        &self,
        input: R,
        output: W,
        buffer_size: usize,
    ) -> Result<W> {
        match self {
            EncryptorConfig::Gpg(gpg) => gpg.decode(input, output, buffer_size),
            EncryptorConfig::Age(age) => age.decode(input, output, buffer_size),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarpipe::result_error::error::ErrorKind;

    #[test]
    fn test_kind_names_and_extensions() {
        assert_eq!(EncryptionKind::Age.file_ext(), ".age");
        assert_eq!(EncryptionKind::Gpg.file_ext(), ".gpg");
        assert_eq!(EncryptionKind::Age.to_string(), "age");
        assert_eq!("AGE".parse::<EncryptionKind>().unwrap(), EncryptionKind::Age);
        assert_eq!(
            "rot13".parse::<EncryptionKind>().unwrap_err().kind(),
            ErrorKind::Configuration
        );
    }

    #[test]
    fn test_missing_keys_cannot_encrypt() {
        for kind in [EncryptionKind::Age, EncryptionKind::Gpg] {
            let config = EncryptorConfig::from_kind(kind, KeyMaterial::default());
            let err = config.check_can_encrypt().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::UserActionable);
        }
    }

    #[test]
    fn test_decryption_settings_keep_gpg_options() {
        let config = EncryptorConfig::Gpg(
            GpgConfig::builder()
                .program("/opt/gnupg/bin/gpg")
                .homedir("/tmp/keyring")
                .build(),
        );
        let settings = DecryptionSettings::from(config);
        assert_eq!(settings.kind, Some(EncryptionKind::Gpg));
        match settings.for_kind(EncryptionKind::Gpg) {
            EncryptorConfig::Gpg(gpg) => {
                assert_eq!(gpg.program, Some(PathBuf::from("/opt/gnupg/bin/gpg")));
                assert_eq!(gpg.homedir, Some(PathBuf::from("/tmp/keyring")));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            settings.for_kind(EncryptionKind::Age).kind(),
            EncryptionKind::Age
        );
    }

    #[test]
    fn test_encryptor_config_deserialization() {
        let json = r#"{"encryptor_type":"age","keys":{"passphrase":"long_enough_pass","armor":true}}"#;
        let config: EncryptorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.kind(), EncryptionKind::Age);
        assert!(config.keys().armor);
        assert_eq!(
            config.keys().passphrase.as_ref().unwrap().expose(),
            "long_enough_pass"
        );
        assert!(config.validate().is_ok());

        let json = r#"{"encryptor_type":"gpg","keys":{"passphrase":"short"}}"#;
        let config: EncryptorConfig = serde_json::from_str(json).unwrap();
        assert!(config.validate().is_err());
    }
}
