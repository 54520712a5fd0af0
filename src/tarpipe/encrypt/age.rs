use crate::tarpipe::encrypt::KeyMaterial;
use crate::tarpipe::finish::Finish;
use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use crate::tarpipe::stream::{copy_buffered, copy_decoded};
use crate::tarpipe::transform::StreamTransform;
use ::age::armor::{ArmoredReader, ArmoredWriter, Format};
use ::age::stream::{StreamReader, StreamWriter};
use ::age::x25519;
use bon::Builder;
use io_enum::Write;
use serde::{Deserialize, Serialize};
use std::io;
use std::io::{BufReader, Read, Write};
use std::path::Path;
use validator::Validate;

/// Configuration for age encryption
///
/// Encrypts to a passphrase (scrypt) or to one or more x25519 recipients. The two cannot be
/// mixed in one file. Decryption uses the passphrase or the x25519 identities, given inline or
/// through an identity file.
#[derive(Clone, Default, Serialize, Deserialize, Debug, Validate, Builder)]
#[serde(deny_unknown_fields)]
pub struct AgeConfig {
    #[serde(default)]
    #[validate(nested)]
    #[builder(default)]
    pub keys: KeyMaterial,
}

#[derive(Write)]
pub enum AgeWriter<W: Write> {
    Binary(StreamWriter<W>),
    Armored(StreamWriter<ArmoredWriter<W>>),
}

impl<W: Write> Finish<W> for AgeWriter<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            AgeWriter::Binary(w) => Finish::finish(w),
            AgeWriter::Armored(w) => Finish::finish(Finish::finish(w)?),
        }
    }
}

pub type AgeReader<R> = StreamReader<ArmoredReader<BufReader<R>>>;

impl AgeConfig {
    fn recipients(&self) -> Result<Vec<x25519::Recipient>> {
        self.keys
            .recipients
            .iter()
            .map(|r| {
                r.trim().parse::<x25519::Recipient>().map_err(|e| {
                    Error::Configuration(format!("invalid age recipient {r:?}: {e}"))
                })
            })
            .collect()
    }

    fn identities(&self) -> Result<Vec<x25519::Identity>> {
        let mut lines: Vec<String> = self
            .keys
            .identities
            .iter()
            .map(|i| i.expose().trim().to_string())
            .collect();
        if let Some(file) = &self.keys.identity_file {
            lines.extend(read_identity_file(file)?);
        }
        lines
            .iter()
            .map(|line| {
                line.parse::<x25519::Identity>()
                    .map_err(|e| Error::Configuration(format!("invalid age identity: {e}")))
            })
            .collect()
    }

    /// Builds the age encryptor, validating every recipient on the way.
    pub fn build_encryptor_handle(&self) -> Result<::age::Encryptor> {
        match (&self.keys.passphrase, self.keys.recipients.is_empty()) {
            (Some(_), false) => Err(Error::Configuration(
                "age cannot encrypt to a passphrase and recipients at the same time".into(),
            )),
            (Some(passphrase), true) => {
                tracing::debug!("Initializing age encryption with passphrase");
                Ok(::age::Encryptor::with_user_passphrase(
                    passphrase.expose().into(),
                ))
            }
            (None, false) => {
                let recipients = self.recipients()?;
                tracing::debug!(
                    "Initializing age encryption to {} recipient(s)",
                    recipients.len()
                );
                Ok(::age::Encryptor::with_recipients(
                    recipients.iter().map(|r| r as &dyn ::age::Recipient),
                )?)
            }
            (None, true) => Err(Error::Configuration(
                "age encryption needs a passphrase or at least one recipient".into(),
            )),
        }
    }

    pub fn build_encryptor<W: Write>(&self, writer: W) -> Result<AgeWriter<W>> {
        let encryptor = self.build_encryptor_handle()?;
        if self.keys.armor {
            let armored = ArmoredWriter::wrap_output(writer, Format::AsciiArmor)?;
            Ok(AgeWriter::Armored(encryptor.wrap_output(armored)?))
        } else {
            Ok(AgeWriter::Binary(encryptor.wrap_output(writer)?))
        }
    }

    /// Opens an age stream; armored and binary envelopes are both accepted.
    pub fn build_decryptor<R: Read>(&self, reader: R) -> Result<AgeReader<R>> {
        let decryptor = ::age::Decryptor::new(ArmoredReader::new(reader))?;
        if decryptor.is_scrypt() {
            let passphrase = self.keys.passphrase.as_ref().ok_or_else(|| {
                Error::user_actionable(
                    "backup is encrypted with an age passphrase but none was given",
                    "provide the passphrase used for the backup",
                )
            })?;
            let identity = ::age::scrypt::Identity::new(passphrase.expose().into());
            Ok(decryptor.decrypt(std::iter::once(&identity as &dyn ::age::Identity))?)
        } else {
            let identities = self.identities()?;
            if identities.is_empty() {
                return Err(Error::user_actionable(
                    "backup is encrypted to age recipients but no identity was given",
                    "provide an age identity (AGE-SECRET-KEY-...) or an identity file",
                ));
            }
            Ok(decryptor.decrypt(identities.iter().map(|i| i as &dyn ::age::Identity))?)
        }
    }
}

fn read_identity_file(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path).map_err(|e| Error::UserActionable {
        message: format!("cannot read age identity file {path:?}"),
        hint: "check the identity file path and its permissions".into(),
        cause: Some(Box::new(e.into())),
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect())
}

impl StreamTransform for AgeConfig {
    fn encode<R: Read + Send, W: Write + Send>(
        &self,
        mut input: R,
        output: W,
        buffer_size: usize,
    ) -> Result<W> {
        let mut writer = self.build_encryptor(output)?;
        copy_buffered(&mut input, &mut writer, buffer_size)?;
        Ok(writer.finish()?)
    }

    fn decode<R: Read + Send, W: Write + Send>(
        &self,
        input: R,
        mut output: W,
        buffer_size: usize,
    ) -> Result<W> {
        let mut reader = self.build_decryptor(input)?;
        copy_decoded(&mut reader, &mut output, buffer_size)?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarpipe::redacted::RedactedString;
    use crate::tarpipe::result_error::error::ErrorKind;
    use ::age::secrecy::ExposeSecret;
    use std::io::Cursor;

    fn key_pair() -> (String, RedactedString) {
        let identity = x25519::Identity::generate();
        let recipient = identity.to_public().to_string();
        let secret = identity.to_string().expose_secret().to_string();
        (recipient, RedactedString::new(secret))
    }

    fn recipient_config(armor: bool) -> AgeConfig {
        let (recipient, identity) = key_pair();
        AgeConfig::builder()
            .keys(
                KeyMaterial::builder()
                    .recipients(vec![recipient])
                    .identities(vec![identity])
                    .armor(armor)
                    .build(),
            )
            .build()
    }

    #[test]
    fn test_recipient_encryption_decrypts_with_identity() {
        for armor in [false, true] {
            let config = recipient_config(armor);
            let plaintext = b"Hello, World!".repeat(1000);
            let encrypted = config
                .encode(Cursor::new(&plaintext), Vec::new(), 1024)
                .unwrap();
            if armor {
                assert!(encrypted.starts_with(b"-----BEGIN AGE ENCRYPTED FILE-----"));
            } else {
                assert!(encrypted.starts_with(b"age-encryption.org/"));
            }
            let decrypted = config
                .decode(Cursor::new(encrypted), Vec::new(), 1024)
                .unwrap();
            assert_eq!(decrypted, plaintext);
        }
    }

    #[test]
    fn test_malformed_recipient_is_configuration_error() {
        let config = AgeConfig::builder()
            .keys(
                KeyMaterial::builder()
                    .recipients(vec!["age1-not-a-key".to_string()])
                    .build(),
            )
            .build();
        let err = config.build_encryptor(Vec::new()).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_wrong_identity_fails_as_corruption() {
        let sender = recipient_config(false);
        let encrypted = sender
            .encode(Cursor::new(b"secret".to_vec()), Vec::new(), 64)
            .unwrap();

        let receiver = recipient_config(false);
        let err = receiver
            .decode(Cursor::new(encrypted), Vec::new(), 64)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let config = recipient_config(false);
        let mut encrypted = config
            .encode(Cursor::new(vec![42u8; 10_000]), Vec::new(), 512)
            .unwrap();
        let last = encrypted.len() - 20;
        encrypted[last] ^= 0xff;
        let err = config
            .decode(Cursor::new(encrypted), Vec::new(), 512)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_identity_file_is_read() {
        let (recipient, identity) = key_pair();
        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("key.txt");
        std::fs::write(
            &file,
            format!("# created for a test\n{}\n", identity.expose()),
        )
        .unwrap();

        let config = AgeConfig::builder()
            .keys(
                KeyMaterial::builder()
                    .recipients(vec![recipient])
                    .identity_file(file)
                    .build(),
            )
            .build();
        let encrypted = config
            .encode(Cursor::new(b"payload".to_vec()), Vec::new(), 64)
            .unwrap();
        let decrypted = config
            .decode(Cursor::new(encrypted), Vec::new(), 64)
            .unwrap();
        assert_eq!(decrypted, b"payload");
    }

    #[test]
    fn test_passphrase_and_recipients_cannot_mix() {
        let (recipient, _) = key_pair();
        let config = AgeConfig::builder()
            .keys(
                KeyMaterial::builder()
                    .recipients(vec![recipient])
                    .passphrase(RedactedString::new("long_enough_pass"))
                    .build(),
            )
            .build();
        assert_eq!(
            config.build_encryptor_handle().err().unwrap().kind(),
            ErrorKind::Configuration
        );
    }
}
