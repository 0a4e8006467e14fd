//! Backup encryption.
//!
//! Encrypted artifacts start with a magic header followed by a sequence of chunks. Each chunk is
//! a random 24 byte nonce, a big-endian `u32` length and the XChaCha20-Poly1305 ciphertext of up
//! to 64KiB of plaintext. The high bit of the length marks the final chunk. The chunk index and
//! the final flag are bound to each chunk as associated data, so reordered or truncated streams
//! fail to decrypt.

use std::io::Write;

use anyhow::{Context, Result};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;

use crate::error::AppError;
use crate::instance::MASTER_KEY_LEN;
use crate::models::backup::{BackupType, EncryptionMode, PeriodicBackupConfiguration};

/// The header of every encrypted artifact.
pub const ENCRYPTED_MAGIC: &[u8; 8] = b"WRDNENC1";
const CHUNK_SIZE: usize = 64 * 1024;
const NONCE_LEN: usize = 24;
const FINAL_CHUNK_FLAG: u32 = 1 << 31;

/// Whether backups of this task are encrypted, given the database's master key.
pub fn is_backup_encrypted(master_key: Option<&[u8; MASTER_KEY_LEN]>, configuration: &PeriodicBackupConfiguration) -> bool {
    match (master_key, configuration.encryption_mode()) {
        (Some(_), None) => true,
        (_, Some(mode)) => mode != EncryptionMode::None,
        (None, None) => false,
    }
}

/// Resolve the key backups of this task are encrypted with, `None` for plain backups.
///
/// Fails with `InvalidConfig` before any data is written when the settings cannot be honored.
pub fn resolve_backup_key(
    master_key: Option<&[u8; MASTER_KEY_LEN]>, configuration: &PeriodicBackupConfiguration, is_full: bool,
) -> Result<Option<[u8; MASTER_KEY_LEN]>> {
    let mode = configuration.encryption_mode();
    if master_key.is_none() && mode == Some(EncryptionMode::UseDatabaseKey) {
        return Err(AppError::InvalidConfig("Can't use database key for backup encryption, the key doesn't exist".into()).into());
    }
    if configuration.backup_type == BackupType::Snapshot && is_full && mode == Some(EncryptionMode::UseProvidedKey) {
        return Err(AppError::InvalidConfig("Can't snapshot an encrypted database with a different key".into()).into());
    }
    if !is_backup_encrypted(master_key, configuration) {
        return Ok(None);
    }

    match mode {
        None | Some(EncryptionMode::UseDatabaseKey) => Ok(master_key.copied()),
        Some(EncryptionMode::UseProvidedKey) => {
            let key = configuration
                .backup_encryption_settings
                .as_ref()
                .and_then(|settings| settings.key.as_deref())
                .filter(|key| !key.is_empty())
                .ok_or_else(|| AppError::InvalidConfig("a backup encryption key must be provided when using a provided key".into()))?;
            decode_key(key).map(Some)
        }
        Some(EncryptionMode::None) => Ok(None),
    }
}

fn decode_key(key: &str) -> Result<[u8; MASTER_KEY_LEN]> {
    let raw = base64::decode(key).map_err(|err| AppError::InvalidConfig(format!("the backup encryption key is not valid base64: {}", err)))?;
    <[u8; MASTER_KEY_LEN]>::try_from(raw.as_slice()).map_err(|_| {
        AppError::InvalidConfig(format!(
            "the backup encryption key must be {} bytes long, got {}",
            MASTER_KEY_LEN,
            raw.len()
        ))
        .into()
    })
}

fn associated_data(index: u64, is_final: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = is_final as u8;
    aad
}

/// A writer encrypting everything written through it.
///
/// `finish` must be called to emit the final chunk.
pub struct EncryptingWriter<W: Write> {
    inner: W,
    cipher: XChaCha20Poly1305,
    buf: Vec<u8>,
    index: u64,
}

impl<W: Write> EncryptingWriter<W> {
    pub fn new(mut inner: W, key: &[u8; MASTER_KEY_LEN]) -> Result<Self> {
        inner.write_all(ENCRYPTED_MAGIC).context("error writing encryption header")?;
        Ok(Self {
            inner,
            cipher: XChaCha20Poly1305::new(Key::from_slice(key)),
            buf: Vec::with_capacity(CHUNK_SIZE),
            index: 0,
        })
    }

    fn write_chunk(&mut self, is_final: bool) -> std::io::Result<()> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let aad = associated_data(self.index, is_final);
        let ciphertext = self
            .cipher
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: &self.buf, aad: &aad })
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "error encrypting backup chunk"))?;
        let mut len = ciphertext.len() as u32;
        if is_final {
            len |= FINAL_CHUNK_FLAG;
        }
        self.inner.write_all(&nonce)?;
        self.inner.write_all(&len.to_be_bytes())?;
        self.inner.write_all(&ciphertext)?;
        self.buf.clear();
        self.index += 1;
        Ok(())
    }

    /// Write the final chunk and return the inner writer.
    pub fn finish(mut self) -> Result<W> {
        self.write_chunk(true).context("error writing final encrypted chunk")?;
        self.inner.flush().context("error flushing encrypted output")?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for EncryptingWriter<W> {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        if self.buf.len() == CHUNK_SIZE {
            self.write_chunk(false)?;
        }
        let take = data.len().min(CHUNK_SIZE - self.buf.len());
        self.buf.extend_from_slice(&data[..take]);
        Ok(take)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Decrypt a complete encrypted artifact.
#[cfg(test)]
pub fn decrypt(data: &[u8], key: &[u8; MASTER_KEY_LEN]) -> Result<Vec<u8>> {
    use anyhow::anyhow;

    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let mut rest = data
        .strip_prefix(ENCRYPTED_MAGIC.as_slice())
        .ok_or_else(|| anyhow!("missing encryption header"))?;
    let (mut out, mut index) = (vec![], 0u64);
    loop {
        if rest.len() < NONCE_LEN + 4 {
            return Err(anyhow!("truncated encrypted stream"));
        }
        let (nonce, tail) = rest.split_at(NONCE_LEN);
        let (len, tail) = tail.split_at(4);
        let len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]);
        let is_final = len & FINAL_CHUNK_FLAG != 0;
        let len = (len & !FINAL_CHUNK_FLAG) as usize;
        if tail.len() < len {
            return Err(anyhow!("truncated encrypted chunk"));
        }
        let (ciphertext, tail) = tail.split_at(len);
        let aad = associated_data(index, is_final);
        let plain = cipher
            .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad: &aad })
            .map_err(|_| anyhow!("error decrypting chunk {}", index))?;
        out.extend_from_slice(&plain);
        index += 1;
        rest = tail;
        if is_final {
            return Ok(out);
        }
    }
}
