use std::io::Write;
use std::path::Path;

use anyhow::Result;

use crate::backup::encryption::{decrypt, is_backup_encrypted, resolve_backup_key, EncryptingWriter, ENCRYPTED_MAGIC};
use crate::error::AppError;
use crate::fixtures::backup_config;
use crate::models::backup::{BackupEncryptionSettings, BackupType, EncryptionMode, PeriodicBackupConfiguration};

const MASTER_KEY: [u8; 32] = [7; 32];

fn config_with(mode: Option<EncryptionMode>, key: Option<String>) -> PeriodicBackupConfiguration {
    let mut cfg = backup_config(1, Path::new("/tmp/backups"), Some("0 0 * * *"), None);
    cfg.backup_encryption_settings = mode.map(|encryption_mode| BackupEncryptionSettings { encryption_mode, key });
    cfg
}

fn is_invalid_config(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<AppError>(), Some(AppError::InvalidConfig(_)))
}

#[test]
fn encryption_follows_the_master_key_and_mode() {
    let cases = [
        (None, None, false),
        (Some(&MASTER_KEY), None, true),
        (None, Some(EncryptionMode::None), false),
        (Some(&MASTER_KEY), Some(EncryptionMode::None), false),
        (None, Some(EncryptionMode::UseProvidedKey), true),
        (Some(&MASTER_KEY), Some(EncryptionMode::UseDatabaseKey), true),
    ];
    for (master_key, mode, expected) in cases {
        let cfg = config_with(mode, None);
        let encrypted = is_backup_encrypted(master_key, &cfg);
        assert!(
            encrypted == expected,
            "expected encrypted={} with master key {} and mode {:?}",
            expected,
            master_key.is_some(),
            mode
        );
    }
}

#[test]
fn database_key_is_used_when_present() -> Result<()> {
    let key = resolve_backup_key(Some(&MASTER_KEY), &config_with(None, None), true)?;
    assert!(key == Some(MASTER_KEY), "expected the master key, got {:?}", key);

    let key = resolve_backup_key(Some(&MASTER_KEY), &config_with(Some(EncryptionMode::UseDatabaseKey), None), false)?;
    assert!(key == Some(MASTER_KEY), "expected the master key, got {:?}", key);

    let key = resolve_backup_key(None, &config_with(None, None), true)?;
    assert!(key.is_none(), "expected a plain backup without a master key, got {:?}", key);
    Ok(())
}

#[test]
fn database_key_without_a_master_key_is_rejected() {
    let res = resolve_backup_key(None, &config_with(Some(EncryptionMode::UseDatabaseKey), None), true);
    let err = res.expect_err("expected the missing database key to be rejected");
    assert!(is_invalid_config(&err), "expected InvalidConfig, got {:?}", err);
    assert!(err.to_string().contains("the key doesn't exist"), "expected the missing key message, got {}", err);
}

#[test]
fn provided_key_is_decoded_and_validated() -> Result<()> {
    let provided = [9u8; 32];
    let cfg = config_with(Some(EncryptionMode::UseProvidedKey), Some(base64::encode(provided)));
    let key = resolve_backup_key(None, &cfg, true)?;
    assert!(key == Some(provided), "expected the provided key, got {:?}", key);

    for bad in [None, Some("not base64!".to_string()), Some(base64::encode([1u8; 16]))] {
        let cfg = config_with(Some(EncryptionMode::UseProvidedKey), bad.clone());
        let err = resolve_backup_key(None, &cfg, true).expect_err("expected a bad provided key to be rejected");
        assert!(is_invalid_config(&err), "expected InvalidConfig for key {:?}, got {:?}", bad, err);
    }
    Ok(())
}

#[test]
fn full_snapshots_cannot_use_a_provided_key() -> Result<()> {
    let mut cfg = config_with(Some(EncryptionMode::UseProvidedKey), Some(base64::encode([9u8; 32])));
    cfg.backup_type = BackupType::Snapshot;
    let err = resolve_backup_key(Some(&MASTER_KEY), &cfg, true).expect_err("expected a full snapshot with a provided key to be rejected");
    assert!(is_invalid_config(&err), "expected InvalidConfig, got {:?}", err);

    // Incrementals of a snapshot task are regular exports.
    let key = resolve_backup_key(Some(&MASTER_KEY), &cfg, false)?;
    assert!(key == Some([9u8; 32]), "expected the provided key for an incremental, got {:?}", key);
    Ok(())
}

#[test]
fn encrypted_stream_decrypts_across_chunks() -> Result<()> {
    let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let mut writer = EncryptingWriter::new(Vec::new(), &MASTER_KEY)?;
    writer.write_all(&data)?;
    let encrypted = writer.finish()?;

    assert!(encrypted.starts_with(ENCRYPTED_MAGIC), "expected the encryption header");
    assert!(
        !encrypted.windows(64).any(|window| window == &data[..64]),
        "expected no plaintext in the encrypted output"
    );
    let decrypted = decrypt(&encrypted, &MASTER_KEY)?;
    assert!(decrypted == data, "expected the round trip to restore {} bytes, got {}", data.len(), decrypted.len());

    let err = decrypt(&encrypted, &[8; 32]);
    assert!(err.is_err(), "expected decryption with another key to fail");
    Ok(())
}

#[test]
fn tampered_or_truncated_streams_are_rejected() -> Result<()> {
    let mut writer = EncryptingWriter::new(Vec::new(), &MASTER_KEY)?;
    writer.write_all(&vec![42u8; 100_000])?;
    let encrypted = writer.finish()?;

    let mut tampered = encrypted.clone();
    let last = tampered.len() - 1;
    tampered[last] ^= 0xff;
    assert!(decrypt(&tampered, &MASTER_KEY).is_err(), "expected a tampered stream to be rejected");

    // Dropping the final chunk must not look like a complete stream.
    let first_chunk_len = ENCRYPTED_MAGIC.len() + 24 + 4 + 64 * 1024 + 16;
    let truncated = &encrypted[..first_chunk_len];
    assert!(decrypt(truncated, &MASTER_KEY).is_err(), "expected a truncated stream to be rejected");
    Ok(())
}
