use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use crate::backup::files;
use crate::backup::retention::{LocalRetentionPolicyRunner, RetentionParameters, RetentionStrategy};
use crate::models::backup::{BackupType, RetentionPolicy};

/// Create one backup folder per age in days, returning their names newest first.
fn create_folders(root: &Path, now: DateTime<Utc>, ages_in_days: &[i64]) -> Result<Vec<String>> {
    let mut names = vec![];
    for age in ages_in_days {
        let date = files::format_date(now - ChronoDuration::days(*age));
        let name = files::folder_name(&date, "db", "A", BackupType::Backup);
        std::fs::create_dir_all(root.join(&name))?;
        std::fs::write(root.join(&name).join(format!("{}.{}", date, files::FULL_BACKUP_EXTENSION)), b"data")?;
        names.push(name);
    }
    Ok(names)
}

fn params(root: &Path, policy: RetentionPolicy, is_full: bool, now: DateTime<Utc>) -> RetentionParameters {
    RetentionParameters {
        retention_policy: Some(policy),
        folder_path: root.to_path_buf(),
        database: "db".into(),
        is_full,
        now,
        token: CancellationToken::new(),
    }
}

fn remaining(root: &Path) -> Result<Vec<String>> {
    let mut names = vec![];
    for entry in std::fs::read_dir(root)? {
        names.push(entry?.file_name().to_string_lossy().to_string());
    }
    names.sort();
    Ok(names)
}

#[test]
fn keeps_at_most_the_configured_number_of_backups() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let now = Utc::now();
    let names = create_folders(tmp.path(), now, &[0, 1, 2, 3])?;
    let policy = RetentionPolicy {
        max_backups_to_keep: Some(2),
        ..Default::default()
    };

    let mut deleted = LocalRetentionPolicyRunner.execute(&params(tmp.path(), policy, true, now))?;

    deleted.sort();
    let mut expected = vec![names[2].clone(), names[3].clone()];
    expected.sort();
    assert!(deleted == expected, "expected the two oldest folders to be deleted, got {:?}", deleted);
    let mut kept = vec![names[0].clone(), names[1].clone()];
    kept.sort();
    let left = remaining(tmp.path())?;
    assert!(left == kept, "expected the two newest folders to remain, got {:?}", left);
    Ok(())
}

#[test]
fn deletes_backups_older_than_the_minimum_age_but_never_the_newest() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let now = Utc::now();
    let names = create_folders(tmp.path(), now, &[10, 20, 30])?;
    let policy = RetentionPolicy {
        minimum_backup_age_to_keep: Some(Duration::from_secs(15 * 24 * 3600)),
        ..Default::default()
    };

    let deleted = LocalRetentionPolicyRunner.execute(&params(tmp.path(), policy, true, now))?;

    assert!(deleted.len() == 2, "expected two folders to be deleted, got {:?}", deleted);
    let left = remaining(tmp.path())?;
    assert!(left == vec![names[0].clone()], "expected only the newest folder to remain, got {:?}", left);

    // Even an expired newest backup is kept.
    let tmp = tempfile::tempdir()?;
    let names = create_folders(tmp.path(), now, &[40])?;
    let policy = RetentionPolicy {
        minimum_backup_age_to_keep: Some(Duration::from_secs(24 * 3600)),
        ..Default::default()
    };
    let deleted = LocalRetentionPolicyRunner.execute(&params(tmp.path(), policy, true, now))?;
    assert!(deleted.is_empty(), "expected the newest backup to be kept, got {:?}", deleted);
    assert!(remaining(tmp.path())? == names, "expected the only folder to remain");
    Ok(())
}

#[test]
fn retention_only_follows_enabled_policies_on_full_backups() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let now = Utc::now();
    create_folders(tmp.path(), now, &[0, 1, 2])?;
    let policy = RetentionPolicy {
        max_backups_to_keep: Some(1),
        ..Default::default()
    };

    let deleted = LocalRetentionPolicyRunner.execute(&params(tmp.path(), policy.clone(), false, now))?;
    assert!(deleted.is_empty(), "expected incremental backups to skip retention, got {:?}", deleted);

    let disabled = RetentionPolicy { disabled: true, ..policy };
    let deleted = LocalRetentionPolicyRunner.execute(&params(tmp.path(), disabled, true, now))?;
    assert!(deleted.is_empty(), "expected a disabled policy to delete nothing, got {:?}", deleted);

    let zero_age = RetentionPolicy {
        minimum_backup_age_to_keep: Some(Duration::ZERO),
        ..Default::default()
    };
    let deleted = LocalRetentionPolicyRunner.execute(&params(tmp.path(), zero_age, true, now))?;
    assert!(deleted.is_empty(), "expected a zero minimum age to place no constraint, got {:?}", deleted);
    assert!(remaining(tmp.path())?.len() == 3, "expected every folder to remain");
    Ok(())
}

#[test]
fn foreign_and_legacy_folders_are_told_apart() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let now = Utc::now();
    create_folders(tmp.path(), now, &[0])?;
    let legacy = format!("{}.ravendb-db-B-snapshot", (now - ChronoDuration::days(3)).format(files::LEGACY_DATE_TIME_FORMAT));
    std::fs::create_dir_all(tmp.path().join(&legacy))?;
    let foreign = files::folder_name(&files::format_date(now - ChronoDuration::days(5)), "other", "A", BackupType::Backup);
    std::fs::create_dir_all(tmp.path().join(&foreign))?;
    std::fs::create_dir_all(tmp.path().join("notes"))?;
    let policy = RetentionPolicy {
        max_backups_to_keep: Some(1),
        ..Default::default()
    };

    let deleted = LocalRetentionPolicyRunner.execute(&params(tmp.path(), policy, true, now))?;

    assert!(deleted == vec![legacy], "expected only the legacy folder of the database to be deleted, got {:?}", deleted);
    let left = remaining(tmp.path())?;
    assert!(left.contains(&foreign) && left.contains(&"notes".to_string()), "expected foreign folders to remain, got {:?}", left);
    Ok(())
}

#[test]
fn cancelled_retention_stops() -> Result<()> {
    let tmp = tempfile::tempdir()?;
    let now = Utc::now();
    create_folders(tmp.path(), now, &[0, 1, 2])?;
    let policy = RetentionPolicy {
        max_backups_to_keep: Some(1),
        ..Default::default()
    };
    let params = params(tmp.path(), policy, true, now);
    params.token.cancel();

    let res = LocalRetentionPolicyRunner.execute(&params);

    let err = res.expect_err("expected a cancelled retention run to fail");
    assert!(crate::error::is_cancellation(&err), "expected a cancellation, got {:?}", err);
    assert!(remaining(tmp.path())?.len() == 3, "expected nothing to be deleted");
    Ok(())
}
