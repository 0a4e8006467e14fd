use std::time::Duration;

use anyhow::Result;

use crate::backup::counter::ConcurrentBackupsCounter;
use crate::error::backup_delay;

#[test]
fn starts_beyond_the_ceiling_are_delayed() -> Result<()> {
    let counter = ConcurrentBackupsCounter::new(2, Duration::from_secs(60));
    let first = counter.start_backup("first")?;
    let _second = counter.start_backup("second")?;
    assert!(counter.running() == 2, "expected 2 running backups, got {}", counter.running());

    let err = match counter.start_backup("third") {
        Ok(_) => panic!("expected the third backup to be rejected"),
        Err(err) => err,
    };
    let delay = backup_delay(&err);
    assert!(delay == Some(Duration::from_secs(60)), "expected a 60s delay, got {:?}", delay);
    let message = err.to_string();
    assert!(
        message.contains("'third'") && message.contains("Backup.MaxNumberOfConcurrentBackups is: 2"),
        "expected the rejection to name the task and the ceiling, got {}",
        message
    );

    drop(first);
    assert!(counter.running() == 1, "expected a released slot, got {} running", counter.running());
    let _third = counter.start_backup("third")?;
    assert!(counter.running() == 2, "expected the freed slot to be reused, got {} running", counter.running());
    Ok(())
}

#[test]
fn clones_share_the_same_slots() -> Result<()> {
    let counter = ConcurrentBackupsCounter::new(1, Duration::from_millis(200));
    let other = counter.clone();
    let _permit = counter.start_backup("first")?;
    assert!(other.start_backup("second").is_err(), "expected clones to share the ceiling");
    Ok(())
}
