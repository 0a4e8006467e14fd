use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;

use crate::backup::next_backup::NextBackup;
use crate::backup::timer::{next_step, BackupTimer, TimerStep};

#[test]
fn next_step_fires_within_the_maximum() {
    let max = Duration::from_millis(u32::MAX as u64 - 1);
    let step = next_step(Duration::from_secs(60), max);
    assert!(step == TimerStep::Fire(Duration::from_secs(60)), "expected to fire after 60s, got {:?}", step);

    let step = next_step(max, max);
    assert!(step == TimerStep::Fire(max), "expected to fire at exactly the maximum, got {:?}", step);

    let step = next_step(Duration::ZERO, max);
    assert!(step == TimerStep::Fire(Duration::ZERO), "expected to fire right away, got {:?}", step);
}

#[test]
fn next_step_splits_waits_beyond_the_maximum() {
    let max = Duration::from_millis(u32::MAX as u64 - 1);
    // Sixty days is longer than the ~49.7 day maximum.
    let remaining = Duration::from_secs(60 * 24 * 3600);
    let step = next_step(remaining, max);
    assert!(step == TimerStep::Rearm(max), "expected a maximum wait, got {:?}", step);

    let step = next_step(remaining - max, max);
    assert!(step == TimerStep::Fire(remaining - max), "expected the remainder to fire, got {:?}", step);
}

#[tokio::test]
async fn timer_fires_with_its_backup() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(1);
    let next = NextBackup::after(7, true, Duration::from_millis(20), Utc::now());
    let _timer = BackupTimer::arm(next.clone(), Duration::from_secs(60), move |fired| async move {
        let _ = tx.send(fired).await;
    });

    let fired = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .context("timed out waiting for the timer")?
        .context("expected the timer to fire")?;
    assert!(fired == next, "expected the armed backup, got {:?}", fired);
    Ok(())
}

#[tokio::test]
async fn long_waits_are_decomposed_until_due() -> Result<()> {
    let (tx, mut rx) = mpsc::channel(1);
    let started = Instant::now();
    let next = NextBackup::after(7, false, Duration::from_millis(120), Utc::now());
    let _timer = BackupTimer::arm(next, Duration::from_millis(25), move |fired| async move {
        let _ = tx.send(fired).await;
    });

    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .context("timed out waiting for the timer")?
        .context("expected the timer to fire")?;
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "expected the timer to wait out the full span, fired after {:?}", elapsed);
    Ok(())
}

#[tokio::test]
async fn dropped_timer_never_fires() -> Result<()> {
    let (tx, mut rx) = mpsc::channel::<NextBackup>(1);
    let next = NextBackup::after(7, true, Duration::from_millis(30), Utc::now());
    let timer = BackupTimer::arm(next, Duration::from_secs(60), move |fired| async move {
        let _ = tx.send(fired).await;
    });
    drop(timer);

    let res = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
    assert!(matches!(res, Ok(None)), "expected the callback to be dropped unfired, got {:?}", res);
    Ok(())
}
