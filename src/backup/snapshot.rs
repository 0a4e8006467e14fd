//! Snapshot backups.
//!
//! A snapshot is a zip archive holding the database record and cluster values in
//! `Settings.json`, followed by one folder per storage environment: `Documents/`, `Indexes/`
//! and `Configuration/`.
//!
//! Plain archives are written straight into the artifact. Encrypted archives are staged in an
//! anonymous file next to it, since the zip writer has to seek back over what it wrote.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::backup::export::{ExportSummary, OutputSink};
use crate::cluster::{Cluster, CompareExchangeValue};
use crate::error::AppError;
use crate::models::backup::{SnapshotCompressionLevel, SnapshotSettings};
use crate::models::topology::DatabaseRecord;
use crate::storage::DocumentStore;

pub const SETTINGS_ENTRY: &str = "Settings.json";
pub const DOCUMENTS_FOLDER: &str = "Documents/";
pub const INDEXES_FOLDER: &str = "Indexes/";
pub const CONFIGURATION_FOLDER: &str = "Configuration/";
const DOCUMENTS_ENTRY: &str = "Documents/items.jsonl";
const CONFIGURATION_ENTRY: &str = "Configuration/settings.json";

const CANCELLATION_CHECK_INTERVAL: usize = 1024;

#[derive(Serialize)]
struct SnapshotSettingsEntry<'a> {
    database_record: &'a DatabaseRecord,
    /// Every cluster value of the database keyed by item name.
    database_values: BTreeMap<String, serde_json::Value>,
    compare_exchange: BTreeMap<String, CompareExchangeValue>,
}

/// The inputs of a snapshot.
pub struct SnapshotRequest {
    pub database: String,
    pub store: DocumentStore,
    pub cluster: Cluster,
    pub settings: SnapshotSettings,
    pub token: CancellationToken,
    /// Where encrypted archives are staged before encryption.
    pub staging_dir: PathBuf,
}

fn file_options(level: SnapshotCompressionLevel) -> FileOptions {
    let options = FileOptions::default();
    match level {
        SnapshotCompressionLevel::Optimal => options.compression_method(CompressionMethod::Deflated),
        SnapshotCompressionLevel::Fastest => options.compression_method(CompressionMethod::Deflated).compression_level(Some(1)),
        SnapshotCompressionLevel::NoCompression => options.compression_method(CompressionMethod::Stored),
    }
}

/// Write a full snapshot into the given sink. This blocks, so run it on the blocking pool.
pub fn snapshot_database(req: &SnapshotRequest, sink: OutputSink) -> Result<ExportSummary> {
    let (record, _) = req
        .cluster
        .read_database_record(&req.database)?
        .ok_or_else(|| AppError::ResourceNotFound(format!("database record of {}", req.database)))?;
    let (last_etag, last_change_vector) = req.store.read_last_etag_and_change_vector()?;
    let mut summary = ExportSummary {
        last_etag,
        last_change_vector,
        last_raft_index: record.etag_for_backup,
        ..Default::default()
    };

    match sink {
        OutputSink::Plain(file) => {
            let file = write_archive(req, &record, file, &mut summary)?;
            OutputSink::Plain(file).finish()?;
        }
        OutputSink::Encrypted(mut writer) => {
            let staging = tempfile::tempfile_in(&req.staging_dir)
                .with_context(|| format!("error creating snapshot staging file in {}", req.staging_dir.display()))?;
            let staging = write_archive(req, &record, BufWriter::new(staging), &mut summary)?;
            let mut staging: File = staging.into_inner().map_err(|err| err.into_error()).context("error flushing snapshot staging file")?;
            staging.seek(SeekFrom::Start(0)).context("error rewinding snapshot staging file")?;
            io::copy(&mut staging, &mut writer).context("error encrypting snapshot archive")?;
            OutputSink::Encrypted(writer).finish()?;
        }
    }
    Ok(summary)
}

fn write_archive<W: Write + Seek>(req: &SnapshotRequest, record: &DatabaseRecord, out: W, summary: &mut ExportSummary) -> Result<W> {
    let options = file_options(req.settings.compression_level);
    let mut zip = ZipWriter::new(out);

    let compare_exchange: BTreeMap<String, CompareExchangeValue> = req.cluster.compare_exchange_values(&req.database)?.into_iter().collect();
    summary.compare_exchange = compare_exchange.len() as u64;
    let settings = SnapshotSettingsEntry {
        database_record: record,
        database_values: req.cluster.read_database_values(&req.database)?.into_iter().collect(),
        compare_exchange,
    };
    zip.start_file(SETTINGS_ENTRY, options).context("error starting snapshot settings entry")?;
    serde_json::to_writer_pretty(&mut zip, &settings).context("error writing snapshot settings")?;

    zip.add_directory(DOCUMENTS_FOLDER, options).context("error adding snapshot documents folder")?;
    zip.start_file(DOCUMENTS_ENTRY, options).context("error starting snapshot documents entry")?;
    for (seen, item) in req.store.items_after(0).enumerate() {
        if seen % CANCELLATION_CHECK_INTERVAL == 0 && req.token.is_cancelled() {
            return Err(AppError::Cancelled.into());
        }
        let item = item?;
        if item.etag > summary.last_etag {
            break;
        }
        if item.is_tombstone() {
            summary.tombstones += 1;
        } else {
            summary.documents += 1;
        }
        serde_json::to_writer(&mut zip, &item).context("error writing snapshot item")?;
        zip.write_all(b"\n").context("error writing snapshot item")?;
    }

    if !req.settings.exclude_indexes {
        zip.add_directory(INDEXES_FOLDER, options).context("error adding snapshot indexes folder")?;
        for (name, definition) in record.auto_indexes.iter() {
            zip.start_file(format!("{}{}.json", INDEXES_FOLDER, name), options)
                .context("error starting snapshot index entry")?;
            serde_json::to_writer_pretty(&mut zip, definition).context("error writing snapshot index")?;
        }
    }

    zip.add_directory(CONFIGURATION_FOLDER, options)
        .context("error adding snapshot configuration folder")?;
    zip.start_file(CONFIGURATION_ENTRY, options)
        .context("error starting snapshot configuration entry")?;
    serde_json::to_writer_pretty(&mut zip, &record.settings).context("error writing snapshot configuration")?;

    if req.token.is_cancelled() {
        return Err(AppError::Cancelled.into());
    }
    zip.finish().context("error finishing snapshot archive")
}
