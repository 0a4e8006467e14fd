//! Streaming backups.
//!
//! An export is a gzip compressed stream of JSON lines: a header, the documents, the tombstones
//! of incremental exports, the compare exchange values and a footer. Incremental exports only
//! carry items written after the previous backup.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backup::encryption::EncryptingWriter;
use crate::cluster::{Cluster, CompareExchangeValue};
use crate::error::AppError;
use crate::instance::MASTER_KEY_LEN;
use crate::storage::{DocumentStore, StoredItem};

/// The number of items written between cancellation checks.
const CANCELLATION_CHECK_INTERVAL: usize = 1024;

/// One line of an export.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExportRecord {
    Header {
        database: String,
        is_full: bool,
        /// Items with an etag above this one are exported.
        start_etag: i64,
        /// Compare exchange values above this raft index are exported.
        start_raft_index: u64,
        created_at: DateTime<Utc>,
    },
    Document(StoredItem),
    Tombstone(StoredItem),
    CompareExchange {
        key: String,
        #[serde(flatten)]
        value: CompareExchangeValue,
    },
    Footer(ExportSummary),
}

/// The position captured by a backup, along with what it wrote.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub last_etag: i64,
    pub last_change_vector: Option<String>,
    pub last_raft_index: u64,
    pub documents: u64,
    pub tombstones: u64,
    pub compare_exchange: u64,
}

/// The output of a backup artifact, optionally encrypted.
pub enum OutputSink {
    Plain(BufWriter<File>),
    Encrypted(EncryptingWriter<BufWriter<File>>),
}

impl OutputSink {
    /// Create the artifact at the given path, which must not exist yet.
    pub fn create(path: &Path, key: Option<&[u8; MASTER_KEY_LEN]>) -> Result<Self> {
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("error creating backup file {}", path.display()))?;
        let file = BufWriter::new(file);
        Ok(match key {
            Some(key) => Self::Encrypted(EncryptingWriter::new(file, key)?),
            None => Self::Plain(file),
        })
    }

    /// Flush everything written and sync the file to disk.
    pub fn finish(self) -> Result<()> {
        let writer = match self {
            Self::Plain(writer) => writer,
            Self::Encrypted(writer) => writer.finish()?,
        };
        let file = writer.into_inner().map_err(|err| err.into_error()).context("error flushing backup file")?;
        file.sync_all().context("error syncing backup file")
    }
}

impl Write for OutputSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Self::Plain(writer) => writer.write(buf),
            Self::Encrypted(writer) => writer.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Self::Plain(writer) => writer.flush(),
            Self::Encrypted(writer) => writer.flush(),
        }
    }
}

/// The inputs of an export.
pub struct ExportRequest {
    pub database: String,
    pub store: DocumentStore,
    pub cluster: Cluster,
    pub is_full: bool,
    /// The last etag captured by the previous backup, exclusive.
    pub start_etag: Option<i64>,
    /// The last raft index captured by the previous backup, exclusive.
    pub start_raft_index: Option<u64>,
    pub token: CancellationToken,
}

fn write_record<W: Write>(out: &mut W, record: &ExportRecord) -> Result<()> {
    serde_json::to_writer(&mut *out, record).context("error serializing export record")?;
    out.write_all(b"\n").context("error writing export record")
}

/// Write an export into the given sink. This blocks, so run it on the blocking pool.
pub fn export_database(req: &ExportRequest, sink: OutputSink) -> Result<ExportSummary> {
    let (last_etag, last_change_vector) = req.store.read_last_etag_and_change_vector()?;
    let last_raft_index = req
        .cluster
        .read_database_record(&req.database)?
        .map(|(record, _)| record.etag_for_backup)
        .unwrap_or_default();
    let start_etag = if req.is_full { 0 } else { req.start_etag.unwrap_or_default() };
    let start_raft_index = if req.is_full { 0 } else { req.start_raft_index.unwrap_or_default() };

    let mut out = GzEncoder::new(sink, Compression::default());
    write_record(
        &mut out,
        &ExportRecord::Header {
            database: req.database.clone(),
            is_full: req.is_full,
            start_etag,
            start_raft_index,
            created_at: Utc::now(),
        },
    )?;

    let mut summary = ExportSummary {
        last_etag: last_etag.max(start_etag),
        last_change_vector,
        last_raft_index: last_raft_index.max(start_raft_index),
        ..Default::default()
    };
    for (seen, item) in req.store.items_after(start_etag).enumerate() {
        if seen % CANCELLATION_CHECK_INTERVAL == 0 && req.token.is_cancelled() {
            return Err(AppError::Cancelled.into());
        }
        let item = item?;
        // Writes which landed after the export started belong to the next backup.
        if item.etag > last_etag {
            break;
        }
        if !item.is_tombstone() {
            summary.documents += 1;
            write_record(&mut out, &ExportRecord::Document(item))?;
        } else if !req.is_full {
            summary.tombstones += 1;
            write_record(&mut out, &ExportRecord::Tombstone(item))?;
        }
    }

    for (key, value) in req.cluster.compare_exchange_values(&req.database)? {
        if value.index <= start_raft_index || value.index > summary.last_raft_index {
            continue;
        }
        summary.compare_exchange += 1;
        write_record(&mut out, &ExportRecord::CompareExchange { key, value })?;
    }
    if req.token.is_cancelled() {
        return Err(AppError::Cancelled.into());
    }

    write_record(&mut out, &ExportRecord::Footer(summary.clone()))?;
    let sink = out.finish().context("error finishing export compression")?;
    sink.finish()?;
    Ok(summary)
}
