use anyhow::Result;

use crate::change_vector::{self, ConflictStatus};

#[test]
fn parse_reads_every_entry() -> Result<()> {
    let entries = change_vector::parse("A:10-dbA, B:25-dbB")?;
    assert!(entries.len() == 2, "expected 2 entries got {}", entries.len());
    assert!(entries[0].node_tag == "A" && entries[0].etag == 10 && entries[0].db_id == "dbA", "unexpected first entry {:?}", entries[0]);
    assert!(entries[1].etag == 25, "expected etag 25 got {}", entries[1].etag);
    let rendered = change_vector::format(&entries);
    assert!(rendered == "A:10-dbA, B:25-dbB", "unexpected rendering {}", rendered);
    Ok(())
}

#[test]
fn parse_rejects_malformed_entries() {
    assert!(change_vector::parse("A10-dbA").is_err(), "expected missing colon to fail");
    assert!(change_vector::parse("A:10dbA").is_err(), "expected missing dash to fail");
    assert!(change_vector::parse("A:x-dbA").is_err(), "expected non numeric etag to fail");
}

#[test]
fn etag_by_id_defaults_to_zero() {
    let cv = Some("A:10-dbA, B:25-dbB");
    assert!(change_vector::etag_by_id(cv, "dbB") == 25, "expected etag of dbB to be 25");
    assert!(change_vector::etag_by_id(cv, "dbC") == 0, "expected missing id to be 0");
    assert!(change_vector::etag_by_id(None, "dbA") == 0, "expected missing vector to be 0");
}

#[test]
fn distance_is_signed() {
    let ahead = Some("A:1000-dbA");
    let behind = Some("A:100-dbA");
    assert!(change_vector::distance(ahead, behind) == 900, "expected distance 900");
    assert!(change_vector::distance(behind, ahead) == -900, "expected distance -900");
    assert!(change_vector::distance(ahead, None) == 1000, "expected distance to an empty vector to be the full etag");
}

#[test]
fn conflict_status_classifies_vectors() {
    let status = change_vector::conflict_status(Some("A:10-dbA, B:5-dbB"), Some("A:9-dbA, B:5-dbB"));
    assert!(status == ConflictStatus::Update, "expected Update got {:?}", status);
    let status = change_vector::conflict_status(Some("A:10-dbA"), Some("A:10-dbA, B:1-dbB"));
    assert!(status == ConflictStatus::AlreadyMerged, "expected AlreadyMerged got {:?}", status);
    let status = change_vector::conflict_status(Some("A:11-dbA, B:1-dbB"), Some("A:10-dbA, B:2-dbB"));
    assert!(status == ConflictStatus::Conflict, "expected Conflict got {:?}", status);
}

#[test]
fn merge_keeps_highest_etags() {
    let merged = change_vector::merge(Some("A:10-dbA, B:3-dbB"), Some("B:7-dbB, C:1-dbC"));
    assert!(merged == "A:10-dbA, B:7-dbB, C:1-dbC", "unexpected merge result {}", merged);
}
