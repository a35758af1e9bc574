//! Client metrics
//!
//! Counters are emitted through the `metrics` facade; installing a recorder
//! (Prometheus or otherwise) is up to the embedding process.

use metrics::{counter, describe_counter};

/// Metric names as constants
pub mod names {
    pub const SHARDS_UPLOADED: &str = "nebula_shards_uploaded_total";
    pub const SHARDS_FETCH_FAILED: &str = "nebula_shards_fetch_failed_total";
    pub const UPLOAD_BYTES: &str = "nebula_upload_bytes_total";
    pub const DOWNLOAD_BYTES: &str = "nebula_download_bytes_total";
}

/// Register metric descriptions with the installed recorder
pub fn describe_metrics() {
    describe_counter!(names::SHARDS_UPLOADED, "Shards and replica copies acknowledged by nodes");
    describe_counter!(
        names::SHARDS_FETCH_FAILED,
        "Shard fetches that failed or returned corrupt bytes"
    );
    describe_counter!(names::UPLOAD_BYTES, "Piece bytes sent to storage nodes");
    describe_counter!(names::DOWNLOAD_BYTES, "File bytes written by completed downloads");
}

pub(crate) fn record_shard_uploaded(bytes: u64) {
    counter!(names::SHARDS_UPLOADED).increment(1);
    counter!(names::UPLOAD_BYTES).increment(bytes);
}

pub(crate) fn record_fetch_failed() {
    counter!(names::SHARDS_FETCH_FAILED).increment(1);
}

pub(crate) fn record_download(bytes: u64) {
    counter!(names::DOWNLOAD_BYTES).increment(bytes);
}
