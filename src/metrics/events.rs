//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in a replication
//! cycle. Events implement the `InternalEvent` trait which emits the
//! corresponding Prometheus metric.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Dump phase events
// ============================================================================

/// Event emitted when a source table has been exported and staged.
pub struct TableDumped {
    /// Uncompressed bytes exported from the source.
    pub bytes: u64,
}

impl InternalEvent for TableDumped {
    fn emit(self) {
        trace!(bytes = self.bytes, "Table dumped");
        counter!("pgshift_tables_dumped_total").increment(1);
        counter!("pgshift_dump_bytes_total").increment(self.bytes);
    }
}

/// Event emitted when a table dump finishes, successfully or not.
pub struct TableDumpDuration {
    pub duration: Duration,
}

impl InternalEvent for TableDumpDuration {
    fn emit(self) {
        trace!(duration_ms = self.duration.as_millis(), "Table dump duration");
        histogram!("pgshift_dump_duration_seconds").record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Refresh phase events
// ============================================================================

/// Outcome of a single table refresh.
#[derive(Debug, Clone, Copy)]
pub enum RefreshStatus {
    Success,
    Failed,
}

impl RefreshStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RefreshStatus::Success => "success",
            RefreshStatus::Failed => "failed",
        }
    }
}

/// Step of a table refresh at which a failure occurred.
#[derive(Debug, Clone, Copy)]
pub enum RefreshStage {
    StagingCreate,
    BulkLoad,
    Commit,
    Cleanup,
}

impl RefreshStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshStage::StagingCreate => "staging_create",
            RefreshStage::BulkLoad => "bulk_load",
            RefreshStage::Commit => "commit",
            RefreshStage::Cleanup => "cleanup",
        }
    }
}

/// Event emitted when a table refresh finishes.
pub struct TableRefreshed {
    pub status: RefreshStatus,
}

impl InternalEvent for TableRefreshed {
    fn emit(self) {
        trace!(status = self.status.as_str(), "Table refreshed");
        counter!("pgshift_tables_refreshed_total", "status" => self.status.as_str()).increment(1);
    }
}

/// Event emitted with the wall time of a table refresh.
pub struct TableRefreshDuration {
    pub duration: Duration,
}

impl InternalEvent for TableRefreshDuration {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            "Table refresh duration"
        );
        histogram!("pgshift_refresh_duration_seconds").record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a refresh step fails.
pub struct RefreshStageFailed {
    pub stage: RefreshStage,
}

impl InternalEvent for RefreshStageFailed {
    fn emit(self) {
        trace!(stage = self.stage.as_str(), "Refresh stage failed");
        counter!("pgshift_refresh_failures_total", "stage" => self.stage.as_str()).increment(1);
    }
}

/// Event emitted when the number of in-flight table refreshes changes.
pub struct ActiveRefreshes {
    pub count: usize,
}

impl InternalEvent for ActiveRefreshes {
    fn emit(self) {
        trace!(count = self.count, "Active refreshes");
        gauge!("pgshift_active_refreshes").set(self.count as f64);
    }
}

/// Event emitted after post-refresh maintenance.
pub struct MaintenanceCompleted {
    pub status: RequestStatus,
    pub duration: Duration,
}

impl InternalEvent for MaintenanceCompleted {
    fn emit(self) {
        trace!(
            status = self.status.as_str(),
            duration_ms = self.duration.as_millis(),
            "Maintenance completed"
        );
        counter!("pgshift_maintenance_runs_total", "status" => self.status.as_str()).increment(1);
        histogram!("pgshift_maintenance_duration_seconds").record(self.duration.as_secs_f64());
    }
}

// ============================================================================
// Storage operation events
// ============================================================================

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Get,
    Put,
    CreateMultipart,
    PutPart,
    CompleteMultipart,
}

impl StorageOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Get => "get",
            StorageOperation::Put => "put",
            StorageOperation::CreateMultipart => "create_multipart",
            StorageOperation::PutPart => "put_part",
            StorageOperation::CompleteMultipart => "complete_multipart",
        }
    }
}

/// Status of a request.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    pub fn from_result<T, E>(result: &Result<T, E>) -> Self {
        if result.is_ok() {
            RequestStatus::Success
        } else {
            RequestStatus::Error
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted when a storage request completes.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "pgshift_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when a storage request completes with duration.
pub struct StorageRequestDuration {
    pub operation: StorageOperation,
    pub duration: Duration,
}

impl InternalEvent for StorageRequestDuration {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            duration_ms = self.duration.as_millis(),
            "Storage request duration"
        );
        histogram!(
            "pgshift_storage_request_duration_seconds",
            "operation" => self.operation.as_str()
        )
        .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when the number of in-flight multipart parts changes.
pub struct ActiveMultipartParts {
    pub count: usize,
}

impl InternalEvent for ActiveMultipartParts {
    fn emit(self) {
        trace!(count = self.count, "Active multipart parts");
        gauge!("pgshift_active_multipart_parts").set(self.count as f64);
    }
}

/// Event emitted when a multipart upload completes.
pub struct MultipartUploadCompleted;

impl InternalEvent for MultipartUploadCompleted {
    fn emit(self) {
        trace!("Multipart upload completed");
        counter!("pgshift_multipart_uploads_total").increment(1);
    }
}
