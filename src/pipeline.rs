//! Batch fetching, merging and pivoting of census documents.

pub mod backoff;
pub mod batch;
pub mod merge;
pub mod pivot;

pub use backoff::BackoffPolicy;
pub use batch::{fetch_all, BatchOutcome, EntityFailure, FailurePolicy, MergedBatch};
pub use merge::{merge, Merger};
pub use pivot::{pivot, pivot_measures, reorder_rows, PivotRow, PivotTable};
