pub mod api;
pub mod pipeline;
pub mod runtime;

pub use api::{DocumentClient, FetchError, HttpResponse, HttpTransport};
pub use pipeline::backoff::BackoffPolicy;
pub use pipeline::batch::{EntityFailure, FailurePolicy};
pub use pipeline::pivot::{format_grouped, reorder_rows, PivotRow, PivotTable};
pub use runtime::config::{PipelineConfig, PipelineConfigBuilder, PipelineConfigParams, Selection};
pub use runtime::runner::{Pipeline, PipelineOutcome, PivotReport};
pub use runtime::telemetry::{init_tracing, Telemetry, TelemetrySnapshot};
