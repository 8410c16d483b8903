//! Census data service client: document model, authentication, retry state
//! machine, request metrics, and the HTTP transport seam.

pub mod auth;
pub mod client;
pub mod document;
pub mod metrics;
pub mod options;
pub mod retry;

pub use client::{
    DocumentClient, FetchError, FetchedDocument, HttpResponse, HttpTransport, ReqwestTransport,
};
pub use document::{parse_document, Cell, Document, EntityId, MergedDocument, RawDocument};
pub use metrics::RequestMetricsSnapshot;
pub use options::ClientOptions;
pub use retry::{FetchEvent, FetchState};
