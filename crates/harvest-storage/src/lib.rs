//! Persistence and I/O for the harvester: HTTP fetching, payload archive, job/object store, target catalog.

pub mod archive;
pub mod catalog;
pub mod http;
pub mod postgres;
pub mod store;

pub use archive::{ArchivedPayload, PayloadArchive};
pub use catalog::{CatalogClient, CatalogError, CatalogSchema, CkanActionClient, MemoryCatalog, SchemaField};
pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig,
    HttpFetcher, RetryDisposition, SimpleTokenBucket, TokenBucketConfig,
};
pub use postgres::PgHarvestStore;
pub use store::{HarvestStore, MemoryHarvestStore, StoreError};

pub const CRATE_NAME: &str = "harvest-storage";
