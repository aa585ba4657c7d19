//! Page fetching and persistence for pwatch.

pub mod fetch;
pub mod memory;
pub mod postgres;
pub mod store;

pub use fetch::{
    is_transient_error, is_transient_status, FetchError, HttpClientConfig, HttpFetcher,
    PageSource, PolitenessDelay, RetryPolicy,
};
pub use memory::{MemoryState, MemoryStore};
pub use postgres::PgStore;
pub use store::{within_limits, Store, StoreError, StoreResult, StoreTx, TxLimits};

pub const CRATE_NAME: &str = "pwatch-storage";
