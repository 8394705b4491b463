pub mod config;
pub mod context;
pub mod error;
pub mod executor;
pub mod memory;
pub mod pipeline;
pub mod stage;
pub mod store;

pub use mongodb::bson;

pub use config::StoreConfig;
pub use context::{CancelHandle, QueryContext};
pub use error::{Error, Result};
pub use executor::{execute, execute_as};
pub use memory::{MemoryStore, MemoryStoreError};
pub use pipeline::{GroupingQuery, Pipeline};
pub use stage::{COUNT_FIELD, Group, Sort, SortDirection, Stage, StageKind, Unwind};
pub use store::{AggregateStore, ResultCursor};
