pub mod error;
pub mod memory;
pub mod operation;
pub mod postgres;
pub mod status;
pub mod store;

pub use common::OperationId;
pub use error::{Result, StoreError};
pub use memory::InMemoryOperationStore;
pub use operation::{FilePaths, Metadata, Operation, PendingCommand, StepResults, Version};
pub use postgres::PostgresOperationStore;
pub use status::{OperationStatus, UnknownStatus};
pub use store::{Mutation, OperationStore, OperationStoreExt};
