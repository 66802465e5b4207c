pub mod bulk;
pub mod executor;
pub mod router;
pub mod uniqueness;

pub use bulk::{BulkWriteBatch, BulkWriteCoordinator, WriteIntent};
pub use executor::{RecordingSleeper, RetryPolicy, Sleeper, StatementExecutor, TokioSleeper};
pub use router::ConnectionRouter;
pub use uniqueness::{UniquenessConflictReport, UniquenessValidator};
