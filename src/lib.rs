pub mod cache;
pub mod config;
pub mod error;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod recurrence;
pub mod scheduler;
pub mod storage;
pub mod wal;
pub mod worker;
