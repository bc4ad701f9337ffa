//! Buffered ingestion: record derivation and the channel consumer

pub mod processor;
pub mod record;

pub use processor::{BatchReport, IngestionProcessor};
pub use record::MessageRecord;
