//! Ingestion services

pub mod aggregation;
pub mod batch_writer;
pub mod cancellation;
pub mod dispatcher;
pub mod ingest;
pub mod integrity;
pub mod parser;
