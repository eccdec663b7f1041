//! Database queries

pub mod aggregates;
pub mod jobs;
pub mod records;
pub mod tax_rates;
