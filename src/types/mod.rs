//! Type definitions

pub mod job;
pub mod records;
pub mod tax_rates;

pub use job::*;
pub use records::*;
pub use tax_rates::*;
