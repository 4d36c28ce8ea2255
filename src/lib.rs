//! leadqual: asynchronous research-job engine for lead qualification.

pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod store;
pub mod stream;
