//! Agent output stream: wire protocol, parser, and normalized entries.

pub mod entry;
pub mod heuristics;
pub mod parser;
pub mod protocol;

pub use entry::{LogEntry, LogKind, NewLogEntry, truncate_content};
pub use parser::EventStreamParser;
