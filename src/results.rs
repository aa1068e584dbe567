//! Suite report persistence.
//!
//! One JSON document per finished suite, written atomically next to the
//! plain-text log files it references.

pub mod types;
pub mod writer;

pub use types::{SuiteReport, TestCaseReport};
pub use writer::ResultWriter;
