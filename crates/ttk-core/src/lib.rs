pub mod config;
pub mod report;
pub mod types;

pub use config::TestSuite;
pub use report::{ReportRow, ReportWriter};
pub use types::*;
