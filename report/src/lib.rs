//! Report output for loadhive runs
//!
//! This crate turns [`ReportFrame`]s into files:
//!
//! - CSV stats, stats history and failures tables
//! - A JSON dump of the final frame
//!
//! [`ReportFrame`]: loadhive_core::stats::ReportFrame

#![warn(missing_docs)]
#![warn(clippy::all)]

mod csv_report;
mod json_report;

pub use csv_report::CsvStatsWriter;
pub use json_report::JsonExporter;
