//! Repository layer — table-scoped database operations.
//!
//! All public functions are re-exported here; callers use
//! `db::repository::insert_raw` style paths or the glob re-export.

mod canonical;
mod dead_letter;
mod match_log;
mod prereg;
mod protocol;
mod raw_patient;
mod referrer;
mod stats;

pub use canonical::*;
pub use dead_letter::*;
pub use match_log::*;
pub use prereg::*;
pub use protocol::*;
pub use raw_patient::*;
pub use referrer::*;
pub use stats::*;

use chrono::NaiveDateTime;

pub(crate) const DATETIME_FMT: &str = "%Y-%m-%d %H:%M:%S";

pub(crate) fn format_dt(dt: &NaiveDateTime) -> String {
    dt.format(DATETIME_FMT).to_string()
}

pub(crate) fn parse_dt(s: &str) -> NaiveDateTime {
    NaiveDateTime::parse_from_str(s, DATETIME_FMT)
        .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
        .unwrap_or_default()
}
