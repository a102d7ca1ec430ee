pub mod canonical;
pub mod enums;
pub mod match_log;
pub mod prereg;
pub mod raw;

pub use canonical::*;
pub use enums::*;
pub use match_log::*;
pub use prereg::*;
pub use raw::*;
