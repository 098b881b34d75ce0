pub mod enums;
pub mod job;
pub mod stats;

pub use enums::*;
pub use job::*;
pub use stats::*;
