//! Domain types shared by every stage of the pipeline.

pub mod bar;
pub mod symbol;
pub mod time;

pub use bar::Bar;
pub use symbol::{Symbol, SymbolError};
pub use time::{is_weekday, DateRange, RangeError, TimeRange};
