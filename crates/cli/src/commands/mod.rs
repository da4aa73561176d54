pub mod migrate;
pub mod schedule;
pub mod sync;
