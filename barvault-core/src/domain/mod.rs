//! Domain types: bars, frequencies, dataset keys.

pub mod bar;
pub mod key;

pub use bar::{Bar, Frequency, TimeRange};
pub use key::DatasetKey;
