pub mod document;
pub mod store;

pub use document::{TagCount, TagDocument};
pub use store::{PersistOutcome, TagStore};
