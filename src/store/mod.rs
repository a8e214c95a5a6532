//! Persistent naming layer: the incident-key map and the conversation file
//! locator.

mod convstore;
mod sopmap;

pub use convstore::ConvStore;
pub use sopmap::{SopMap, derive_sop_id};
