pub mod serde_utils;
pub mod sync;
pub mod types;
