pub mod types;
pub mod config;
pub mod slot;
pub mod checkpoint;
pub mod status;
pub mod block;

pub use block::{Block, SignedBlock};
pub use checkpoint::Checkpoint;
pub use config::SLOTS_PER_EPOCH;
pub use slot::{Epoch, Slot};
pub use status::{HeadInfo, Status};
pub use types::{Bytes32, ValidatorIndex};
