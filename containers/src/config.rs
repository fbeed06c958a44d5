/// Number of slots grouped into one epoch.
pub const SLOTS_PER_EPOCH: u64 = 32;
