//! Loop prevention and conflict resolution

mod chain;
mod hash;

pub use chain::{
    arbitrate, is_echo, Arbitration, Decision, GuardChain, IncomingChange, SkipReason,
};
pub use hash::content_hash;
