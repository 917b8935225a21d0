//! Test support: an in-memory chain usable as source and destination

pub mod mock_chain;

pub use mock_chain::MockChain;
