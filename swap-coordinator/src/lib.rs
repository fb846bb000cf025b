// Coordinator for cross-ledger atomic swaps settled with adaptor signatures

pub mod config;
pub mod crypto;
pub mod data_structures;
pub mod ledger;
pub mod storage;
pub mod swap;
pub mod timeout;

pub mod test_utils; // shared with tests/
