// Everything that talks to, or stands in for, the two ledgers

pub mod instruction;
pub mod interface;
pub mod mock;
pub mod observer;
pub mod retry;

pub use instruction::{LedgerInstruction, SignedInstruction};
pub use interface::{Executors, LedgerError, LedgerExecutor};
pub use observer::{BlockSource, LedgerObserver, PollingObserver};
