pub mod coordinator;
pub mod evidence;
pub mod registry;
pub mod state_machine;
pub mod types;

pub use coordinator::{CoordinatorDeps, SwapCoordinator};
pub use types::{CreateSwapParams, Swap, SwapError, SwapEvent, SwapState, Transition};
