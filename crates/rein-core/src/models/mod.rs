pub mod block_state;
pub mod task;

pub use block_state::*;
pub use task::*;
