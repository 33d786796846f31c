pub mod registry;
pub use registry::*;

pub mod retry;
pub use retry::*;

pub mod state;
pub use state::*;

mod manager;
pub use manager::*;
