mod bridge;
mod clarifications;
mod scheduler;
mod signals;
mod store;
mod streaming;

pub use bridge::*;
pub use clarifications::*;
pub use scheduler::*;
pub use signals::*;
pub use store::*;
pub use streaming::*;
