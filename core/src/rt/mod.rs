mod runtime;

pub use runtime::{Driver, TimerHandle, Wake};
