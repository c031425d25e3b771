//! Pipeline events and the pub/sub mechanics that carry them.

pub mod bus;
pub mod completion;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use completion::CompletionEvent;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
