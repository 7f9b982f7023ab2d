//--------------------------------------------------------------------------------------------------
// MODULE OVERVIEW
//--------------------------------------------------------------------------------------------------
// The event system: typed lifecycle events, the synchronous publish/subscribe
// bus every book emits through, and the opt-in asynchronous dispatcher for
// consumers that cannot run inside the book lock.
//--------------------------------------------------------------------------------------------------

mod bus;
mod dispatcher;
mod types;

pub use bus::{EventBus, EventHandler, SubscriptionId};
pub use dispatcher::{AsyncDispatcher, AsyncEventHandler};
pub use types::{BookEvent, EventError, EventKind, EventResult, EventType};
