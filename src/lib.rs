// Expose the modules
pub mod book;
pub mod config;
pub mod depth;
pub mod events;
pub mod matcher;
pub mod orderbook;
pub mod registry;
pub mod stats;
pub mod types;

// Re-export key types for easier usage
pub use book::{DepthView, PriceLevel, SideBook};
pub use config::{BookConfig, TriggerSource};
pub use depth::{BookSnapshot, DepthLevel};
pub use events::{
    AsyncDispatcher, AsyncEventHandler, BookEvent, EventBus, EventHandler, EventKind, EventType,
    SubscriptionId,
};
pub use orderbook::{ModifyReport, OrderBook, SubmitReport};
pub use registry::{MarketRegistry, RegistryError, RegistryStatistics};
pub use stats::{BookStatistics, LatencySummary, OperationCounters};
pub use types::{
    BookResult, CancelReason, Order, OrderBookError, OrderPatch, OrderSpec, OrderType, Side,
    TimeInForce, Trade,
};
