//! Event bus & status cache — fan-in from the engine's event stream,
//! fan-out to the state machine, log/stats subscribers, and job watchers.

mod bus;
mod cache;
mod hub;
mod pump;

pub use bus::{Delivery, EventBus, Subscription};
pub use cache::{ServiceStatus, StatusCache};
pub use hub::StreamHub;
pub use pump::EventPump;
