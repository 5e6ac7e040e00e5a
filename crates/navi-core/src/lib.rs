pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::NaviConfig;
pub use error::{NaviError, Result};
pub use events::{Sender, SignalBus, SignalError, SubscriptionId};
pub use types::*;
