//! The Stenobot gateway: bot supervision (launch, callbacks, watchdog,
//! webhooks), the REST/WS surface, and event fan-out to subscribers.

pub mod api;
pub mod cli;
pub mod error;
pub mod events;
pub mod state;
pub mod supervisor;
