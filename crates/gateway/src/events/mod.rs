//! Event plumbing: Redis bus (publisher + bridge), the in-process
//! fan-out hub, and the subscriber WebSocket endpoint.

pub mod bus;
pub mod hub;
pub mod ws;

pub use bus::{start_publisher, run_bridge, BusPublisher, RedisStatusSink};
pub use hub::{run_pruner, EventHub};
