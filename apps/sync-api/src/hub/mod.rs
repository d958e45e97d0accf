//! Real-time broadcast hub.
//!
//! Three pieces: the connection registry (who is connected, with a bounded
//! outbound queue per connection), the room coordinator (a single task that
//! owns all room membership and does broadcast fan-out), and the WebSocket
//! endpoint with its per-connection read/write pumps.

pub mod coordinator;
pub mod registry;
pub mod server;

pub use coordinator::{HubHandle, RoomCoordinator};
pub use registry::ConnectionRegistry;
