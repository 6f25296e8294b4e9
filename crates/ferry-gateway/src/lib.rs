//! Ferry server side: the registry of live connections, the per-connection
//! request loop, chat fan-out, and the TCP accept loop.

pub mod connection;
pub mod listener;
pub mod registry;

pub use connection::{CloseReason, SessionContext, handle_connection, is_disconnect};
pub use listener::{Listener, ListenerConfig};
pub use registry::{BroadcastReport, ConnId, OUTBOUND_QUEUE_CAPACITY, Registration, Registry};
