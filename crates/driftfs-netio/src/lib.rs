//! DriftFS NetIO - event loop abstractions
//!
//! The control-plane state machines run on a cooperative, single-threaded
//! network event loop owned by the host process. This crate defines the
//! seam between the two: the byte buffers a connection exposes, the
//! [`Connection`]/[`Connector`] traits the loop implements, and the
//! [`NetManager`] handle through which components observe the clock and
//! control the loop. The loop implementation itself lives with the host.

pub mod addr;
pub mod buffer;
pub mod conn;
pub mod manager;

pub use addr::probe_local_address;
pub use buffer::IoBuffer;
pub use conn::{ConnectState, Connection, Connector, NetEvent};
pub use manager::{NetManager, TimeoutHandler};
