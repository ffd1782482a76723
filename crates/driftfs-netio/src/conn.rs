//! Connection traits
//!
//! A [`Connection`] is a non-blocking TCP stream registered with the
//! event loop, seen by a state machine purely through its buffers and a
//! handful of control calls. A [`Connector`] opens new connections; the
//! split keeps socket creation with the loop so tests can substitute
//! in-memory connections.

use crate::buffer::IoBuffer;
use driftfs_common::{Result, ServerLocation};

/// Events the loop delivers to a connection's owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetEvent {
    /// Bytes were appended to the input buffer.
    Read,
    /// Some output was flushed to the socket.
    Wrote,
    /// The connection failed or was closed by the peer.
    Error,
    /// No traffic within the connection's inactivity timeout.
    InactivityTimeout,
}

/// Outcome of a non-blocking connect attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectState {
    /// The socket connected immediately (typically loopback).
    Connected,
    /// Connect is in progress; completion arrives as a `Wrote` event.
    Pending,
}

/// A connection registered with the event loop.
pub trait Connection {
    /// True while the underlying socket is usable.
    fn is_good(&self) -> bool;

    fn close(&mut self);

    /// Received bytes awaiting consumption.
    fn in_buffer(&mut self) -> &mut IoBuffer;

    /// Serialized output awaiting a flush.
    fn out_buffer(&mut self) -> &mut IoBuffer;

    /// Ask the loop to flush the output buffer without waiting for the
    /// next poll round.
    fn start_flush(&mut self);

    /// Lower bound on how many bytes the loop should be willing to
    /// buffer ahead of consumption.
    fn set_max_read_ahead(&mut self, bytes: usize);

    /// Seconds of silence after which the loop delivers
    /// [`NetEvent::InactivityTimeout`].
    fn set_inactivity_timeout(&mut self, secs: i64);

    /// Local address of the socket, per `getsockname`.
    fn local_location(&self) -> Result<ServerLocation>;

    /// Peer address for log messages.
    fn peer_name(&self) -> String;

    /// True when a negotiated traffic filter (TLS) is installed.
    fn has_filter(&self) -> bool;

    /// Begin an orderly shutdown of the installed filter. Completion is
    /// surfaced through a subsequent read or error event.
    fn shutdown_filter(&mut self);
}

/// Factory for outbound connections.
pub trait Connector {
    /// Open a non-blocking connection to `location` and register it with
    /// the event loop.
    fn connect(&mut self, location: &ServerLocation)
        -> Result<(Box<dyn Connection>, ConnectState)>;
}
