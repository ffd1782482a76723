//! Event loop handle
//!
//! The host process runs one cooperative network event loop per daemon.
//! Components hold a [`NetManager`] to read the loop's clock and to
//! request wake-ups or a full shutdown; the loop invokes registered
//! [`TimeoutHandler`]s once per tick (roughly once a second).

/// Handle to the host's network event loop.
pub trait NetManager {
    /// Current time in whole seconds, sampled once per loop iteration.
    /// All control-plane timing (reconnect backoff, inactivity, LRU
    /// expiry) uses this clock, never the wall clock directly.
    fn now(&self) -> i64;

    /// False once loop shutdown has begun.
    fn is_running(&self) -> bool;

    /// Terminate the event loop. Used for fatal configuration errors
    /// such as a cluster key mismatch.
    fn shutdown(&self);

    /// Interrupt a poll wait so newly queued work is noticed promptly.
    fn wakeup(&self);
}

/// Periodic callback driven by the event loop.
///
/// Registration is part of the loop's own interface; components document
/// in their `init`/`start` contracts that the host must arrange for
/// `timeout` to run on every tick.
pub trait TimeoutHandler {
    fn timeout(&mut self);
}
