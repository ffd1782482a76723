//! Protocol status codes
//!
//! Ops carry their outcome as an `i32` status: zero for success, the
//! negated code for failure. The values below are fixed by the wire
//! protocol and must not follow the host platform's errno numbering.

/// No such entry.
pub const ENOENT: i32 = 2;
/// I/O error on the underlying file or socket.
pub const EIO: i32 = 5;
/// Resource temporarily unavailable; retry is expected.
pub const EAGAIN: i32 = 11;
/// Address fell into a hole between known ranges.
pub const EFAULT: i32 = 14;
/// Invalid argument.
pub const EINVAL: i32 = 22;
/// Peer is unreachable; used to fail ops on disconnect.
pub const EHOSTUNREACH: i32 = 113;
/// Operation canceled by shutdown.
pub const ECANCELED: i32 = 125;
/// Cluster key presented in the hello does not match the meta server's.
pub const EBADCLUSTERKEY: i32 = 1_0001;

/// Human-readable name for a (non-negated) status code, for log messages.
pub fn name(code: i32) -> &'static str {
    match code {
        ENOENT => "no entry",
        EIO => "input/output error",
        EAGAIN => "try again",
        EFAULT => "bad address",
        EINVAL => "invalid argument",
        EHOSTUNREACH => "host unreachable",
        ECANCELED => "canceled",
        EBADCLUSTERKEY => "cluster key mismatch",
        _ => "unknown error",
    }
}
