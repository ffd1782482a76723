//! DriftFS Chunk - chunk server control plane
//!
//! A chunk server maintains exactly one authenticated control session to
//! the meta server. [`session::MetaServerSession`] owns that session: it
//! connects and reconnects, runs the hello handshake (optionally
//! resuming inventory state across reconnects), multiplexes outbound ops
//! against inbound meta server commands on a single connection, and
//! fails everything cleanly when the link drops.
//!
//! The session is a cooperative state machine driven entirely from the
//! host's network event loop; it starts no threads and takes no locks.
//! Everything else the chunk server does — executing commands, tracking
//! leases, replicating chunks — is reached through the collaborator
//! traits below.

pub mod auth;
pub mod ops;
pub mod rpc;
pub mod session;

use driftfs_common::ServerLocation;

pub use auth::{AuthContext, AuthRequest, DisabledAuthContext};
pub use ops::{AuthOp, CorruptChunkOp, HeartbeatOp, HelloOp, MetaOp, OpBase, OpKind, Seq};
pub use rpc::{HeaderProps, RpcFormat};
pub use session::{MetaServerSession, SessionContext, SessionCounters};

/// The surrounding chunk server: executes ops and owns the advertised
/// server location.
///
/// `submit_op` hands an op over for asynchronous execution; the server
/// must complete it by calling
/// [`MetaServerSession::handle_op_done`](session::MetaServerSession::handle_op_done)
/// from the event loop. `submit_op_response` delivers the final outcome
/// of an op the session is done with.
pub trait ChunkServer {
    fn can_update_server_ip(&self) -> bool;
    fn location(&self) -> ServerLocation;
    fn set_location(&mut self, location: ServerLocation);
    fn submit_op(&mut self, op: Box<dyn MetaOp>);
    fn submit_op_response(&mut self, op: Box<dyn MetaOp>);
}

/// Chunk inventory owner.
pub trait ChunkManager {
    /// Publish the filesystem id learned from the hello reply. When
    /// `delete_all_chunks` is set the local id diverged and the
    /// inventory must be dropped.
    fn set_file_system_id(&mut self, fs_id: i64, delete_all_chunks: bool);

    /// Current crypto key as (key id, opaque key bytes), if any.
    fn current_crypto_key(&self) -> Option<(String, Vec<u8>)>;

    /// The control connection dropped; in-flight chunk state tied to it
    /// is now undefined.
    fn meta_server_connection_lost(&mut self);
}

/// Lease bookkeeping; all leases die with the session.
pub trait LeaseClerk {
    fn unregister_all_leases(&mut self);
}

/// Replication executor. Cancellation is scoped to the work started
/// under this session; replications driven by other peers are not
/// affected.
pub trait Replicator {
    fn cancel_session_replications(&mut self);
}

/// Decoder for meta-server-initiated commands. Receives the complete
/// header block (first line is the command verb) and the negotiated
/// dialect; returns the typed op or a description of why the block is
/// unparseable.
pub trait CommandParser {
    fn parse(
        &mut self,
        header: &[u8],
        fmt: RpcFormat,
    ) -> std::result::Result<Box<dyn MetaOp>, String>;
}
