//! Meta server session state machine
//!
//! One `MetaServerSession` per chunk server process. It owns the single
//! control connection to the meta server and everything scoped to it:
//! the connect/reconnect cycle, the authenticate and hello phases of the
//! handshake, sequence assignment and backpressure for outbound ops, and
//! the demultiplexing of replies and meta-server-initiated commands off
//! one byte stream.
//!
//! The session runs entirely on the host's event loop thread. The loop
//! delivers [`NetEvent`]s and a once-a-second [`timeout`] tick; the
//! surrounding chunk server completes executed ops through
//! [`handle_op_done`]. Disconnects advance a generation counter so that
//! completions raced against a reconnect are recognized as stale and
//! discarded.
//!
//! [`timeout`]: MetaServerSession::timeout
//! [`handle_op_done`]: MetaServerSession::handle_op_done

use crate::auth::{parse_auth_type_list, AuthContext};
use crate::ops::{AuthOp, CorruptChunkOp, HelloOp, MetaOp, OpKind, Seq};
use crate::rpc::{HeaderProps, RpcFormat, MAX_RPC_HEADER_LEN};
use crate::{ChunkManager, ChunkServer, CommandParser, LeaseClerk, Replicator};
use driftfs_common::{status, Error, Properties, Result, ServerLocation};
use driftfs_netio::addr::probe_local_address;
use driftfs_netio::{ConnectState, Connection, Connector, NetEvent, NetManager, TimeoutHandler};
use rand::Rng;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;
use tracing::{debug, error, info, warn};

const INACTIVITY_TIMEOUT_KEY: &str = "chunkServer.meta.inactivityTimeout";
const MAX_READ_AHEAD_KEY: &str = "chunkServer.meta.maxReadAhead";
const NO_FIDS_KEY: &str = "chunkServer.meta.noFids";
const HELLO_RESUME_KEY: &str = "chunkServer.meta.helloResume";
const TRACE_RPC_KEY: &str = "chunkServer.meta.traceRequestResponseFlag";
const AUTH_PARAMS_PREFIX: &str = "chunkServer.meta.auth.";
const AUTH_TYPE_KEY: &str = "chunkServer.meta.auth.authType";

const DEFAULT_MAX_PENDING_OPS: usize = 96;

/// Collaborators injected at construction. Everything the session talks
/// to is instance state; nothing global.
pub struct SessionContext {
    pub net: Rc<dyn NetManager>,
    pub connector: Box<dyn Connector>,
    pub auth: Box<dyn AuthContext>,
    pub chunk_server: Rc<RefCell<dyn ChunkServer>>,
    pub chunk_manager: Rc<RefCell<dyn ChunkManager>>,
    pub lease_clerk: Rc<RefCell<dyn LeaseClerk>>,
    pub replicator: Rc<RefCell<dyn Replicator>>,
    pub parser: Box<dyn CommandParser>,
}

/// Session event and error counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionCounters {
    pub connect_count: u64,
    pub hello_count: u64,
    pub hello_done_count: u64,
    pub hello_error_count: u64,
    pub alloc_count: u64,
    pub alloc_error_count: u64,
}

/// Where the hello op currently lives.
enum HelloState {
    None,
    /// Handed to the chunk server to (re)compute the inventory.
    Executing { seq: Seq },
    /// Request written; awaiting the reply header.
    Sent(Box<HelloOp>),
    /// Reply header seen; the op is parked in `InFlight` until the
    /// body arrives.
    InContent,
}

/// Outbound op whose reply body is still streaming in.
enum ReplyOp {
    Hello(Box<HelloOp>),
    Normal(Box<dyn MetaOp>),
}

/// Partially received exchange spanning multiple read events.
enum InFlight {
    None,
    /// Inbound command awaiting its declared body.
    Cmd(Box<dyn MetaOp>),
    /// Outbound reply awaiting its declared body.
    Reply(ReplyOp),
}

/// The chunk-server-to-meta-server session.
pub struct MetaServerSession {
    net: Rc<dyn NetManager>,
    connector: Box<dyn Connector>,
    auth_ctx: Box<dyn AuthContext>,
    chunk_server: Rc<RefCell<dyn ChunkServer>>,
    chunk_manager: Rc<RefCell<dyn ChunkManager>>,
    lease_clerk: Rc<RefCell<dyn LeaseClerk>>,
    replicator: Rc<RefCell<dyn Replicator>>,
    parser: Box<dyn CommandParser>,

    seq: Seq,
    location: ServerLocation,
    rack_id: i32,
    cluster_key: String,
    md5sum: String,

    conn: Option<Box<dyn Connection>>,
    sent_hello: bool,
    hello: HelloState,
    auth: Option<Box<AuthOp>>,
    in_flight: InFlight,
    pending_ops: VecDeque<Box<dyn MetaOp>>,
    dispatched_ops: BTreeMap<Seq, Box<dyn MetaOp>>,
    pending_responses: VecDeque<Box<dyn MetaOp>>,

    inactivity_timeout: i64,
    max_read_ahead: usize,
    last_recv_cmd_time: i64,
    last_connect_time: i64,
    connected_time: i64,
    reconnect_flag: bool,
    auth_type: u32,
    auth_type_str: String,
    current_key_id: String,
    update_current_key: bool,
    no_fids: bool,
    hello_resume: i32,
    trace_rpc: bool,
    rpc_format: RpcFormat,
    content_length: usize,
    generation: u64,
    max_pending_ops: usize,
    shutdown_flag: bool,
    counters: SessionCounters,
}

impl MetaServerSession {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            net: ctx.net,
            connector: ctx.connector,
            auth_ctx: ctx.auth,
            chunk_server: ctx.chunk_server,
            chunk_manager: ctx.chunk_manager,
            lease_clerk: ctx.lease_clerk,
            replicator: ctx.replicator,
            parser: ctx.parser,
            seq: rand::thread_rng().gen_range(0..1 << 30),
            location: ServerLocation::default(),
            rack_id: -1,
            cluster_key: String::new(),
            md5sum: String::new(),
            conn: None,
            sent_hello: false,
            hello: HelloState::None,
            auth: None,
            in_flight: InFlight::None,
            pending_ops: VecDeque::new(),
            dispatched_ops: BTreeMap::new(),
            pending_responses: VecDeque::new(),
            inactivity_timeout: 65,
            max_read_ahead: 4 << 10,
            last_recv_cmd_time: 0,
            last_connect_time: 0,
            connected_time: 0,
            reconnect_flag: false,
            auth_type: parse_auth_type_list("Krb5 X509 PSK"),
            auth_type_str: "Krb5 X509 PSK".to_string(),
            current_key_id: String::new(),
            update_current_key: false,
            no_fids: true,
            hello_resume: -1,
            trace_rpc: false,
            rpc_format: RpcFormat::Undef,
            content_length: 0,
            generation: 1,
            max_pending_ops: DEFAULT_MAX_PENDING_OPS,
            shutdown_flag: false,
            counters: SessionCounters::default(),
        }
    }

    /// One-shot configuration of the meta server endpoint and identity.
    pub fn set_meta_info(
        &mut self,
        location: ServerLocation,
        cluster_key: impl Into<String>,
        rack_id: i32,
        md5sum: impl Into<String>,
        props: &Properties,
    ) -> Result<()> {
        self.location = location;
        self.cluster_key = cluster_key.into();
        self.rack_id = rack_id;
        self.md5sum = md5sum.into();
        self.set_parameters(props)
    }

    /// Apply runtime-tunable parameters. Safe to call on a live session.
    pub fn set_parameters(&mut self, props: &Properties) -> Result<()> {
        self.inactivity_timeout =
            props.get_i64(INACTIVITY_TIMEOUT_KEY, self.inactivity_timeout);
        self.max_read_ahead = props.get_usize(MAX_READ_AHEAD_KEY, self.max_read_ahead);
        self.no_fids = props.get_bool(NO_FIDS_KEY, self.no_fids);
        self.hello_resume = props.get_i32(HELLO_RESUME_KEY, self.hello_resume);
        self.trace_rpc = props.get_bool(TRACE_RPC_KEY, self.trace_rpc);
        let auth_result = self.auth_ctx.set_parameters(AUTH_PARAMS_PREFIX, props);
        let auth_type_str = props.get_str(AUTH_TYPE_KEY, &self.auth_type_str).to_string();
        self.auth_type_str = auth_type_str;
        self.auth_type = parse_auth_type_list(&self.auth_type_str);
        if self.auth_ctx.is_enabled() {
            if let Err(err) = self.auth_ctx.check_auth_type(self.auth_type) {
                error!(
                    "invalid {}: {:#x}: {}",
                    AUTH_TYPE_KEY, self.auth_type, err
                );
                return auth_result.and(Err(err));
            }
        }
        auth_result
    }

    /// Arm the session. The host must drive [`Self::timeout`] once per
    /// event loop tick and route connection events to
    /// [`Self::handle_event`]; the first tick initiates the connect.
    pub fn init(&mut self) -> Result<()> {
        if !self.location.is_valid() {
            return Err(Error::invalid_argument(format!(
                "invalid meta server location: {}",
                self.location
            )));
        }
        self.shutdown_flag = false;
        self.last_connect_time = self.net.now() - 2;
        Ok(())
    }

    /// Tear the session down for good; every queued and dispatched op
    /// fails with host-unreachable and later submissions are rejected.
    pub fn shutdown(&mut self) {
        if self.shutdown_flag && self.conn.is_none() {
            return;
        }
        if let Some(conn) = self.conn.as_mut() {
            conn.close();
        }
        self.conn = None;
        self.generation = self.generation.wrapping_add(1);
        self.shutdown_flag = true;
        self.in_flight = InFlight::None;
        self.discard_pending_responses();
        self.fail_ops();
        self.sent_hello = false;
        self.hello = HelloState::None;
        self.auth = None;
        self.auth_ctx.clear();
    }

    /// Synthetic error to force a disconnect and reconnect cycle.
    pub fn force_down(&mut self) {
        if self.conn.is_some() {
            self.error("forced down");
        }
    }

    /// Request a reconnect on the next tick.
    pub fn request_reconnect(&mut self) {
        self.reconnect_flag = true;
    }

    pub fn is_connected(&self) -> bool {
        self.conn.as_ref().map(|c| c.is_good()).unwrap_or(false)
    }

    /// Hello accepted; the meta server considers this chunk server live.
    pub fn is_handshake_done(&self) -> bool {
        self.sent_hello && matches!(self.hello, HelloState::None)
    }

    pub fn is_up(&self) -> bool {
        self.is_connected() && self.is_handshake_done()
    }

    /// Seconds since the current connection was initiated, zero when
    /// down.
    pub fn connection_uptime(&self) -> i64 {
        if self.is_up() {
            self.net.now() - self.last_connect_time
        } else {
            0
        }
    }

    pub fn counters(&self) -> &SessionCounters {
        &self.counters
    }

    /// Admit an outbound op. Dispatches immediately when the session is
    /// up and under the pending window, queues otherwise.
    pub fn enqueue_op(&mut self, mut op: Box<dyn MetaOp>) {
        if self.shutdown_flag || !self.net.is_running() || !self.location.is_valid() {
            op.set_status(-status::EHOSTUNREACH);
            self.chunk_server.borrow_mut().submit_op_response(op);
            return;
        }
        if self.auth.is_none()
            && self.pending_ops.is_empty()
            && self.is_up()
            && self.dispatched_ops.len() < self.max_pending_ops
        {
            op.set_seq(self.next_seq());
            self.write_request(op.as_mut());
            if op.no_reply() {
                self.chunk_server.borrow_mut().submit_op_response(op);
            } else if self.dispatched_ops.insert(op.seq(), op).is_some() {
                panic!("duplicate sequence number");
            }
        } else {
            self.pending_ops.push_back(op);
            self.net.wakeup();
        }
    }

    /// Completion callback for ops previously handed to the chunk
    /// server through `submit_op`.
    pub fn handle_op_done(&mut self, mut op: Box<dyn MetaOp>) {
        match op.kind() {
            OpKind::Authenticate => panic!("invalid authentication op completion"),
            OpKind::Hello => {
                let hello = op
                    .into_any()
                    .downcast::<HelloOp>()
                    .unwrap_or_else(|_| panic!("hello kind on a non hello op"));
                self.dispatch_hello(hello);
            }
            kind => {
                if self.update_current_key && kind == OpKind::Heartbeat {
                    if let Some((key_id, key)) = self.chunk_manager.borrow().current_crypto_key()
                    {
                        if key_id != self.current_key_id {
                            let hb = op.heartbeat_mut().expect("heartbeat op");
                            hb.send_current_key = true;
                            hb.current_key_id = key_id.clone();
                            hb.current_key = key;
                            self.current_key_id = key_id;
                        }
                    }
                }
                self.send_response(op);
                if !self.pending_ops.is_empty() {
                    self.dispatch_ops();
                }
            }
        }
    }

    /// Connection event dispatch from the host loop.
    pub fn handle_event(&mut self, event: NetEvent) {
        match event {
            NetEvent::Read => self.handle_read(),
            NetEvent::Wrote => {
                if self.auth.is_none()
                    && !self.sent_hello
                    && matches!(self.hello, HelloState::None)
                {
                    self.send_hello();
                }
            }
            NetEvent::Error => {
                let filterless_auth = self.auth.is_some()
                    && matches!(self.in_flight, InFlight::None)
                    && self.is_up()
                    && self.conn.as_ref().map(|c| !c.has_filter()).unwrap_or(false);
                if filterless_auth {
                    // Mechanisms that end without a filter signal
                    // completion by half-closing the stream.
                    self.handle_auth_response();
                } else {
                    self.error("network error");
                }
            }
            NetEvent::InactivityTimeout => self.error("inactivity timeout"),
        }
    }

    /// Periodic tick: reconnect backoff, inactivity detection, pending
    /// op dispatch.
    pub fn timeout(&mut self) {
        if self.reconnect_flag {
            self.reconnect_flag = false;
            let msg = "meta server reconnect requested";
            warn!("{msg}");
            self.error(msg);
        }
        let now = self.net.now();
        if self.is_connected()
            && self.is_handshake_done()
            && self.last_recv_cmd_time + self.inactivity_timeout < now
        {
            error!(
                "meta server inactivity timeout, last request received: {} secs ago",
                now - self.last_recv_cmd_time
            );
            self.error("heartbeat request timeout");
        }
        if !self.is_connected() {
            match self.hello {
                // The chunk server is still computing the inventory;
                // reconnecting now would orphan the op.
                HelloState::Executing { .. } => return,
                HelloState::None => {}
                _ => {
                    self.sent_hello = false;
                    self.hello = HelloState::None;
                }
            }
            if self.last_connect_time + 1 < now {
                self.last_connect_time = now;
                self.connect();
            }
            return;
        }
        if self.auth.is_some() || !self.is_handshake_done() {
            return;
        }
        self.dispatch_ops();
        if let Some(conn) = self.conn.as_mut() {
            conn.start_flush();
        }
    }

    fn next_seq(&mut self) -> Seq {
        let seq = self.seq;
        self.seq += 1;
        seq
    }

    fn in_buf_len(&mut self) -> usize {
        self.conn
            .as_mut()
            .map(|c| c.in_buffer().bytes_consumable())
            .unwrap_or(0)
    }

    fn connect(&mut self) {
        if !matches!(self.hello, HelloState::None) {
            return;
        }
        self.in_flight = InFlight::None;
        self.auth = None;
        self.discard_pending_responses();
        self.content_length = 0;
        self.counters.connect_count += 1;
        self.generation = self.generation.wrapping_add(1);
        self.rpc_format = RpcFormat::Undef;
        self.sent_hello = false;
        self.update_current_key = false;
        match self.connector.connect(&self.location) {
            Err(err) => {
                error!("connection to meta server failed: {err}");
            }
            Ok((mut conn, state)) => {
                info!(
                    "{} to meta server {}",
                    if state == ConnectState::Pending {
                        "connecting"
                    } else {
                        "connected"
                    },
                    self.location
                );
                conn.set_inactivity_timeout(self.inactivity_timeout);
                conn.set_max_read_ahead(self.max_read_ahead);
                self.conn = Some(conn);
                if state == ConnectState::Connected {
                    self.send_hello();
                }
            }
        }
    }

    fn send_hello(&mut self) {
        if !matches!(self.hello, HelloState::None) || self.auth.is_some() {
            return;
        }
        if !self.is_connected() {
            debug!("unable to connect to meta server");
            if self.conn.is_some() {
                self.error("network error");
            }
            return;
        }
        if self.chunk_server.borrow().can_update_server_ip() {
            // Advertise the same address the meta connection uses.
            let mut local = match self.conn.as_ref().unwrap().local_location() {
                Ok(loc) => loc,
                Err(err) => {
                    error!("getsockname: {err}");
                    self.error("get socket name error");
                    return;
                }
            };
            // A wildcard getsockname result against a local meta server
            // stands in for loopback.
            if local.hostname == "0.0.0.0" && self.location.hostname == "127.0.0.1" {
                local.hostname = self.location.hostname.clone();
            }
            if !local.is_valid() || local.hostname == "0.0.0.0" || local.hostname == "::" {
                error!(
                    "invalid chunk server location: {local} resetting meta server connection"
                );
                self.error("invalid socket address");
                return;
            }
            let prev = self.chunk_server.borrow().location();
            if local.hostname != prev.hostname {
                let advertised = ServerLocation::new(local.hostname.clone(), prev.port);
                if prev.hostname.is_empty() {
                    info!("setting chunk server ip to: {}", advertised.hostname);
                    self.chunk_server.borrow_mut().set_location(advertised);
                } else {
                    let probe = probe_local_address(&prev.hostname);
                    warn!(
                        "meta server connection local address: {} current chunk server ip: {}{}",
                        local.hostname,
                        prev.hostname,
                        match &probe {
                            Ok(()) => String::new(),
                            Err(err) => format!(" is no longer valid: {err}"),
                        }
                    );
                    if probe.is_err() {
                        self.chunk_server.borrow_mut().set_location(advertised);
                    }
                }
            }
        }
        if !self.authenticate() {
            self.submit_hello();
        }
    }

    /// Start the authentication phase. Returns false when authentication
    /// is disabled and the hello should go out directly.
    fn authenticate(&mut self) -> bool {
        if !self.auth_ctx.is_enabled() {
            return false;
        }
        if self.auth.is_some() {
            panic!("invalid authenticate invocation: auth is in flight");
        }
        let mut op = Box::new(AuthOp::new(self.rpc_format != RpcFormat::Short));
        op.base.seq = self.next_seq();
        match self.auth_ctx.request(self.auth_type) {
            Ok(req) => {
                op.requested_auth_type = req.requested_auth_type;
                op.content = req.content;
            }
            Err(err) => {
                error!("authentication request failure: {err}");
                self.error("authentication error");
                return true;
            }
        }
        self.write_request(op.as_mut());
        info!("started: {}", op.show());
        self.auth = Some(op);
        true
    }

    fn submit_hello(&mut self) {
        if !matches!(self.hello, HelloState::None) {
            panic!("invalid submit hello invocation");
        }
        let mut op = Box::new(HelloOp::new(
            self.chunk_server.borrow().location(),
            self.cluster_key.clone(),
            self.md5sum.clone(),
            self.rack_id,
        ));
        op.base.seq = self.next_seq();
        op.send_current_key = true;
        op.no_fids = self.no_fids;
        op.hello_done_count = self.counters.hello_done_count;
        // Resume is opt-in, and never attempted on the very first hello:
        // there is no prior server-side state to resume from.
        op.resume_step = if self.hello_resume < 0 || self.counters.hello_done_count == 0 {
            -1
        } else {
            0
        };
        op.req_short_rpc_fmt = self.rpc_format != RpcFormat::Short;
        self.hello = HelloState::Executing { seq: op.base.seq };
        self.chunk_server.borrow_mut().submit_op(op);
    }

    /// The chunk server finished filling the hello inventory; put the
    /// request on the wire.
    fn dispatch_hello(&mut self, mut op: Box<HelloOp>) {
        match self.hello {
            HelloState::Executing { seq } if seq == op.base.seq => {}
            // A hello from before a disconnect; the handshake has moved
            // on without it.
            _ => return,
        }
        if self.sent_hello || self.auth.is_some() {
            panic!("dispatch hello: invalid invocation");
        }
        if !self.is_connected() {
            // The connection died while the inventory was being built;
            // the next tick starts over.
            self.sent_hello = false;
            self.update_current_key = false;
            self.hello = HelloState::None;
            return;
        }
        self.sent_hello = true;
        self.write_request(op.as_mut());
        info!("sending hello to meta server: {}", op.show());
        self.hello = HelloState::Sent(op);
        self.conn.as_mut().unwrap().start_flush();
    }

    fn handle_read(&mut self) {
        if self.conn.is_none() {
            return;
        }
        if !matches!(self.in_flight, InFlight::None)
            && self.auth.is_some()
            && !self.is_handshake_done()
        {
            panic!("op and authentication in flight");
        }
        // Resume an exchange waiting on its body.
        match std::mem::replace(&mut self.in_flight, InFlight::None) {
            InFlight::None => {}
            InFlight::Cmd(op) => {
                if self.in_buf_len() < self.content_length {
                    self.in_flight = InFlight::Cmd(op);
                    return;
                }
                if !self.handle_cmd_body(op) {
                    return;
                }
            }
            InFlight::Reply(op) => {
                if self.in_buf_len() < self.content_length {
                    self.in_flight = InFlight::Reply(op);
                    return;
                }
                if !self.finish_reply(op) {
                    return;
                }
            }
        }
        // An authenticate reply consumes the stream out of band until
        // its declared content is complete.
        if self.auth.as_ref().map(|a| a.response_pending).unwrap_or(false) {
            self.handle_auth_response();
            return;
        }
        loop {
            if self.conn.is_none() {
                return;
            }
            let header_len = self
                .conn
                .as_mut()
                .and_then(|c| c.in_buffer().find_header_end());
            match header_len {
                Some(len) => {
                    if !self.handle_msg(len) {
                        return;
                    }
                }
                None => break,
            }
        }
        let buffered = self.in_buf_len();
        if buffered > MAX_RPC_HEADER_LEN {
            error!(
                "exceeded max request header size: {buffered} > {MAX_RPC_HEADER_LEN}, closing connection: {}",
                self.peer_name()
            );
            if let Some(conn) = self.conn.as_mut() {
                conn.in_buffer().clear();
            }
            self.error("protocol parse error");
        }
    }

    fn peer_name(&self) -> String {
        self.conn
            .as_ref()
            .map(|c| c.peer_name())
            .unwrap_or_else(|| "not connected".to_string())
    }

    /// Route one complete header block. Replies open with an `OK` status
    /// line; everything else is an inbound command.
    fn handle_msg(&mut self, msg_len: usize) -> bool {
        let mut head = [0u8; 3];
        let copied = self
            .conn
            .as_mut()
            .map(|c| c.in_buffer().copy_out(&mut head))
            .unwrap_or(0);
        if copied == 3 && head[0] == b'O' && head[1] == b'K' && head[2] <= b' ' {
            self.handle_reply(msg_len)
        } else {
            self.handle_cmd(msg_len)
        }
    }

    fn handle_reply(&mut self, msg_len: usize) -> bool {
        let mut props = {
            let conn = self.conn.as_mut().unwrap();
            let inbuf = conn.in_buffer();
            if self.trace_rpc {
                for line in inbuf.lines(msg_len) {
                    debug!("{} meta response: {line}", self.location);
                }
            }
            let props =
                HeaderProps::parse(&inbuf.as_slice()[..msg_len], self.rpc_format.is_short());
            inbuf.consume(msg_len);
            props
        };
        if self.rpc_format == RpcFormat::Undef && self.format_probe_armed() {
            if props.has("Cseq") {
                self.rpc_format = RpcFormat::Long;
            } else if props.has("c") {
                self.rpc_format = RpcFormat::Short;
                props.set_int_base_hex();
            } else {
                error!("reply carries neither long nor short sequence field");
                self.error("RPC format detection failed");
                return false;
            }
        }
        let fmt = self.rpc_format;
        let seq = props.get_i64(fmt.key("c", "Cseq"), -1);
        let status = props.get_i32(fmt.key("s", "Status"), -1);
        let mut status_msg = String::new();
        if status < 0 {
            status_msg = props
                .get_str(fmt.key("m", "Status-message"))
                .unwrap_or("")
                .to_string();
        }
        self.content_length = props.get_i64(fmt.key("l", "Content-length"), 0).max(0) as usize;

        // Authenticate replies are handled out of band.
        let handshake_done = self.is_handshake_done();
        if let Some(auth_seq) = self.auth.as_ref().map(|a| a.base.seq) {
            if !handshake_done || seq == auth_seq {
                if seq != auth_seq {
                    error!(
                        "authentication response seq number mismatch: {seq}/{auth_seq}"
                    );
                    self.error("authentication protocol error");
                    return false;
                }
                let auth = self.auth.as_mut().unwrap();
                auth.base.status = status;
                auth.response_content_length = self.content_length;
                if status < 0 {
                    auth.base.status_msg = status_msg;
                }
                if !auth.parse_response(&props) && status >= 0 {
                    error!("invalid authentication response: seq: {seq}");
                    self.error("invalid meta server response");
                    return false;
                }
                self.handle_auth_response();
                return false;
            }
        }

        if !matches!(self.hello, HelloState::None) {
            return self.handle_hello_reply(seq, status, &status_msg, &props);
        }

        let mut op = match self.dispatched_ops.remove(&seq) {
            Some(op) => op,
            None => {
                error!("meta reply: no op found for: {}", props.joined());
                self.error("protocol invalid sequence");
                return false;
            }
        };
        op.set_status(status);
        if status < 0 && op.status_msg().is_empty() {
            op.set_status_msg(status_msg);
        }
        if !op.parse_response(&props) && status >= 0 {
            error!("invalid meta reply response: seq: {} {}", seq, op.show());
            self.dispatched_ops.insert(seq, op);
            self.error("meta response parse error");
            return false;
        }
        self.finish_reply(ReplyOp::Normal(op))
    }

    fn format_probe_armed(&self) -> bool {
        self.auth
            .as_ref()
            .map(|a| a.req_short_rpc_fmt)
            .unwrap_or(false)
            || matches!(&self.hello, HelloState::Sent(op) if op.req_short_rpc_fmt)
    }

    fn handle_hello_reply(
        &mut self,
        seq: Seq,
        status: i32,
        status_msg: &str,
        props: &HeaderProps,
    ) -> bool {
        if status == -status::EBADCLUSTERKEY {
            error!(
                "exiting due to cluster key mismatch; our key: {}",
                self.cluster_key
            );
            self.net.shutdown();
            return false;
        }
        self.counters.hello_count += 1;
        let fmt = self.rpc_format;
        let mut op = match std::mem::replace(&mut self.hello, HelloState::None) {
            HelloState::Sent(op) => op,
            other => {
                // A reply raced a hello that was never written; the
                // stream is out of step with the handshake.
                self.hello = other;
                error!("hello response with no hello request outstanding");
                self.counters.hello_error_count += 1;
                self.error("handshake error");
                return false;
            }
        };
        let reply_resume = if status == 0 {
            props.get_i32(fmt.key("R", "Resume"), -1)
        } else {
            -1
        };
        let error_flag = seq != op.base.seq
            || (status != 0 && self.content_length > 0)
            || (op.resume_step != 0 && self.content_length > 0)
            || (op.resume_step < 0 && status != 0)
            || (op.resume_step >= 0 && status != 0 && status != -status::EAGAIN)
            || (op.resume_step >= 0 && status == 0 && reply_resume != op.resume_step);
        if error_flag {
            error!(
                "hello response error: seq: {seq} => {} status: {status} msg: {status_msg} resume: {} / {reply_resume} content len: {}",
                op.base.seq, op.resume_step, self.content_length
            );
            self.counters.hello_error_count += 1;
        } else if status == 0 {
            op.meta_file_system_id = props.get_i64(fmt.key("FI", "File-system-id"), -1);
            let delete_all_id = props.get_i64(fmt.key("DA", "Delete-all-chunks"), -1);
            op.delete_all_chunks = op.meta_file_system_id > 0
                && delete_all_id == op.meta_file_system_id
                && op.file_system_id > 0
                && op.file_system_id != op.meta_file_system_id;
            if op.meta_file_system_id > 0 {
                self.chunk_manager
                    .borrow_mut()
                    .set_file_system_id(op.meta_file_system_id, op.delete_all_chunks);
            }
            op.deleted_count = props.get_u64(fmt.key("D", "Deleted"), 0);
            op.modified_count = props.get_u64(fmt.key("M", "Modified"), 0);
            op.meta_chunk_count = props.get_u64(fmt.key("C", "Chunks"), 0);
            op.checksum = if props.has(fmt.key("K", "Checksum")) {
                Some(props.get_u64(fmt.key("K", "Checksum"), 0))
            } else {
                None
            };
            op.deleted_report =
                props.get_u64(fmt.key("DR", "Deleted-report"), op.deleted_count);
            op.pending_notify = props.get_bool(fmt.key("PN", "Pending-notify"), false);
            self.max_pending_ops = props
                .get_i64(fmt.key("MP", "Max-pending"), DEFAULT_MAX_PENDING_OPS as i64)
                .max(1) as usize;
        } else {
            // Resume rejected with EAGAIN: fall back to a full-state
            // hello with a freshly computed inventory.
            op.resume_step = -1;
            self.sent_hello = false;
            op.base.seq = self.next_seq();
            self.hello = HelloState::Executing { seq: op.base.seq };
            self.chunk_server.borrow_mut().submit_op(op);
            return true;
        }
        if error_flag || op.resume_step != 0 {
            self.update_current_key = !error_flag && op.send_current_key;
            if self.update_current_key {
                self.current_key_id = op.current_key_id.clone();
            }
            if error_flag {
                self.error("handshake error");
                return false;
            }
            // Handshake complete.
            self.connected_time = self.net.now();
            let lost_dirs = std::mem::take(&mut op.lost_chunk_dirs);
            drop(op);
            if self.is_up() {
                self.counters.hello_done_count += 1;
                for dir in lost_dirs {
                    if !self.is_connected() {
                        break;
                    }
                    self.enqueue_op(Box::new(CorruptChunkOp::new(dir)));
                }
                self.dispatch_ops();
            }
            return true;
        }
        // Resume step 0 accepted; absorb the inventory delta content,
        // then advance to step 1.
        self.finish_reply(ReplyOp::Hello(op))
    }

    /// Common tail for outbound replies: wait for and parse the body,
    /// then complete or resubmit the op.
    fn finish_reply(&mut self, mut op: ReplyOp) -> bool {
        if self.content_length > 0 {
            let avail = self.in_buf_len();
            if avail < self.content_length {
                let need = self.content_length - avail;
                let ahead = self.max_read_ahead.max(need);
                self.conn.as_mut().unwrap().set_max_read_ahead(ahead);
                if matches!(op, ReplyOp::Hello(_)) {
                    self.hello = HelloState::InContent;
                }
                self.in_flight = InFlight::Reply(op);
                return false;
            }
            let body = {
                let conn = self.conn.as_mut().unwrap();
                conn.set_max_read_ahead(self.max_read_ahead);
                conn.in_buffer().split_to(self.content_length)
            };
            let len = self.content_length;
            self.content_length = 0;
            let ok = match &mut op {
                ReplyOp::Hello(h) => h.parse_response_content(&body),
                ReplyOp::Normal(o) => o.parse_response_content(&body),
            };
            if !ok {
                match op {
                    ReplyOp::Hello(h) => {
                        error!(
                            "invalid hello response content: {} content len: {len}",
                            h.show()
                        );
                    }
                    ReplyOp::Normal(o) => {
                        error!(
                            "invalid meta reply response content: {} content len: {len}",
                            o.show()
                        );
                        // Fail it through the disconnect path with the
                        // rest of the dispatched ops.
                        self.dispatched_ops.insert(o.seq(), o);
                    }
                }
                self.error("response body parse error");
                return false;
            }
        }
        match op {
            ReplyOp::Hello(mut op) => {
                if op.resume_step == 0 {
                    op.resume_step = 1;
                }
                self.sent_hello = false;
                op.base.seq = self.next_seq();
                self.hello = HelloState::Executing { seq: op.base.seq };
                self.chunk_server.borrow_mut().submit_op(op);
                true
            }
            ReplyOp::Normal(op) => {
                debug!(
                    "recv meta reply: seq: {} status: {} {}",
                    op.seq(),
                    op.status(),
                    op.show()
                );
                self.chunk_server.borrow_mut().submit_op_response(op);
                true
            }
        }
    }

    fn handle_cmd(&mut self, msg_len: usize) -> bool {
        let header: Vec<u8> = {
            let conn = self.conn.as_mut().unwrap();
            conn.in_buffer().as_slice()[..msg_len].to_vec()
        };
        let mut op = match self.parser.parse(&header, self.rpc_format) {
            Ok(op) => op,
            Err(err) => {
                let peer = self.peer_name();
                error!("{peer} invalid meta request: {err}");
                for line in String::from_utf8_lossy(&header).lines().take(32) {
                    error!("{peer} invalid meta request: {line}");
                }
                if let Some(conn) = self.conn.as_mut() {
                    conn.in_buffer().clear();
                }
                self.error("request parse error");
                return false;
            }
        };
        {
            let conn = self.conn.as_mut().unwrap();
            if self.trace_rpc {
                for line in conn.in_buffer().lines(msg_len) {
                    debug!("{} meta request: {line}", self.location);
                }
            }
            conn.in_buffer().consume(msg_len);
        }
        op.set_generation(self.generation);
        self.content_length = op.content_length();
        self.handle_cmd_body(op)
    }

    /// Body wait and execution hand-off for an inbound command.
    fn handle_cmd_body(&mut self, mut op: Box<dyn MetaOp>) -> bool {
        let avail = self.in_buf_len();
        if avail < self.content_length {
            let need = self.content_length - avail;
            let ahead = self.max_read_ahead.max(need);
            self.conn.as_mut().unwrap().set_max_read_ahead(ahead);
            self.in_flight = InFlight::Cmd(op);
            return false;
        }
        if let Some(conn) = self.conn.as_mut() {
            conn.set_max_read_ahead(self.max_read_ahead);
        }
        if self.content_length > 0 {
            let body = {
                let conn = self.conn.as_mut().unwrap();
                conn.in_buffer().split_to(self.content_length)
            };
            self.content_length = 0;
            if !op.parse_content(&body) {
                error!(
                    "{} invalid content: {} cmd: {}",
                    self.peer_name(),
                    op.status_msg(),
                    op.show()
                );
                self.error("request body parse error");
                return false;
            }
        }
        self.last_recv_cmd_time = self.net.now();
        debug!("recv meta cmd: seq: {} {}", op.seq(), op.show());
        if self.auth.is_none() && op.kind() == OpKind::Heartbeat {
            let (reauth, max_pending) = {
                let hb = op.heartbeat_mut().expect("heartbeat op");
                (hb.authenticate, hb.max_pending_ops)
            };
            if reauth && self.authenticate() && !self.is_up() {
                // Dropping the heartbeat is fine; the meta server
                // resends after the authentication round trip.
                return false;
            }
            self.max_pending_ops = max_pending.max(1);
        }
        self.chunk_server.borrow_mut().submit_op(op);
        true
    }

    fn handle_auth_response(&mut self) {
        if self.auth.is_none() || self.conn.is_none() {
            panic!("handle auth response: invalid invocation");
        }
        let mut auth = self.auth.take().unwrap();
        let remaining = {
            let conn = self.conn.as_mut().unwrap();
            auth.read_response_content(conn.in_buffer())
        };
        if remaining > 0 {
            // Read past the declared length on purpose so trailing
            // garbage is caught below.
            let ahead = remaining + self.max_read_ahead;
            self.conn.as_mut().unwrap().set_max_read_ahead(ahead);
            self.auth = Some(auth);
            return;
        }
        let extra = self.in_buf_len();
        if extra > 0 {
            error!(
                "authentication protocol failure: {extra} bytes past authentication response: {}",
                auth.show()
            );
            if !auth.base.status_msg.is_empty() {
                auth.base.status_msg += "; ";
            }
            auth.base.status_msg += "invalid extraneous data received";
            auth.base.status = -status::EINVAL;
        } else if auth.base.status == 0 {
            let handshake_done = self.is_handshake_done();
            let conn = self.conn.as_mut().unwrap();
            if conn.has_filter() {
                if handshake_done {
                    // Retire the previous round's filter first; the
                    // shutdown completion re-enters through the event
                    // path.
                    conn.shutdown_filter();
                    self.auth = Some(auth);
                    return;
                }
                if !auth.base.status_msg.is_empty() {
                    auth.base.status_msg += "; ";
                }
                auth.base.status_msg +=
                    "authentication protocol failure: filter exists prior to handshake completion";
                auth.base.status = -status::EINVAL;
            } else {
                let result = self.auth_ctx.response(
                    auth.chosen_auth_type,
                    auth.use_ssl,
                    &auth.response_buf,
                    conn.as_mut(),
                );
                if let Err(msg) = result {
                    auth.base.status = -status::EINVAL;
                    auth.base.status_msg = msg;
                }
            }
        }
        let ok = auth.base.status == 0;
        if ok {
            info!("finished: {}", auth.show());
        } else {
            error!("finished: {} status: {}", auth.show(), auth.base.status);
        }
        self.content_length = 0;
        drop(auth);
        if !ok {
            self.error("authentication protocol error");
            return;
        }
        if self.is_handshake_done() {
            while let Some(op) = self.pending_responses.pop_front() {
                self.send_response(op);
            }
            if !self.pending_ops.is_empty() {
                self.net.wakeup();
            }
            return;
        }
        if !matches!(self.hello, HelloState::None) {
            panic!("hello op in flight prior to authentication completion");
        }
        if !self.pending_responses.is_empty() {
            panic!("non empty pending responses prior to handshake completion");
        }
        self.submit_hello();
    }

    /// Serialize an outbound request into the connection buffer.
    fn write_request(&mut self, op: &mut dyn MetaOp) {
        op.set_status(0);
        debug!("cs request: seq: {} {}", op.seq(), op.show());
        let fmt = self.rpc_format;
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let start = conn.out_buffer().bytes_consumable();
        op.request(fmt, conn.out_buffer());
        if self.trace_rpc {
            trace_block("cs request", &conn.out_buffer().as_slice()[start..]);
        }
    }

    /// Write the reply for a completed inbound op, or queue/discard it.
    fn send_response(&mut self, op: Box<dyn MetaOp>) {
        let discard =
            !self.sent_hello || op.generation() != self.generation || !self.is_connected();
        debug!(
            "{} meta reply: seq: {} status: {} {}",
            if discard { "discard" } else { "send" },
            op.seq(),
            op.status(),
            op.show()
        );
        if discard {
            // The meta server purges its pending queue on disconnect;
            // the hello resynchronizes the inventory.
            return;
        }
        if self.auth.is_some() {
            self.pending_responses.push_back(op);
            return;
        }
        if op.kind() == OpKind::AllocChunk {
            self.counters.alloc_count += 1;
            if op.status() < 0 {
                self.counters.alloc_error_count += 1;
            }
        }
        let fmt = self.rpc_format;
        let trace = self.trace_rpc;
        let conn = self.conn.as_mut().unwrap();
        let start = conn.out_buffer().bytes_consumable();
        op.response(fmt, conn.out_buffer());
        let content = op.response_content();
        if !content.is_empty() {
            conn.out_buffer().append(content);
        }
        if trace {
            trace_block("cs response", &conn.out_buffer().as_slice()[start..]);
        }
    }

    /// Drain the pending queue into the dispatch window.
    fn dispatch_ops(&mut self) {
        if !self.is_up() || self.auth.is_some() || self.pending_ops.is_empty() {
            return;
        }
        let mut completed: Vec<Box<dyn MetaOp>> = Vec::new();
        let mut count = self.dispatched_ops.len();
        while count < self.max_pending_ops {
            let Some(mut op) = self.pending_ops.pop_front() else {
                break;
            };
            debug_assert!(op.kind() != OpKind::Hello);
            op.set_seq(self.next_seq());
            self.write_request(op.as_mut());
            if op.no_reply() {
                completed.push(op);
            } else if self.dispatched_ops.insert(op.seq(), op).is_some() {
                panic!("duplicate sequence number");
            }
            count += 1;
        }
        for op in completed {
            self.chunk_server.borrow_mut().submit_op_response(op);
        }
    }

    /// Universal disconnect path: closes the connection, advances the
    /// generation, tells the collaborators, and fails every op still in
    /// the session with host-unreachable.
    fn error(&mut self, msg: &str) {
        self.cleanup_in_flight();
        self.auth = None;
        self.discard_pending_responses();
        if let Some(mut conn) = self.conn.take() {
            self.generation = self.generation.wrapping_add(1);
            if self.net.is_running() {
                error!(
                    "{} closing meta server connection due to {msg}",
                    self.location
                );
            } else {
                debug!(
                    "{} closing meta server connection due to {msg}",
                    self.location
                );
            }
            conn.in_buffer().clear();
            conn.close();
            self.lease_clerk.borrow_mut().unregister_all_leases();
            // The meta server fails replications tied to this session on
            // disconnect anyway.
            self.replicator.borrow_mut().cancel_session_replications();
            self.chunk_manager.borrow_mut().meta_server_connection_lost();
        }
        self.fail_ops();
        self.sent_hello = false;
        self.hello = HelloState::None;
        self.content_length = 0;
    }

    fn cleanup_in_flight(&mut self) {
        match std::mem::replace(&mut self.in_flight, InFlight::None) {
            InFlight::None => {}
            // Never started executing; nobody is waiting on it.
            InFlight::Cmd(_) => {}
            // The hello dies with the handshake.
            InFlight::Reply(ReplyOp::Hello(_)) => {}
            InFlight::Reply(ReplyOp::Normal(op)) => {
                // Fail it with the rest of the dispatched ops.
                self.dispatched_ops.insert(op.seq(), op);
            }
        }
    }

    fn fail_ops(&mut self) {
        let dispatched = std::mem::take(&mut self.dispatched_ops);
        let pending = std::mem::take(&mut self.pending_ops);
        for mut op in dispatched.into_values().chain(pending) {
            op.set_status(-status::EHOSTUNREACH);
            self.chunk_server.borrow_mut().submit_op_response(op);
        }
    }

    fn discard_pending_responses(&mut self) {
        self.pending_responses.clear();
    }
}

impl TimeoutHandler for MetaServerSession {
    fn timeout(&mut self) {
        MetaServerSession::timeout(self);
    }
}

fn trace_block(label: &str, bytes: &[u8]) {
    for line in bytes.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        debug!("{label}: {}", String::from_utf8_lossy(line));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthRequest, DisabledAuthContext, AUTH_TYPE_PSK};
    use crate::ops::{HeartbeatOp, OpBase};
    use driftfs_netio::IoBuffer;
    use std::any::Any;
    use std::cell::Cell;

    #[derive(Default)]
    struct TestNetManager {
        now: Cell<i64>,
        stopped: Cell<bool>,
        shutdown_calls: Cell<u32>,
        wakeups: Cell<u32>,
    }

    impl NetManager for TestNetManager {
        fn now(&self) -> i64 {
            self.now.get()
        }
        fn is_running(&self) -> bool {
            !self.stopped.get()
        }
        fn shutdown(&self) {
            self.shutdown_calls.set(self.shutdown_calls.get() + 1);
            self.stopped.set(true);
        }
        fn wakeup(&self) {
            self.wakeups.set(self.wakeups.get() + 1);
        }
    }

    struct TestConnection {
        good: Rc<Cell<bool>>,
        filter: Rc<Cell<bool>>,
        in_buf: IoBuffer,
        out_buf: IoBuffer,
        local: ServerLocation,
    }

    impl Connection for TestConnection {
        fn is_good(&self) -> bool {
            self.good.get()
        }
        fn close(&mut self) {
            self.good.set(false);
        }
        fn in_buffer(&mut self) -> &mut IoBuffer {
            &mut self.in_buf
        }
        fn out_buffer(&mut self) -> &mut IoBuffer {
            &mut self.out_buf
        }
        fn start_flush(&mut self) {}
        fn set_max_read_ahead(&mut self, _bytes: usize) {}
        fn set_inactivity_timeout(&mut self, _secs: i64) {}
        fn local_location(&self) -> Result<ServerLocation> {
            Ok(self.local.clone())
        }
        fn peer_name(&self) -> String {
            "test-meta".to_string()
        }
        fn has_filter(&self) -> bool {
            self.filter.get()
        }
        fn shutdown_filter(&mut self) {
            self.filter.set(false);
        }
    }

    struct ConnectorState {
        attempts: u32,
        fail: bool,
        local: ServerLocation,
        state: ConnectState,
        last_good: Option<Rc<Cell<bool>>>,
    }

    impl Default for ConnectorState {
        fn default() -> Self {
            Self {
                attempts: 0,
                fail: false,
                local: ServerLocation::new("10.4.0.9", 33333),
                state: ConnectState::Connected,
                last_good: None,
            }
        }
    }

    struct TestConnector(Rc<RefCell<ConnectorState>>);

    impl Connector for TestConnector {
        fn connect(
            &mut self,
            _location: &ServerLocation,
        ) -> Result<(Box<dyn Connection>, ConnectState)> {
            let mut state = self.0.borrow_mut();
            state.attempts += 1;
            if state.fail {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "connection refused",
                )));
            }
            let good = Rc::new(Cell::new(true));
            state.last_good = Some(good.clone());
            let conn = TestConnection {
                good,
                filter: Rc::new(Cell::new(false)),
                in_buf: IoBuffer::new(),
                out_buf: IoBuffer::new(),
                local: state.local.clone(),
            };
            Ok((Box::new(conn), state.state))
        }
    }

    #[derive(Default)]
    struct TestChunkServer {
        location: ServerLocation,
        can_update_ip: bool,
        submitted: Vec<Box<dyn MetaOp>>,
        responses: Vec<Box<dyn MetaOp>>,
    }

    impl ChunkServer for TestChunkServer {
        fn can_update_server_ip(&self) -> bool {
            self.can_update_ip
        }
        fn location(&self) -> ServerLocation {
            self.location.clone()
        }
        fn set_location(&mut self, location: ServerLocation) {
            self.location = location;
        }
        fn submit_op(&mut self, op: Box<dyn MetaOp>) {
            self.submitted.push(op);
        }
        fn submit_op_response(&mut self, op: Box<dyn MetaOp>) {
            self.responses.push(op);
        }
    }

    #[derive(Default)]
    struct TestChunkManager {
        fs_ids: Vec<(i64, bool)>,
        lost_count: u32,
        crypto_key: Option<(String, Vec<u8>)>,
    }

    impl ChunkManager for TestChunkManager {
        fn set_file_system_id(&mut self, fs_id: i64, delete_all_chunks: bool) {
            self.fs_ids.push((fs_id, delete_all_chunks));
        }
        fn current_crypto_key(&self) -> Option<(String, Vec<u8>)> {
            self.crypto_key.clone()
        }
        fn meta_server_connection_lost(&mut self) {
            self.lost_count += 1;
        }
    }

    #[derive(Default)]
    struct TestLeaseClerk {
        unregister_count: u32,
    }

    impl LeaseClerk for TestLeaseClerk {
        fn unregister_all_leases(&mut self) {
            self.unregister_count += 1;
        }
    }

    #[derive(Default)]
    struct TestReplicator {
        cancel_count: u32,
    }

    impl Replicator for TestReplicator {
        fn cancel_session_replications(&mut self) {
            self.cancel_count += 1;
        }
    }

    /// Inbound op with an optional body, for exercising the command
    /// path.
    struct TestInboundOp {
        base: OpBase,
        body_len: usize,
        body: Vec<u8>,
    }

    impl MetaOp for TestInboundOp {
        fn base(&self) -> &OpBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut OpBase {
            &mut self.base
        }
        fn kind(&self) -> OpKind {
            OpKind::StaleChunks
        }
        fn request(&self, _fmt: RpcFormat, _buf: &mut IoBuffer) {
            unreachable!("inbound only");
        }
        fn content_length(&self) -> usize {
            self.body_len
        }
        fn parse_content(&mut self, data: &[u8]) -> bool {
            self.body = data.to_vec();
            true
        }
        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    struct TestParser;

    impl CommandParser for TestParser {
        fn parse(
            &mut self,
            header: &[u8],
            fmt: RpcFormat,
        ) -> std::result::Result<Box<dyn MetaOp>, String> {
            let text = std::str::from_utf8(header).map_err(|_| "binary header".to_string())?;
            let verb = text.lines().next().unwrap_or("").trim();
            let props = HeaderProps::parse(header, fmt.is_short());
            match verb {
                "HEARTBEAT" => Ok(Box::new(HeartbeatOp::from_props(&props, fmt))),
                "STALE_CHUNKS" => Ok(Box::new(TestInboundOp {
                    base: OpBase {
                        seq: props.get_i64(fmt.key("c", "Cseq"), -1),
                        ..OpBase::new()
                    },
                    body_len: props.get_i64(fmt.key("l", "Content-length"), 0).max(0) as usize,
                    body: Vec::new(),
                })),
                other => Err(format!("unknown command: {other}")),
            }
        }
    }

    /// Generic outbound op for queueing tests.
    struct TestOp {
        base: OpBase,
        kind: OpKind,
        no_reply: bool,
        tag: u32,
        content: Vec<u8>,
    }

    impl TestOp {
        fn new(tag: u32) -> Box<Self> {
            Box::new(Self {
                base: OpBase::new(),
                kind: OpKind::Unknown,
                no_reply: false,
                tag,
                content: Vec::new(),
            })
        }
    }

    impl MetaOp for TestOp {
        fn base(&self) -> &OpBase {
            &self.base
        }
        fn base_mut(&mut self) -> &mut OpBase {
            &mut self.base
        }
        fn kind(&self) -> OpKind {
            self.kind
        }
        fn no_reply(&self) -> bool {
            self.no_reply
        }
        fn request(&self, fmt: RpcFormat, buf: &mut IoBuffer) {
            let mut w = crate::rpc::HeaderWriter::new(buf, fmt);
            w.verb("SIZE")
                .field_i64("c", "Cseq", self.seq())
                .field_u64("T", "Tag", self.tag as u64);
            w.finish();
        }
        fn parse_response_content(&mut self, data: &[u8]) -> bool {
            self.content = data.to_vec();
            true
        }
        fn into_any(self: Box<Self>) -> Box<dyn Any> {
            self
        }
    }

    struct ScriptedAuth {
        request_blob: Vec<u8>,
        response_ok: bool,
        requests: Rc<Cell<u32>>,
        cleared: Rc<Cell<bool>>,
    }

    impl ScriptedAuth {
        fn new() -> Self {
            Self {
                request_blob: b"psk-hello".to_vec(),
                response_ok: true,
                requests: Rc::new(Cell::new(0)),
                cleared: Rc::new(Cell::new(false)),
            }
        }
    }

    impl AuthContext for ScriptedAuth {
        fn set_parameters(&mut self, _prefix: &str, _props: &Properties) -> Result<()> {
            Ok(())
        }
        fn is_enabled(&self) -> bool {
            true
        }
        fn check_auth_type(&self, _auth_type: u32) -> Result<bool> {
            Ok(false)
        }
        fn request(&mut self, _auth_type: u32) -> Result<AuthRequest> {
            self.requests.set(self.requests.get() + 1);
            Ok(AuthRequest {
                requested_auth_type: AUTH_TYPE_PSK,
                content: self.request_blob.clone(),
            })
        }
        fn response(
            &mut self,
            _chosen_auth_type: u32,
            _use_ssl: bool,
            _content: &[u8],
            _conn: &mut dyn Connection,
        ) -> std::result::Result<(), String> {
            if self.response_ok {
                Ok(())
            } else {
                Err("mechanism rejected".to_string())
            }
        }
        fn clear(&mut self) {
            self.cleared.set(true);
        }
    }

    struct Harness {
        net: Rc<TestNetManager>,
        connector: Rc<RefCell<ConnectorState>>,
        chunk_server: Rc<RefCell<TestChunkServer>>,
        chunk_manager: Rc<RefCell<TestChunkManager>>,
        lease_clerk: Rc<RefCell<TestLeaseClerk>>,
        replicator: Rc<RefCell<TestReplicator>>,
        session: MetaServerSession,
    }

    fn harness_with_auth(auth: Box<dyn AuthContext>) -> Harness {
        let net = Rc::new(TestNetManager::default());
        net.now.set(5);
        let connector = Rc::new(RefCell::new(ConnectorState::default()));
        let chunk_server = Rc::new(RefCell::new(TestChunkServer::default()));
        let chunk_manager = Rc::new(RefCell::new(TestChunkManager::default()));
        let lease_clerk = Rc::new(RefCell::new(TestLeaseClerk::default()));
        let replicator = Rc::new(RefCell::new(TestReplicator::default()));
        let mut session = MetaServerSession::new(SessionContext {
            net: net.clone(),
            connector: Box::new(TestConnector(connector.clone())),
            auth,
            chunk_server: chunk_server.clone(),
            chunk_manager: chunk_manager.clone(),
            lease_clerk: lease_clerk.clone(),
            replicator: replicator.clone(),
            parser: Box::new(TestParser),
        });
        session
            .set_meta_info(
                ServerLocation::new("10.1.1.1", 20000),
                "test-cluster",
                1,
                "0123abcd",
                &Properties::new(),
            )
            .unwrap();
        session.init().unwrap();
        Harness {
            net,
            connector,
            chunk_server,
            chunk_manager,
            lease_clerk,
            replicator,
            session,
        }
    }

    fn harness() -> Harness {
        harness_with_auth(Box::new(DisabledAuthContext))
    }

    fn feed(h: &mut Harness, bytes: &[u8]) {
        h.session
            .conn
            .as_mut()
            .expect("connected")
            .in_buffer()
            .append(bytes);
        h.session.handle_event(NetEvent::Read);
    }

    fn out_text(h: &mut Harness) -> String {
        let buf = h.session.conn.as_mut().expect("connected").out_buffer();
        String::from_utf8_lossy(buf.as_slice()).into_owned()
    }

    /// Drive the session through connect and a full-state hello.
    fn bring_up(h: &mut Harness) {
        h.session.timeout();
        let hello = h
            .chunk_server
            .borrow_mut()
            .submitted
            .pop()
            .expect("hello submitted");
        assert_eq!(hello.kind(), OpKind::Hello);
        let seq = hello.seq();
        h.session.handle_op_done(hello);
        feed(h, format!("OK\r\nCseq: {seq}\r\nStatus: 0\r\n\r\n").as_bytes());
        assert!(h.session.is_up());
    }

    #[test]
    fn test_connect_and_handshake() {
        let mut h = harness();
        bring_up(&mut h);
        assert_eq!(h.session.counters().connect_count, 1);
        assert_eq!(h.session.counters().hello_count, 1);
        assert_eq!(h.session.counters().hello_done_count, 1);
        assert_eq!(h.session.counters().hello_error_count, 0);
        assert!(h.session.is_handshake_done());
        assert_eq!(h.session.connection_uptime(), 0);
        h.net.now.set(12);
        assert_eq!(h.session.connection_uptime(), 7);
        // Probe resolved the dialect from the Cseq key.
        assert_eq!(h.session.rpc_format, RpcFormat::Long);
    }

    #[test]
    fn test_backpressure_enqueue_200_ops() {
        let mut h = harness();
        bring_up(&mut h);
        for tag in 0..200 {
            h.session.enqueue_op(TestOp::new(tag));
        }
        assert_eq!(h.session.dispatched_ops.len(), 96);
        assert_eq!(h.session.pending_ops.len(), 104);

        // The first 96 requests went out in admission order.
        let out = out_text(&mut h);
        for tag in 0..96 {
            assert!(out.contains(&format!("Tag: {tag}\r\n")), "tag {tag} missing");
        }
        assert!(!out.contains("Tag: 96\r\n"));

        // Completing one reply opens exactly one dispatch slot, filled
        // by the oldest pending op.
        let (&seq, _) = h.session.dispatched_ops.iter().next().unwrap();
        feed(&mut h, format!("OK\r\nCseq: {seq}\r\nStatus: 0\r\n\r\n").as_bytes());
        assert_eq!(h.chunk_server.borrow().responses.len(), 1);
        h.session.timeout();
        assert_eq!(h.session.dispatched_ops.len(), 96);
        assert_eq!(h.session.pending_ops.len(), 103);
        assert!(out_text(&mut h).contains("Tag: 96\r\n"));
    }

    #[test]
    fn test_socket_death_fails_all_ops_and_reconnects() {
        let mut h = harness();
        bring_up(&mut h);
        for tag in 0..100 {
            h.session.enqueue_op(TestOp::new(tag));
        }
        assert_eq!(h.session.dispatched_ops.len(), 96);
        let generation = h.session.generation;

        h.session.handle_event(NetEvent::Error);

        assert!(!h.session.is_connected());
        assert_eq!(h.session.generation, generation + 1);
        {
            let responses = &h.chunk_server.borrow().responses;
            assert_eq!(responses.len(), 100);
            assert!(responses
                .iter()
                .all(|op| op.status() == -status::EHOSTUNREACH));
        }
        assert_eq!(h.chunk_manager.borrow().lost_count, 1);
        assert_eq!(h.lease_clerk.borrow().unregister_count, 1);
        assert_eq!(h.replicator.borrow().cancel_count, 1);

        // Reconnect within the one second tick.
        h.net.now.set(h.net.now.get() + 2);
        h.session.timeout();
        assert_eq!(h.connector.borrow().attempts, 2);
        assert_eq!(h.chunk_server.borrow().submitted.len(), 1); // new hello
    }

    #[test]
    fn test_hello_seq_mismatch_reconnects_with_new_seq() {
        let mut h = harness();
        h.session.timeout();
        let hello = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        let seq = hello.seq();
        h.session.handle_op_done(hello);
        feed(
            &mut h,
            format!("OK\r\nCseq: {}\r\nStatus: 0\r\n\r\n", seq + 1000).as_bytes(),
        );

        assert_eq!(h.session.counters().hello_error_count, 1);
        assert!(!h.session.is_connected());

        h.net.now.set(h.net.now.get() + 2);
        h.session.timeout();
        let hello2 = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        assert_eq!(hello2.kind(), OpKind::Hello);
        assert_ne!(hello2.seq(), seq);
    }

    #[test]
    fn test_hello_resume_progression() {
        let mut h = harness();
        let mut props = Properties::new();
        props.set("chunkServer.meta.helloResume", "1");
        h.session.set_parameters(&props).unwrap();
        // A previous hello must have completed for resume to engage.
        h.session.counters.hello_done_count = 1;

        h.session.timeout();
        let hello = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        let hello = hello.into_any().downcast::<HelloOp>().unwrap();
        assert_eq!(hello.resume_step, 0);
        let seq = hello.base.seq;
        h.session.handle_op_done(hello);
        feed(
            &mut h,
            format!("OK\r\nCseq: {seq}\r\nStatus: 0\r\nResume: 0\r\n\r\n").as_bytes(),
        );

        // Accepted step zero advances to step one and re-executes.
        let hello = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        let hello = hello.into_any().downcast::<HelloOp>().unwrap();
        assert_eq!(hello.resume_step, 1);
        let seq2 = hello.base.seq;
        assert_ne!(seq2, seq);
        h.session.handle_op_done(hello);
        feed(
            &mut h,
            format!("OK\r\nCseq: {seq2}\r\nStatus: 0\r\nResume: 1\r\n\r\n").as_bytes(),
        );

        assert!(h.session.is_up());
        assert_eq!(h.session.counters().hello_done_count, 2);
        assert_eq!(h.session.connected_time, h.net.now.get());
    }

    #[test]
    fn test_hello_resume_demoted_on_eagain() {
        let mut h = harness();
        let mut props = Properties::new();
        props.set("chunkServer.meta.helloResume", "1");
        h.session.set_parameters(&props).unwrap();
        h.session.counters.hello_done_count = 1;

        h.session.timeout();
        let hello = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        let seq = hello.seq();
        h.session.handle_op_done(hello);
        feed(
            &mut h,
            format!("OK\r\nCseq: {seq}\r\nStatus: -{}\r\n\r\n", status::EAGAIN).as_bytes(),
        );

        // Demoted to a full-state hello, still connected.
        assert!(h.session.is_connected());
        let hello = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        let hello = hello.into_any().downcast::<HelloOp>().unwrap();
        assert_eq!(hello.resume_step, -1);
        assert_ne!(hello.base.seq, seq);
    }

    #[test]
    fn test_bad_cluster_key_is_fatal() {
        let mut h = harness();
        h.session.timeout();
        let hello = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        let seq = hello.seq();
        h.session.handle_op_done(hello);
        feed(
            &mut h,
            format!(
                "OK\r\nCseq: {seq}\r\nStatus: -{}\r\n\r\n",
                status::EBADCLUSTERKEY
            )
            .as_bytes(),
        );
        assert_eq!(h.net.shutdown_calls.get(), 1);
    }

    #[test]
    fn test_no_reply_op_completes_on_write() {
        let mut h = harness();
        bring_up(&mut h);
        let mut op = TestOp::new(7);
        op.no_reply = true;
        h.session.enqueue_op(op);
        assert!(h.session.dispatched_ops.is_empty());
        assert_eq!(h.chunk_server.borrow().responses.len(), 1);
        assert_eq!(h.chunk_server.borrow().responses[0].status(), 0);
    }

    #[test]
    fn test_unknown_reply_sequence_disconnects() {
        let mut h = harness();
        bring_up(&mut h);
        feed(&mut h, b"OK\r\nCseq: 999999999\r\nStatus: 0\r\n\r\n");
        assert!(!h.session.is_connected());
        assert_eq!(h.chunk_manager.borrow().lost_count, 1);
    }

    #[test]
    fn test_short_format_probe() {
        let mut h = harness();
        h.session.timeout();
        let hello = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        let seq = hello.seq();
        h.session.handle_op_done(hello);
        feed(&mut h, format!("OK\r\nc: {seq:x}\r\ns: 0\r\n\r\n").as_bytes());

        assert!(h.session.is_up());
        assert_eq!(h.session.rpc_format, RpcFormat::Short);

        // Subsequent requests use the short dialect.
        h.session.enqueue_op(TestOp::new(0));
        let out = out_text(&mut h);
        let tail = &out[out.rfind("SIZE").unwrap()..];
        assert!(tail.contains("\r\nc: "));
        assert!(!tail.contains("Cseq"));
    }

    #[test]
    fn test_format_probe_failure_is_protocol_error() {
        let mut h = harness();
        h.session.timeout();
        let hello = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        h.session.handle_op_done(hello);
        feed(&mut h, b"OK\r\nBogus: 1\r\n\r\n");
        assert!(!h.session.is_connected());
    }

    #[test]
    fn test_heartbeat_updates_max_pending_and_responds() {
        let mut h = harness();
        bring_up(&mut h);
        feed(
            &mut h,
            b"HEARTBEAT\r\nCseq: 900\r\nMax-pending-ops: 128\r\n\r\n",
        );
        assert_eq!(h.session.max_pending_ops, 128);

        let hb = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        assert_eq!(hb.kind(), OpKind::Heartbeat);
        h.session.handle_op_done(hb);

        let out = out_text(&mut h);
        assert!(out.contains("OK\r\nCseq: 900\r\nStatus: 0\r\n"));
    }

    #[test]
    fn test_inbound_command_body_in_two_chunks() {
        let mut h = harness();
        bring_up(&mut h);
        feed(
            &mut h,
            b"STALE_CHUNKS\r\nCseq: 42\r\nContent-length: 10\r\n\r\n12345",
        );
        // Body incomplete; nothing submitted yet.
        assert!(h.chunk_server.borrow().submitted.is_empty());
        feed(&mut h, b"67890");

        let op = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        let op = op.into_any().downcast::<TestInboundOp>().unwrap();
        assert_eq!(op.body, b"1234567890");
    }

    #[test]
    fn test_reply_body_in_two_chunks() {
        let mut h = harness();
        bring_up(&mut h);
        h.session.enqueue_op(TestOp::new(3));
        let (&seq, _) = h.session.dispatched_ops.iter().next().unwrap();
        feed(
            &mut h,
            format!("OK\r\nCseq: {seq}\r\nStatus: 0\r\nContent-length: 8\r\n\r\nabcd").as_bytes(),
        );
        assert!(h.chunk_server.borrow().responses.is_empty());
        feed(&mut h, b"efgh");

        let op = h.chunk_server.borrow_mut().responses.pop().unwrap();
        let op = op.into_any().downcast::<TestOp>().unwrap();
        assert_eq!(op.content, b"abcdefgh");
        assert_eq!(op.tag, 3);
    }

    #[test]
    fn test_stale_generation_response_discarded() {
        let mut h = harness();
        bring_up(&mut h);
        feed(&mut h, b"HEARTBEAT\r\nCseq: 55\r\nMax-pending-ops: 96\r\n\r\n");
        let hb = h.chunk_server.borrow_mut().submitted.pop().unwrap();

        // The connection dies and comes back before the heartbeat
        // completes.
        h.session.handle_event(NetEvent::Error);
        h.net.now.set(h.net.now.get() + 2);
        bring_up(&mut h);

        let out_before = out_text(&mut h);
        h.session.handle_op_done(hb);
        let out_after = out_text(&mut h);
        assert_eq!(out_before, out_after);
    }

    #[test]
    fn test_inactivity_timeout_disconnects() {
        let mut h = harness();
        bring_up(&mut h);
        h.net.now.set(200);
        h.session.timeout();
        // The stale session was torn down; the same tick already starts
        // the reconnect, so the handshake is pending again.
        assert_eq!(h.chunk_manager.borrow().lost_count, 1);
        assert!(!h.session.is_up());
        assert_eq!(h.session.counters().connect_count, 2);
    }

    #[test]
    fn test_shutdown_fails_everything() {
        let mut h = harness();
        bring_up(&mut h);
        for tag in 0..3 {
            h.session.enqueue_op(TestOp::new(tag));
        }
        h.session.shutdown();
        {
            let responses = &h.chunk_server.borrow().responses;
            assert_eq!(responses.len(), 3);
            assert!(responses
                .iter()
                .all(|op| op.status() == -status::EHOSTUNREACH));
        }

        // Later submissions fail immediately.
        h.session.enqueue_op(TestOp::new(9));
        assert_eq!(h.chunk_server.borrow().responses.len(), 4);
        assert_eq!(
            h.chunk_server.borrow().responses[3].status(),
            -status::EHOSTUNREACH
        );
    }

    #[test]
    fn test_wildcard_local_address_rejected() {
        let mut h = harness();
        h.chunk_server.borrow_mut().can_update_ip = true;
        h.connector.borrow_mut().local = ServerLocation::new("0.0.0.0", 33333);
        h.session.timeout();
        assert!(!h.session.is_connected());
        assert!(h.chunk_server.borrow().submitted.is_empty());
    }

    #[test]
    fn test_wildcard_substituted_for_local_meta_server() {
        let mut h = harness();
        h.session.location = ServerLocation::new("127.0.0.1", 20000);
        h.chunk_server.borrow_mut().can_update_ip = true;
        h.chunk_server.borrow_mut().location = ServerLocation::new("", 22000);
        h.connector.borrow_mut().local = ServerLocation::new("0.0.0.0", 33333);
        h.session.timeout();
        assert_eq!(
            h.chunk_server.borrow().location,
            ServerLocation::new("127.0.0.1", 22000)
        );
        assert_eq!(h.chunk_server.borrow().submitted.len(), 1);
    }

    #[test]
    fn test_lost_chunk_dirs_reported_after_hello() {
        let mut h = harness();
        h.session.timeout();
        let hello = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        let mut hello = hello.into_any().downcast::<HelloOp>().unwrap();
        hello.lost_chunk_dirs = vec!["/data/1".to_string(), "/data/2".to_string()];
        let seq = hello.base.seq;
        h.session.handle_op_done(hello);
        feed(&mut h, format!("OK\r\nCseq: {seq}\r\nStatus: 0\r\n\r\n").as_bytes());

        assert!(h.session.is_up());
        // Fire-and-forget notifications completed on write.
        assert_eq!(h.chunk_server.borrow().responses.len(), 2);
        let out = out_text(&mut h);
        assert!(out.contains("CORRUPT_CHUNK\r\n"));
        assert!(out.contains("Chunk-dir: /data/1\r\n"));
        assert!(out.contains("Chunk-dir: /data/2\r\n"));
    }

    #[test]
    fn test_hello_publishes_file_system_id() {
        let mut h = harness();
        h.session.timeout();
        let hello = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        let seq = hello.seq();
        h.session.handle_op_done(hello);
        feed(
            &mut h,
            format!("OK\r\nCseq: {seq}\r\nStatus: 0\r\nFile-system-id: 777\r\nMax-pending: 64\r\n\r\n")
                .as_bytes(),
        );
        assert!(h.session.is_up());
        assert_eq!(h.chunk_manager.borrow().fs_ids, vec![(777, false)]);
        assert_eq!(h.session.max_pending_ops, 64);
    }

    fn auth_bring_up(h: &mut Harness) {
        h.session.timeout();
        // Authentication goes out before the hello.
        assert!(h.session.auth.is_some());
        let auth_seq = h.session.auth.as_ref().unwrap().base.seq;
        assert!(out_text(h).contains("AUTHENTICATE\r\n"));
        feed(
            h,
            format!("OK\r\nCseq: {auth_seq}\r\nStatus: 0\r\nContent-length: 0\r\n\r\n").as_bytes(),
        );
        assert!(h.session.auth.is_none());
        // Auth success submits the hello.
        let hello = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        assert_eq!(hello.kind(), OpKind::Hello);
        let seq = hello.seq();
        h.session.handle_op_done(hello);
        feed(h, format!("OK\r\nCseq: {seq}\r\nStatus: 0\r\n\r\n").as_bytes());
        assert!(h.session.is_up());
    }

    #[test]
    fn test_authenticated_handshake() {
        let auth = ScriptedAuth::new();
        let requests = auth.requests.clone();
        let mut h = harness_with_auth(Box::new(auth));
        auth_bring_up(&mut h);
        assert_eq!(requests.get(), 1);
    }

    #[test]
    fn test_auth_failure_disconnects_and_retries() {
        let mut auth = ScriptedAuth::new();
        auth.response_ok = false;
        let mut h = harness_with_auth(Box::new(auth));
        h.session.timeout();
        let auth_seq = h.session.auth.as_ref().unwrap().base.seq;
        feed(
            &mut h,
            format!("OK\r\nCseq: {auth_seq}\r\nStatus: 0\r\nContent-length: 0\r\n\r\n").as_bytes(),
        );
        assert!(!h.session.is_connected());

        // Retry on the next tick.
        h.net.now.set(h.net.now.get() + 2);
        h.session.timeout();
        assert!(h.session.auth.is_some());
        assert_eq!(h.connector.borrow().attempts, 2);
    }

    #[test]
    fn test_reauth_queues_responses_until_auth_completes() {
        let auth = ScriptedAuth::new();
        let mut h = harness_with_auth(Box::new(auth));
        auth_bring_up(&mut h);

        // The meta server demands re-authentication mid-session.
        feed(
            &mut h,
            b"HEARTBEAT\r\nCseq: 77\r\nAuthenticate: 1\r\nMax-pending-ops: 96\r\n\r\n",
        );
        assert!(h.session.auth.is_some());
        let hb = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        h.session.handle_op_done(hb);

        // The heartbeat response is held back while auth is in flight.
        assert_eq!(h.session.pending_responses.len(), 1);
        let out = out_text(&mut h);
        assert!(!out.contains("Cseq: 77"));

        let auth_seq = h.session.auth.as_ref().unwrap().base.seq;
        feed(
            &mut h,
            format!("OK\r\nCseq: {auth_seq}\r\nStatus: 0\r\nContent-length: 0\r\n\r\n").as_bytes(),
        );
        assert!(h.session.auth.is_none());
        assert!(h.session.pending_responses.is_empty());
        let out = out_text(&mut h);
        assert!(out.contains("OK\r\nCseq: 77\r\nStatus: 0\r\n"));
    }

    #[test]
    fn test_excess_auth_content_is_protocol_error() {
        let auth = ScriptedAuth::new();
        let mut h = harness_with_auth(Box::new(auth));
        h.session.timeout();
        let auth_seq = h.session.auth.as_ref().unwrap().base.seq;
        feed(
            &mut h,
            format!("OK\r\nCseq: {auth_seq}\r\nStatus: 0\r\nContent-length: 4\r\n\r\nblobEXTRA")
                .as_bytes(),
        );
        assert!(!h.session.is_connected());
    }

    #[test]
    fn test_force_down_and_request_reconnect() {
        let mut h = harness();
        bring_up(&mut h);
        h.session.force_down();
        assert!(!h.session.is_connected());

        h.net.now.set(h.net.now.get() + 2);
        bring_up(&mut h);
        h.session.request_reconnect();
        h.session.timeout();
        assert!(!h.session.is_connected());
    }

    #[test]
    fn test_pending_connect_defers_hello_to_write_event() {
        let mut h = harness();
        h.connector.borrow_mut().state = ConnectState::Pending;
        h.session.timeout();
        // Connected socket not yet writable: no hello yet.
        assert!(h.session.is_connected());
        assert!(h.chunk_server.borrow().submitted.is_empty());

        h.session.handle_event(NetEvent::Wrote);
        let hello = h.chunk_server.borrow_mut().submitted.pop().unwrap();
        assert_eq!(hello.kind(), OpKind::Hello);
    }

    #[test]
    fn test_connect_failure_retries_next_tick() {
        let mut h = harness();
        h.connector.borrow_mut().fail = true;
        h.session.timeout();
        assert!(!h.session.is_connected());
        assert_eq!(h.connector.borrow().attempts, 1);

        h.connector.borrow_mut().fail = false;
        h.net.now.set(h.net.now.get() + 2);
        h.session.timeout();
        assert!(h.session.is_connected());
        assert_eq!(h.connector.borrow().attempts, 2);
    }

    #[test]
    fn test_oversized_header_disconnects() {
        let mut h = harness();
        bring_up(&mut h);
        let junk = vec![b'x'; MAX_RPC_HEADER_LEN + 1];
        feed(&mut h, &junk);
        assert!(!h.session.is_connected());
    }
}
