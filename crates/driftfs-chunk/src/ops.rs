//! Control RPC operations
//!
//! An op is one request/response exchange with the meta server. Outbound
//! ops are initiated by the chunk server and serialize a request;
//! inbound ops arrive from the meta server, are executed by the chunk
//! server and serialize a response. The session owns two special ops
//! outright: the hello and the authenticate exchange of the handshake.

use crate::rpc::{HeaderProps, HeaderWriter, RpcFormat};
use driftfs_common::ServerLocation;
use driftfs_netio::IoBuffer;
use std::any::Any;

/// RPC sequence number.
pub type Seq = i64;

/// Command discriminator. The session only needs to recognize a few
/// kinds specially; everything else flows through untyped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpKind {
    Hello,
    Authenticate,
    Heartbeat,
    AllocChunk,
    CorruptChunk,
    StaleChunks,
    DeleteChunk,
    Unknown,
}

/// State common to every op.
#[derive(Debug, Default)]
pub struct OpBase {
    pub seq: Seq,
    pub status: i32,
    pub status_msg: String,
    /// Session epoch the op was admitted under; stale completions are
    /// discarded on the response path.
    pub generation: u64,
}

impl OpBase {
    pub fn new() -> Self {
        Self {
            seq: -1,
            ..Self::default()
        }
    }
}

/// One meta server RPC exchange.
pub trait MetaOp {
    fn base(&self) -> &OpBase;
    fn base_mut(&mut self) -> &mut OpBase;
    fn kind(&self) -> OpKind;

    /// Ops that expect no reply complete as soon as the request is
    /// written and never enter the dispatch map.
    fn no_reply(&self) -> bool {
        false
    }

    /// One-line description for log messages.
    fn show(&self) -> String {
        format!("{:?} seq: {}", self.kind(), self.seq())
    }

    /// Serialize the request block (outbound ops).
    fn request(&self, fmt: RpcFormat, buf: &mut IoBuffer);

    /// Absorb reply header fields (outbound ops). Returning false marks
    /// the reply malformed.
    fn parse_response(&mut self, props: &HeaderProps) -> bool {
        let _ = props;
        true
    }

    /// Absorb the reply body (outbound ops with content).
    fn parse_response_content(&mut self, data: &[u8]) -> bool {
        let _ = data;
        true
    }

    /// Declared body length of an inbound command.
    fn content_length(&self) -> usize {
        0
    }

    /// Absorb the body of an inbound command.
    fn parse_content(&mut self, data: &[u8]) -> bool {
        let _ = data;
        true
    }

    /// Serialize the response block (inbound ops). The default emits the
    /// standard status-only response.
    fn response(&self, fmt: RpcFormat, buf: &mut IoBuffer) {
        let mut w = HeaderWriter::new(buf, fmt);
        w.verb("OK").field_i64("c", "Cseq", self.seq()).field_i64(
            "s",
            "Status",
            self.status() as i64,
        );
        if self.status() < 0 && !self.status_msg().is_empty() {
            w.field_str("m", "Status-message", self.status_msg());
        }
        w.finish();
    }

    /// Opaque response body of an inbound op, appended after the block.
    fn response_content(&self) -> &[u8] {
        &[]
    }

    /// Concrete access for the session's heartbeat handling.
    fn heartbeat_mut(&mut self) -> Option<&mut HeartbeatOp> {
        None
    }

    /// Recover the concrete type from a boxed op.
    fn into_any(self: Box<Self>) -> Box<dyn Any>;

    // Provided accessors over the base state.

    fn seq(&self) -> Seq {
        self.base().seq
    }
    fn set_seq(&mut self, seq: Seq) {
        self.base_mut().seq = seq;
    }
    fn status(&self) -> i32 {
        self.base().status
    }
    fn set_status(&mut self, status: i32) {
        self.base_mut().status = status;
    }
    fn status_msg(&self) -> &str {
        &self.base().status_msg
    }
    fn set_status_msg(&mut self, msg: String) {
        self.base_mut().status_msg = msg;
    }
    fn generation(&self) -> u64 {
        self.base().generation
    }
    fn set_generation(&mut self, generation: u64) {
        self.base_mut().generation = generation;
    }
}

/// Hello: the inventory-bearing handshake request sent after every
/// (re)connect. The surrounding chunk server fills in the inventory
/// fields before the request goes out; the reply carries the meta
/// server's view back.
#[derive(Debug)]
pub struct HelloOp {
    pub base: OpBase,
    pub location: ServerLocation,
    pub cluster_key: String,
    pub md5sum: String,
    pub rack_id: i32,
    pub no_fids: bool,
    pub hello_done_count: u64,
    /// −1 full-state hello; 0 then 1 for the two resume steps.
    pub resume_step: i32,
    pub send_current_key: bool,
    pub current_key_id: String,
    /// Set when the request was issued while the dialect was still
    /// unnegotiated, arming the reply format probe.
    pub req_short_rpc_fmt: bool,

    // Filled by the chunk server while executing the op.
    pub file_system_id: i64,
    pub chunk_count: u64,
    pub lost_chunk_dirs: Vec<String>,

    // Extracted from the final reply.
    pub meta_file_system_id: i64,
    pub delete_all_chunks: bool,
    pub deleted_count: u64,
    pub modified_count: u64,
    pub meta_chunk_count: u64,
    pub checksum: Option<u64>,
    pub deleted_report: u64,
    pub pending_notify: bool,
    /// Inventory delta blob of a resume-step-0 reply, decoded by the
    /// chunk server.
    pub resume_content: Vec<u8>,
}

impl HelloOp {
    pub fn new(
        location: ServerLocation,
        cluster_key: impl Into<String>,
        md5sum: impl Into<String>,
        rack_id: i32,
    ) -> Self {
        Self {
            base: OpBase::new(),
            location,
            cluster_key: cluster_key.into(),
            md5sum: md5sum.into(),
            rack_id,
            no_fids: true,
            hello_done_count: 0,
            resume_step: -1,
            send_current_key: false,
            current_key_id: String::new(),
            req_short_rpc_fmt: false,
            file_system_id: -1,
            chunk_count: 0,
            lost_chunk_dirs: Vec::new(),
            meta_file_system_id: -1,
            delete_all_chunks: false,
            deleted_count: 0,
            modified_count: 0,
            meta_chunk_count: 0,
            checksum: None,
            deleted_report: 0,
            pending_notify: false,
            resume_content: Vec::new(),
        }
    }
}

impl MetaOp for HelloOp {
    fn base(&self) -> &OpBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }
    fn kind(&self) -> OpKind {
        OpKind::Hello
    }

    fn show(&self) -> String {
        format!(
            "hello seq: {} resume: {} location: {}",
            self.seq(),
            self.resume_step,
            self.location
        )
    }

    fn request(&self, fmt: RpcFormat, buf: &mut IoBuffer) {
        let mut w = HeaderWriter::new(buf, fmt);
        w.verb("HELLO")
            .field_i64("c", "Cseq", self.seq())
            .field_str("SN", "Chunk-server-name", &self.location.hostname)
            .field_i64("SP", "Chunk-server-port", self.location.port as i64)
            .field_str("CK", "Cluster-key", &self.cluster_key)
            .field_str("5", "MD5Sum", &self.md5sum)
            .field_i64("RI", "Rack-id", self.rack_id as i64)
            .field_i64("FI", "File-system-id", self.file_system_id)
            .field_u64("NC", "Num-chunks", self.chunk_count)
            .field_bool("NF", "No-fids", self.no_fids)
            .field_u64("HD", "Num-hello-done", self.hello_done_count)
            .field_i64("R", "Resume", self.resume_step as i64)
            .field_bool("SK", "Send-current-key", self.send_current_key);
        if self.req_short_rpc_fmt {
            w.field_bool("f", "Short-rpc-fmt", true);
        }
        w.finish();
    }

    fn parse_response_content(&mut self, data: &[u8]) -> bool {
        self.resume_content = data.to_vec();
        true
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Authenticate: negotiates an authentication method and carries the
/// opaque mechanism exchange produced by the auth context.
#[derive(Debug)]
pub struct AuthOp {
    pub base: OpBase,
    pub requested_auth_type: u32,
    pub content: Vec<u8>,
    pub req_short_rpc_fmt: bool,

    // Reply state.
    pub chosen_auth_type: u32,
    pub use_ssl: bool,
    pub response_content_length: usize,
    pub response_buf: Vec<u8>,
    /// Reply header parsed; the remaining bytes belong to the response
    /// body.
    pub response_pending: bool,
}

impl AuthOp {
    pub fn new(req_short_rpc_fmt: bool) -> Self {
        Self {
            base: OpBase::new(),
            requested_auth_type: 0,
            content: Vec::new(),
            req_short_rpc_fmt,
            chosen_auth_type: 0,
            use_ssl: false,
            response_content_length: 0,
            response_buf: Vec::new(),
            response_pending: false,
        }
    }

    /// Move available response-body bytes out of the input buffer.
    /// Returns how many bytes are still outstanding.
    pub fn read_response_content(&mut self, buf: &mut IoBuffer) -> usize {
        let need = self
            .response_content_length
            .saturating_sub(self.response_buf.len());
        if need > 0 && !buf.is_empty() {
            let take = need.min(buf.bytes_consumable());
            self.response_buf.extend_from_slice(&buf.as_slice()[..take]);
            buf.consume(take);
        }
        self.response_content_length
            .saturating_sub(self.response_buf.len())
    }
}

impl MetaOp for AuthOp {
    fn base(&self) -> &OpBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }
    fn kind(&self) -> OpKind {
        OpKind::Authenticate
    }

    fn show(&self) -> String {
        format!(
            "authenticate seq: {} requested type: {:#x}",
            self.seq(),
            self.requested_auth_type
        )
    }

    fn request(&self, fmt: RpcFormat, buf: &mut IoBuffer) {
        let mut w = HeaderWriter::new(buf, fmt);
        w.verb("AUTHENTICATE")
            .field_i64("c", "Cseq", self.seq())
            .field_u64("A", "Auth-type", self.requested_auth_type as u64)
            .field_u64("l", "Content-length", self.content.len() as u64);
        if self.req_short_rpc_fmt {
            w.field_bool("f", "Short-rpc-fmt", true);
        }
        w.finish();
        buf.append(&self.content);
    }

    fn parse_response(&mut self, props: &HeaderProps) -> bool {
        self.chosen_auth_type = props.get2_u64("A", "Auth-type", 0) as u32;
        self.use_ssl = props.get2_bool("US", "Use-ssl", false);
        self.response_pending = true;
        true
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Heartbeat: meta-server-initiated liveness and status probe. The
/// response opportunistically carries the current crypto key when it has
/// changed since the last report.
#[derive(Debug, Default)]
pub struct HeartbeatOp {
    pub base: OpBase,
    /// Meta server requests (re)authentication of this session.
    pub authenticate: bool,
    /// New dispatch window advertised by the meta server.
    pub max_pending_ops: usize,
    pub send_current_key: bool,
    pub current_key_id: String,
    pub current_key: Vec<u8>,
}

impl HeartbeatOp {
    /// Build from a parsed inbound command block.
    pub fn from_props(props: &HeaderProps, fmt: RpcFormat) -> Self {
        Self {
            base: OpBase {
                seq: props.get_i64(fmt.key("c", "Cseq"), -1),
                ..OpBase::new()
            },
            authenticate: props.get_bool(fmt.key("A", "Authenticate"), false),
            max_pending_ops: props.get_i64(fmt.key("MP", "Max-pending-ops"), 96).max(1) as usize,
            send_current_key: false,
            current_key_id: String::new(),
            current_key: Vec::new(),
        }
    }
}

impl MetaOp for HeartbeatOp {
    fn base(&self) -> &OpBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }
    fn kind(&self) -> OpKind {
        OpKind::Heartbeat
    }

    fn request(&self, _fmt: RpcFormat, _buf: &mut IoBuffer) {
        unreachable!("heartbeat is meta server initiated");
    }

    fn response(&self, fmt: RpcFormat, buf: &mut IoBuffer) {
        let mut w = HeaderWriter::new(buf, fmt);
        w.verb("OK").field_i64("c", "Cseq", self.seq()).field_i64(
            "s",
            "Status",
            self.status() as i64,
        );
        if self.status() < 0 && !self.status_msg().is_empty() {
            w.field_str("m", "Status-message", self.status_msg());
        }
        if self.send_current_key {
            w.field_str("KI", "CKey-id", &self.current_key_id);
            // Keys are printable by construction (base64 at the source).
            if let Ok(key) = std::str::from_utf8(&self.current_key) {
                w.field_str("KY", "CKey", key);
            }
        }
        w.finish();
    }

    fn heartbeat_mut(&mut self) -> Option<&mut HeartbeatOp> {
        Some(self)
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Corrupt chunk notification: reports a lost or corrupt chunk
/// directory discovered during the hello inventory scan. Fire and
/// forget; the meta server does not reply.
#[derive(Debug)]
pub struct CorruptChunkOp {
    pub base: OpBase,
    pub chunk_dir: String,
    pub dir_ok: bool,
}

impl CorruptChunkOp {
    pub fn new(chunk_dir: impl Into<String>) -> Self {
        Self {
            base: OpBase::new(),
            chunk_dir: chunk_dir.into(),
            dir_ok: false,
        }
    }
}

impl MetaOp for CorruptChunkOp {
    fn base(&self) -> &OpBase {
        &self.base
    }
    fn base_mut(&mut self) -> &mut OpBase {
        &mut self.base
    }
    fn kind(&self) -> OpKind {
        OpKind::CorruptChunk
    }

    fn no_reply(&self) -> bool {
        true
    }

    fn show(&self) -> String {
        format!("corrupt chunk dir seq: {} dir: {}", self.seq(), self.chunk_dir)
    }

    fn request(&self, fmt: RpcFormat, buf: &mut IoBuffer) {
        let mut w = HeaderWriter::new(buf, fmt);
        w.verb("CORRUPT_CHUNK")
            .field_i64("c", "Cseq", self.seq())
            .field_str("CD", "Chunk-dir", &self.chunk_dir)
            .field_bool("DO", "Dir-ok", self.dir_ok);
        w.finish();
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_request_long_format() {
        let mut op = HelloOp::new(
            ServerLocation::new("10.0.0.4", 22000),
            "cluster-a",
            "d41d8cd9",
            3,
        );
        op.set_seq(17);
        op.resume_step = 0;
        op.req_short_rpc_fmt = true;

        let mut buf = IoBuffer::new();
        op.request(RpcFormat::Undef, &mut buf);
        let text = String::from_utf8(buf.as_slice().to_vec()).unwrap();

        assert!(text.starts_with("HELLO\r\n"));
        assert!(text.contains("Cseq: 17\r\n"));
        assert!(text.contains("Cluster-key: cluster-a\r\n"));
        assert!(text.contains("Rack-id: 3\r\n"));
        assert!(text.contains("Resume: 0\r\n"));
        assert!(text.contains("Short-rpc-fmt: 1\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_hello_request_short_format() {
        let mut op = HelloOp::new(ServerLocation::new("10.0.0.4", 22000), "k", "m", -1);
        op.set_seq(0x2a);

        let mut buf = IoBuffer::new();
        op.request(RpcFormat::Short, &mut buf);
        let text = String::from_utf8(buf.as_slice().to_vec()).unwrap();

        assert!(text.contains("c: 2a\r\n"));
        assert!(text.contains("R: -1\r\n"));
        assert!(!text.contains("Cseq"));
    }

    #[test]
    fn test_auth_request_carries_content() {
        let mut op = AuthOp::new(true);
        op.set_seq(5);
        op.requested_auth_type = 0x4;
        op.content = b"psk-blob".to_vec();

        let mut buf = IoBuffer::new();
        op.request(RpcFormat::Undef, &mut buf);
        let bytes = buf.as_slice();
        let text = String::from_utf8_lossy(bytes);

        assert!(text.starts_with("AUTHENTICATE\r\n"));
        assert!(text.contains("Content-length: 8\r\n"));
        assert!(bytes.ends_with(b"\r\npsk-blob"));
    }

    #[test]
    fn test_auth_read_response_content_partial() {
        let mut op = AuthOp::new(false);
        op.response_content_length = 10;

        let mut buf = IoBuffer::new();
        buf.append(b"12345");
        assert_eq!(op.read_response_content(&mut buf), 5);
        assert!(buf.is_empty());

        buf.append(b"67890 extra");
        assert_eq!(op.read_response_content(&mut buf), 0);
        assert_eq!(op.response_buf, b"1234567890");
        assert_eq!(buf.as_slice(), b" extra");
    }

    #[test]
    fn test_heartbeat_from_props_and_response() {
        let props = HeaderProps::parse(
            b"HEARTBEAT\r\nCseq: 9\r\nAuthenticate: 1\r\nMax-pending-ops: 128\r\n\r\n",
            false,
        );
        let mut op = HeartbeatOp::from_props(&props, RpcFormat::Long);
        assert_eq!(op.seq(), 9);
        assert!(op.authenticate);
        assert_eq!(op.max_pending_ops, 128);

        op.send_current_key = true;
        op.current_key_id = "key-7".into();
        op.current_key = b"c2VjcmV0".to_vec();

        let mut buf = IoBuffer::new();
        op.response(RpcFormat::Long, &mut buf);
        let text = String::from_utf8(buf.as_slice().to_vec()).unwrap();
        assert!(text.starts_with("OK\r\nCseq: 9\r\nStatus: 0\r\n"));
        assert!(text.contains("CKey-id: key-7\r\n"));
        assert!(text.contains("CKey: c2VjcmV0\r\n"));
    }

    #[test]
    fn test_corrupt_chunk_is_no_reply() {
        let mut op = CorruptChunkOp::new("/data/3");
        op.set_seq(11);
        assert!(op.no_reply());

        let mut buf = IoBuffer::new();
        op.request(RpcFormat::Long, &mut buf);
        let text = String::from_utf8(buf.as_slice().to_vec()).unwrap();
        assert!(text.starts_with("CORRUPT_CHUNK\r\n"));
        assert!(text.contains("Chunk-dir: /data/3\r\n"));
    }

    #[test]
    fn test_default_response_includes_error_message() {
        let mut op = CorruptChunkOp::new("/d");
        op.set_seq(2);
        op.set_status(-22);
        op.set_status_msg("bad request".into());

        let mut buf = IoBuffer::new();
        MetaOp::response(&op, RpcFormat::Long, &mut buf);
        let text = String::from_utf8(buf.as_slice().to_vec()).unwrap();
        assert!(text.contains("Status: -22\r\n"));
        assert!(text.contains("Status-message: bad request\r\n"));
    }
}
