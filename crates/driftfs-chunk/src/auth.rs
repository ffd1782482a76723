//! Authentication context seam
//!
//! The session embeds the authentication handshake in its state machine
//! but delegates the mechanics (Kerberos, X.509, pre-shared key, TLS
//! filter installation) to an [`AuthContext`] supplied by the host. The
//! session only ever sees opaque request/response blobs.

use driftfs_common::{Properties, Result};
use driftfs_netio::Connection;

/// Kerberos 5 authentication.
pub const AUTH_TYPE_KRB5: u32 = 0x1;
/// X.509 client certificate authentication.
pub const AUTH_TYPE_X509: u32 = 0x2;
/// Pre-shared key authentication.
pub const AUTH_TYPE_PSK: u32 = 0x4;

/// Parse a space separated auth type list ("Krb5 X509 PSK") into a
/// bitmask. Unknown names are ignored.
pub fn parse_auth_type_list(list: &str) -> u32 {
    let mut mask = 0;
    for name in list.split_whitespace() {
        match name {
            "Krb5" => mask |= AUTH_TYPE_KRB5,
            "X509" => mask |= AUTH_TYPE_X509,
            "PSK" => mask |= AUTH_TYPE_PSK,
            _ => {}
        }
    }
    mask
}

/// An authentication request blob ready to be sent.
#[derive(Debug)]
pub struct AuthRequest {
    /// Subset of the requested mask this context can actually perform.
    pub requested_auth_type: u32,
    /// Opaque mechanism bytes carried as the request body.
    pub content: Vec<u8>,
}

/// Host-supplied authentication mechanics.
pub trait AuthContext {
    fn set_parameters(&mut self, prefix: &str, props: &Properties) -> Result<()>;

    /// False disables the authentication phase of the handshake
    /// entirely.
    fn is_enabled(&self) -> bool;

    /// Validate the configured auth type mask against the mechanisms
    /// this context supports. `Ok(true)` means authentication is
    /// mandatory for the session.
    fn check_auth_type(&self, auth_type: u32) -> Result<bool>;

    /// Produce the next request blob for the given type mask.
    fn request(&mut self, auth_type: u32) -> Result<AuthRequest>;

    /// Consume the meta server's response. May install a traffic filter
    /// (TLS) on the connection. An `Err` carries the status message for
    /// the failed auth op.
    fn response(
        &mut self,
        chosen_auth_type: u32,
        use_ssl: bool,
        content: &[u8],
        conn: &mut dyn Connection,
    ) -> std::result::Result<(), String>;

    /// Drop all negotiated state.
    fn clear(&mut self);
}

/// Auth context for clusters that run without authentication.
#[derive(Debug, Default)]
pub struct DisabledAuthContext;

impl AuthContext for DisabledAuthContext {
    fn set_parameters(&mut self, _prefix: &str, _props: &Properties) -> Result<()> {
        Ok(())
    }

    fn is_enabled(&self) -> bool {
        false
    }

    fn check_auth_type(&self, _auth_type: u32) -> Result<bool> {
        Ok(false)
    }

    fn request(&mut self, _auth_type: u32) -> Result<AuthRequest> {
        Err(driftfs_common::Error::Authentication(
            "authentication disabled".into(),
        ))
    }

    fn response(
        &mut self,
        _chosen_auth_type: u32,
        _use_ssl: bool,
        _content: &[u8],
        _conn: &mut dyn Connection,
    ) -> std::result::Result<(), String> {
        Err("authentication disabled".into())
    }

    fn clear(&mut self) {}
}
