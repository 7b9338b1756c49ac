//! NNTP protocol plumbing: wire framing, the outbound client, the bounded
//! connection pool, and the inbound server session.
//!
//! Key pieces:
//! - [`wire::NntpStream`] - line framing with dot-stuffing over any stream
//! - [`client::ClientConnection`] - one outbound session
//! - [`pool::ConnPool`] - bounded pool with idle eviction
//! - [`server`] / [`session`] - the inbound acceptor and state machine

pub mod client;
pub mod pool;
pub mod server;
pub mod session;
pub mod wire;

/// NNTP response codes used on this server's wire, named for grepability.
pub mod codes {
    pub const HELP_FOLLOWS: u16 = 100;
    pub const CAPABILITIES_FOLLOW: u16 = 101;
    pub const GREETING_POSTING: u16 = 200;
    pub const GREETING_NO_POSTING: u16 = 201;
    pub const CLOSING: u16 = 205;
    pub const GROUP_SELECTED: u16 = 211;
    pub const LIST_FOLLOWS: u16 = 215;
    pub const ARTICLE_FOLLOWS: u16 = 220;
    pub const HEAD_FOLLOWS: u16 = 221;
    pub const BODY_FOLLOWS: u16 = 222;
    pub const ARTICLE_EXISTS: u16 = 223;
    pub const OVERVIEW_FOLLOWS: u16 = 224;
    pub const IHAVE_ACCEPTED: u16 = 235;
    pub const TAKETHIS_ACCEPTED: u16 = 239;
    pub const POST_ACCEPTED: u16 = 240;
    pub const AUTH_ACCEPTED: u16 = 281;
    pub const IHAVE_SEND: u16 = 335;
    pub const POST_SEND: u16 = 340;
    pub const AUTH_CONTINUE: u16 = 381;
    pub const NO_SUCH_GROUP: u16 = 411;
    pub const NO_GROUP_SELECTED: u16 = 412;
    pub const NO_CURRENT_ARTICLE: u16 = 420;
    pub const NO_SUCH_ARTICLE_NUMBER: u16 = 423;
    pub const NO_SUCH_ARTICLE: u16 = 430;
    pub const IHAVE_NOT_WANTED: u16 = 435;
    pub const IHAVE_RETRY_LATER: u16 = 436;
    pub const TAKETHIS_REJECTED: u16 = 439;
    pub const POST_FAILED: u16 = 441;
    pub const ARTICLE_REMOVED: u16 = 451;
    pub const AUTH_REQUIRED: u16 = 480;
    pub const AUTH_REJECTED: u16 = 481;
    pub const AUTH_OUT_OF_SEQUENCE: u16 = 482;
    pub const UNKNOWN_COMMAND: u16 = 500;
    pub const SYNTAX_ERROR: u16 = 501;
    pub const PERMISSION_DENIED: u16 = 502;
    pub const FEATURE_UNAVAILABLE: u16 = 503;
}
