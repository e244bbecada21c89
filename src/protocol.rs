//! Shared protocol constants for the CSFTP wire format
//!
//! Everything on the wire is big-endian.
//!
//! Request:  u16 target_len | u8 opcode | target bytes
//! Response: u16 size       | u8 status | message bytes   (size = 1 + message len)
//! Payloads: u64 size header followed by raw or gzip bytes

/// Default TCP port for the daemon
pub const DEFAULT_PORT: u16 = 8080;

/// Length of the u64 size header that precedes every raw or compressed payload
pub const SIZE_HEADER_LEN: usize = 8;

/// Longest message a response frame can carry (size field is u16 and includes the status byte)
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize - 1;

/// Longest target a request frame can carry
pub const MAX_TARGET_LEN: usize = u16::MAX as usize;

/// The only valid client signal during adaptive GET
pub const ACK: [u8; 2] = [0x07, 0x00];

/// Separates a session token from the filename when the identity layer is enabled.
/// NUL is never a legal byte in a served filename.
pub const TOKEN_SEPARATOR: char = '\0';

// Request opcodes (numeric values are part of the wire contract)
pub mod opcode {
    pub const GET: u8 = 1;
    pub const PUT: u8 = 2;
    pub const DELETE: u8 = 3;
}

// Response status codes. This table is the single source of truth; handlers
// never use literals.
pub mod status {
    /// Could not create destination file (PUT)
    pub const CREATE_FAILED: u8 = 62;
    /// Could not read declared size header
    pub const SIZE_HEADER_UNREADABLE: u8 = 63;
    /// Transfer I/O error during PUT
    pub const PUT_IO: u8 = 64;
    /// File not found (GET/DELETE)
    pub const NOT_FOUND: u8 = 65;
    /// Could not stat or read file
    pub const STAT_FAILED: u8 = 66;
    /// Missing or unknown session token (identity layer only)
    pub const UNAUTHORIZED: u8 = 67;
    /// Unrecognized request method or unusable operand
    pub const BAD_REQUEST: u8 = 68;
    pub const OK: u8 = 69;
    /// Transfer I/O error during GET / compressed send
    pub const GET_IO: u8 = 70;

    /// Human readable name for logs and the client's printout
    pub fn describe(code: u8) -> &'static str {
        match code {
            CREATE_FAILED => "create failed",
            SIZE_HEADER_UNREADABLE => "size header unreadable",
            PUT_IO => "put transfer error",
            NOT_FOUND => "not found",
            STAT_FAILED => "stat failed",
            UNAUTHORIZED => "unauthorized",
            BAD_REQUEST => "bad request",
            OK => "ok",
            GET_IO => "get transfer error",
            _ => "unknown",
        }
    }
}

// Centralized timeout constants
pub mod timeouts {
    /// Idle deadline between requests on one connection (s)
    pub const IDLE_SECS: u64 = 60;

    /// Interval between settle polls (ms)
    pub const SETTLE_POLL_MS: u64 = 500;

    /// CPU measurement window for each settle poll (ms)
    pub const SETTLE_SAMPLE_MS: u64 = 200;

    /// CPU measurement window for the baseline captured before tier 1 (ms)
    pub const BASELINE_SAMPLE_MS: u64 = 1000;

    /// Default bound on a single ACK wait (s)
    pub const ACK_SECS: u64 = 60;

    /// Default bound on one settle wait (s)
    pub const SETTLE_SECS: u64 = 30;
}
