//! Shared protocol constants for the Tortuga framed transport

// Protocol header constants
pub const MAGIC: &[u8; 4] = b"TRTG";
pub const VERSION: u16 = 1;

// Frame header: MAGIC (4) | VERSION (2) | TYPE (1) | LENGTH (4)
pub const HEADER_LEN: usize = 11;

// Maximum frame payload size (8MB) - prevents DoS via memory exhaustion
pub const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

// File bodies are streamed in DATA frames of at most this many bytes
pub const CHUNK_SIZE: usize = 256 * 1024;

// Per-stream channel depth on either side of the multiplexer
pub const STREAM_BUFFER: usize = 32;

pub const DEFAULT_PORT: u16 = 9031;

// Frame type IDs
pub mod frame {
    // Handshake (after TLS):
    // Client sends HELLO (token bytes)
    // Server responds WELCOME (empty) or DENIED (message) and closes
    pub const HELLO: u8 = 1;
    pub const WELCOME: u8 = 2;
    pub const DENIED: u8 = 3;

    // Stream frames carry a u32 LE stream id first.
    // Read:  OPEN_READ (id|path) -> ACK | FAIL, then DATA* END | FAIL
    // Write: OPEN_WRITE (id|path) -> ACK | FAIL, client DATA* END -> ACK | FAIL
    // A client FAIL on a write stream aborts it; the partial file is removed.
    pub const OPEN_READ: u8 = 4;
    pub const OPEN_WRITE: u8 = 5;
    pub const DATA: u8 = 6;
    pub const END: u8 = 7;
    pub const ACK: u8 = 8;
    pub const FAIL: u8 = 9;

    // Client is done with the session
    pub const BYE: u8 = 10;
}

// Centralized timeout constants. Only the handshake and frame bodies are
// timed; an idle connection or a slow transfer is never cut off.
pub mod timeouts {
    // TCP connect plus TLS handshake plus HELLO/WELCOME (ms)
    pub const HANDSHAKE_MS: u64 = 5000;

    // Base timeout for a payload once its header arrived (ms)
    pub const READ_BASE_MS: u64 = 30_000;

    // Additional timeout per MB of payload (ms)
    pub const PER_MB_MS: u64 = 1000;

    // Calculate read deadline based on payload size (ms)
    // 30s base + 1s per 1MB payload (ceil)
    pub fn read_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        READ_BASE_MS + mb * PER_MB_MS
    }
}
