//! # Wire Protocol
//!
//! Every frame on the binary channel is exactly [`FRAME_SIZE`] bytes; there
//! is no length prefix and peers read and write in 64-byte quanta. Byte 0 is
//! the magic, byte 1 the protocol version, byte 2 the command kind and bytes
//! `3..19` the request id. The command-specific tail layouts:
//!
//! | kind        | tail layout (offset, field)                                   |
//! |-------------|---------------------------------------------------------------|
//! | 0 INIT      | 19..35 client id; rest zero                                   |
//! | 1/2 LOCK/UNLOCK | 19 flag; 20 db id; 21..37 lock id; 37..53 lock key; 53 timeout; 55 timeout flag; 57 expried; 59 expried flag; 61 count; 63 rcount |
//! | 3 STATE     | 19 flag; 20 db id; rest zero                                  |
//! | 4 ADMIN     | 19 admin type; rest zero                                      |
//!
//! All multi-byte integers are little-endian. Results share bytes `0..19`
//! with the request and carry the result code at byte 19; see
//! [`LockResult::encode`] and friends for the result tails.

use num_enum::{IntoPrimitive, TryFromPrimitive};

mod command;
mod result;

pub use command::*;
pub use result::*;

/// First byte of every frame, as a cheap sanity check.
pub const MAGIC: u8 = 0x56;
/// Protocol version carried in byte 1.
pub const VERSION: u8 = 0x01;
/// Size of every frame, requests and results alike.
pub const FRAME_SIZE: usize = 64;

// These values are part of the wire format and shall never be changed.
#[repr(u8)]
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoPrimitive, TryFromPrimitive,
)]
pub enum CommandKind {
    Init = 0,
    Lock = 1,
    Unlock = 2,
    State = 3,
    Admin = 4,
}

// These values are part of the wire format and shall never be changed.
#[repr(u8)]
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, IntoPrimitive, TryFromPrimitive,
)]
pub enum ResultCode {
    Succeed = 0,
    UnknownMagic = 1,
    UnknownVersion = 2,
    UnknownDb = 3,
    UnknownCommand = 4,
    LockedError = 5,
    UnlockError = 6,
    UnownError = 7,
    Timeout = 8,
    Expried = 9,
    Error = 10,
}

impl ResultCode {
    /// The short message the text protocol pairs with each code.
    pub fn message(self) -> &'static str {
        match self {
            ResultCode::Succeed => "OK",
            ResultCode::UnknownMagic => "UNKNOWN_MAGIC",
            ResultCode::UnknownVersion => "UNKNOWN_VERSION",
            ResultCode::UnknownDb => "UNKNOWN_DB",
            ResultCode::UnknownCommand => "UNKNOWN_COMMAND",
            ResultCode::LockedError => "LOCKED_ERROR",
            ResultCode::UnlockError => "UNLOCK_ERROR",
            ResultCode::UnownError => "UNOWN_ERROR",
            ResultCode::Timeout => "TIMEOUT",
            ResultCode::Expried => "EXPRIED",
            ResultCode::Error => "UNKNOWN_ERROR",
        }
    }
}
