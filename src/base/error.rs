use std::io;

#[derive(Debug, Display, Error, From)]
pub enum WardenError {
    #[display("i/o error: {}", _0)]
    Io(io::Error),

    #[display("failed to encode: {}", _0)]
    Bincode(bincode::Error),

    #[from(skip)]
    #[display("unknown magic byte: {:#04x}", _0)]
    UnknownMagic(#[error(not(source))] u8),

    #[from(skip)]
    #[display("unknown protocol version: {:#04x}", _0)]
    UnknownVersion(#[error(not(source))] u8),

    #[from(skip)]
    #[display("unknown command kind: {:#04x}", _0)]
    UnknownCommand(#[error(not(source))] u8),

    #[display("connection closed")]
    ConnectionClosed,

    #[display("{}", _0)]
    Other(#[error(not(source))] &'static str),
}

pub type WardenResult<T> = Result<T, WardenError>;
