//! The crate's error taxonomy (see the error handling design in the
//! connection engine's design doc).
//!
//! Protocol violations are represented here so that the code that detects
//! them can log a precise reason, but per policy they never escape past the
//! point of detection: the session layer converts every variant below into
//! a connection close and keeps going, rather than bubbling it up as a
//! fatal error to whoever owns the [`crate::peer::session::PeerConnection`].
//! Only genuine transport/local-resource failures are returned from the
//! public `run` entry point.

use std::io;

use thiserror::Error;

/// The crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Top-level error type, covering everything that isn't specific to one
/// phase of the handshake.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    #[error(transparent)]
    Mse(#[from] MseError),

    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("bitfield length does not match piece count")]
    InvalidBitfieldLength,

    #[error("piece index {index} is out of bounds (numpieces = {numpieces})")]
    InvalidPieceIndex { index: u32, numpieces: u32 },
}

/// Errors arising during the plaintext BitTorrent handshake (§4.3).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("protocol string did not match \"BitTorrent protocol\"")]
    InvalidProtocolString,

    #[error("info hash did not match the expected torrent")]
    InvalidInfoHash,

    #[error("no torrent selected for the given info hash")]
    TorrentNotFound,

    #[error("peer id did not match the expected value")]
    PeerIdMismatch,

    #[error("peer id equals our own (self-connection)")]
    SelfConnection,

    #[error("another connection already uses this peer id")]
    DuplicatePeerId,

    #[error("another connection already uses this IP")]
    DuplicateIp,

    #[error("connection closed before the handshake completed")]
    ConnectionClosed,
}

/// Errors arising during the obfuscated MSE handshake (§4.2).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MseError {
    #[error("verification constant not found within the scan window")]
    VcNotFound,

    #[error("no torrent matched the obfuscated stream identifier")]
    TorrentNotFound,

    #[error("peer selected an unsupported crypto method (expected mode 2)")]
    UnsupportedCryptoMethod,

    #[error("peer did not offer to provide crypto mode 2")]
    CryptoModeNotProvided,

    #[error("padding length {0} exceeds the 512 byte ceiling")]
    PadTooLong(u16),
}

/// Errors arising while decoding or validating a post-handshake message
/// (§4.1, §4.5).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("message length {length} exceeds max_message_length ({max})")]
    TooLong { length: u32, max: u32 },

    #[error("message of type {0:?} had the wrong fixed length")]
    WrongLength(u8),

    #[error("unknown message type byte {0}")]
    UnknownType(u8),

    #[error("piece index {index} is out of bounds (numpieces = {numpieces})")]
    InvalidPieceIndex { index: u32, numpieces: u32 },

    #[error("BITFIELD/HAVE_ALL/HAVE_NONE arrived after another message")]
    BitfieldNotFirst,

    #[error("FAST extension message received but FAST was not negotiated")]
    FastExtensionNotNegotiated,
}
