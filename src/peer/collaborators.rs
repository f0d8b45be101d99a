//! Narrow traits standing in for the out-of-scope `Parent`/swarm,
//! `Upload`, and `Download` collaborators (spec §6), plus the `Encryptor`
//! that replaces the original's dynamic per-connection `encrypt` hook on
//! the transport.
//!
//! None of these are implemented by this crate: the swarm controller and
//! the upload/download choke-state and request-queue policy objects live
//! in a different component. `peer::session::PeerConnection` is generic
//! over them so that component can plug in its own concrete types (or a
//! test double) without the connection engine knowing anything about
//! piece selection, rate limiting, or disk I/O.

use std::net::SocketAddr;

use rc4::StreamCipher;

use crate::{conf::PeerConf, peer::crypto::Rc4Cipher, Bitfield, PeerId, Sha1Hash};

/// Identifies a connection to its `Parent` without the parent owning a
/// strong reference back to it (DESIGN NOTES: "non-owning handle"). The
/// remote socket address is already a natural, stable identifier for the
/// lifetime of one TCP connection.
pub type ConnectionId = SocketAddr;

/// The swarm controller's narrow interface (§6: `parent.*`).
///
/// Implementations own the full connection map, the local peer id, the
/// choker, and the rate limiter; this crate only ever calls the methods
/// below.
pub trait TorrentHandle: Send + Sync {
    /// Our own 20-byte peer id, sent in every handshake.
    fn my_id(&self) -> PeerId;

    /// The number of pieces in the torrent, used for index bound checks.
    /// `None` if not yet known (e.g. before `select_torrent` resolves an
    /// inbound connection).
    fn numpieces(&self) -> Option<u32>;

    /// Per-peer configuration (`max_message_length`,
    /// `one_connection_per_ip`, ...).
    fn peer_conf(&self) -> PeerConf;

    /// Resolves an inbound connection's advertised info hash to a torrent,
    /// returning `None` to reject the connection.
    fn select_torrent(&self, conn: ConnectionId, info_hash: Sha1Hash) -> Option<Sha1Hash>;

    /// Resolves an inbound obfuscated connection's `req2 XOR req3`
    /// identifier to a torrent, returning `None` to reject the connection.
    fn select_torrent_obfuscated(
        &self,
        conn: ConnectionId,
        req2_xor_req3: Sha1Hash,
    ) -> Option<Sha1Hash>;

    /// Whether another connection in the swarm already uses `peer_id`, or
    /// (when `one_connection_per_ip` is configured) already uses `ip`.
    /// Consults whatever is in the connection map *right now*, including
    /// connections that haven't completed their own handshake yet.
    fn is_duplicate_peer(&self, conn: ConnectionId, peer_id: &PeerId, ip: &str) -> bool;

    /// Called exactly once, when a connection's handshake completes.
    fn connection_completed(&self, conn: ConnectionId);

    /// Called when a PORT message is received.
    fn got_port(&self, conn: ConnectionId, port: u16);

    /// Called on connection teardown, to let the swarm consider opening a
    /// replacement connection.
    fn replace_connection(&self);

    /// Starts a new outbound connection to `addr`, optionally forcing the
    /// obfuscated handshake. Used for the single-shot reconnect-with-
    /// obfuscation fallback (§4.8, §8 scenario 6).
    fn start_connection(&self, addr: SocketAddr, id: Option<PeerId>, encrypt: bool);

    /// `parent.choker.connection_lost(self)`.
    fn choker_connection_lost(&self, conn: ConnectionId);

    /// `parent.ratelimiter.queue(self)`.
    fn ratelimiter_queue(&self, conn: ConnectionId);

    /// `parent.ratelimiter.dequeue(self)`.
    fn ratelimiter_dequeue(&self, conn: ConnectionId);
}

/// One entry of `Upload.buffer`: a pending outgoing piece and the request
/// it answers.
#[derive(Debug, Clone)]
pub struct BufferedPiece {
    pub index: u32,
    pub begin: u32,
    pub data: Vec<u8>,
}

/// The `Upload` policy object's narrow interface (§6).
pub trait UploadPolicy: Send {
    fn got_request(&mut self, index: u32, begin: u32, length: u32);
    fn got_cancel(&mut self, index: u32, begin: u32, length: u32);
    fn got_interested(&mut self);
    fn got_not_interested(&mut self);
    /// Called whenever a CHOKE frame is actually written to the peer
    /// (either immediately, or at `send_partial` drain time).
    fn sent_choke(&mut self);
    /// Accounts `byte_count` outgoing bytes for rate-limiting purposes.
    fn update_rate(&mut self, byte_count: usize);

    /// Whether we currently have the peer choked.
    fn choked(&self) -> bool;

    /// Whether `buffer` is currently empty.
    fn buffer_is_empty(&self) -> bool;
    /// Pops the next pending piece off the front of `buffer`.
    fn pop_buffer_front(&mut self) -> Option<BufferedPiece>;
}

/// The `Download` policy object's narrow interface (§6).
pub trait DownloadPolicy: Send {
    fn got_choke(&mut self);
    fn got_unchoke(&mut self);
    fn got_have(&mut self, index: u32);
    fn got_have_bitfield(&mut self, bitfield: Bitfield);
    fn got_piece(&mut self, index: u32, begin: u32, data: Vec<u8>);
    fn got_suggest_piece(&mut self, index: u32);
    fn got_have_all(&mut self);
    fn got_have_none(&mut self);
    fn got_reject_request(&mut self, index: u32, begin: u32, length: u32);
    fn got_allowed_fast(&mut self, index: u32);
    fn disconnected(&mut self);
}

/// Replaces the original implementation's dynamic `connection.encrypt`
/// hook (DESIGN NOTES): a typed slot that either passes bytes through
/// unchanged or applies an ARC4 keystream in place.
pub enum Encryptor {
    Plain,
    Arc4(Box<Rc4Cipher>),
}

impl Encryptor {
    /// Applies this encryptor to `buf` in place. For [`Encryptor::Plain`]
    /// this is a no-op; for [`Encryptor::Arc4`] it XORs in the next
    /// `buf.len()` keystream bytes.
    pub fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Encryptor::Plain => {}
            Encryptor::Arc4(cipher) => cipher.apply_keystream(buf),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Encryptor::Arc4(_))
    }
}
