// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

pub mod bitfield;
pub mod conf;
pub mod error;
pub mod peer;

use bitvec::prelude::{BitVec, Msb0};

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, so we use
/// `u32` in the source code too, rather than `usize`, to make the inevitable
/// bounds checks against `numpieces` (also a wire-sized quantity) exact.
pub type PieceIndex = u32;

/// Each torrent gets a randomly assigned ID that is unique within the
/// application. This lets a single `Parent`/swarm collaborator multiplex
/// connections belonging to several torrents.
pub type TorrentId = u32;

/// The peer ID is an arbitrary 20 byte string.
///
/// Guidelines for choosing a peer ID: http://bittorrent.org/beps/bep_0020.html.
pub type PeerId = [u8; 20];

/// A SHA-1 hash digest, 20 bytes long.
///
/// Used both as a torrent's info hash and as the various MSE key-derivation
/// outputs (`req1`/`req2`/`req3`/`keyA`/`keyB`), which are all SHA-1 digests.
pub type Sha1Hash = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector from most significant bit to least
/// significant bit, that is, where the first highest bit represents the
/// first piece, the second highest bit the second piece, and so on (e.g.
/// `0b1100_0001` would mean that peer has pieces 0, 1, and 7). A truthy
/// boolean value of a piece's position in this vector means that the peer
/// has the piece, while a falsy value means it doesn't have the piece.
pub type Bitfield = BitVec<Msb0, u8>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_and_sha1_hash_are_20_bytes() {
        let peer_id: PeerId = [0; 20];
        let hash: Sha1Hash = [0; 20];
        assert_eq!(peer_id.len(), 20);
        assert_eq!(hash.len(), 20);
    }
}
