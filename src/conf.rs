//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

/// The default cratetorrent client id.
pub const CRATETORRENT_CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub engine: EngineConf,
    pub torrent: TorrentConf,
    pub peer: PeerConf,
}

impl Conf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user. It uses the default cratetorrent client id,
    /// [`CRATETORRENT_CLIENT_ID`].
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine: EngineConf {
                client_id: *CRATETORRENT_CLIENT_ID,
            },
            torrent: TorrentConf::new(download_dir),
            peer: PeerConf::default(),
        }
    }
}

/// Configuration for a single peer connection.
///
/// This is the Rust equivalent of the original implementation's
/// `parent.config` dict plus its `disable_fast_extension` module-level
/// global: everything the handshake and steady-state framing need to know
/// is threaded through explicitly rather than read off shared mutable
/// state.
#[derive(Clone, Copy, Debug)]
pub struct PeerConf {
    /// Frames whose declared length exceeds this are a protocol violation
    /// and close the connection (§4.1).
    pub max_message_length: u32,

    /// If set, no two complete connections may share the same remote IP.
    pub one_connection_per_ip: bool,

    /// If set, the FAST extension bit is masked off both when advertising
    /// our own reserved flags and when interpreting the peer's, so
    /// `uses_fast_extension` can never become true.
    pub disable_fast_extension: bool,

    /// Whether new locally-initiated connections start with the obfuscated
    /// MSE handshake (§4.2) rather than the plaintext one (§4.3).
    pub obfuscate_outgoing: bool,

    /// Whether an inbound connection whose first 20 bytes don't look like
    /// the plaintext prologue should fall back to MSE (true) or simply be
    /// rejected (false).
    pub allow_incoming_obfuscated: bool,
}

impl Default for PeerConf {
    fn default() -> Self {
        Self {
            // 256 KiB is generously above the largest legitimate PIECE
            // message (16 KiB block + 9 byte header) while still bounding
            // a misbehaving or malicious peer's ability to make us buffer
            // unbounded amounts of memory.
            max_message_length: 1 << 18,
            one_connection_per_ip: true,
            disable_fast_extension: false,
            obfuscate_outgoing: false,
            allow_incoming_obfuscated: true,
        }
    }
}

/// Configuration related to the engine itself.
#[derive(Clone, Debug)]
pub struct EngineConf {
    /// The ID of the client to announce to trackers and other peers.
    pub client_id: PeerId,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents by
/// default, but individual torrents may override this configuration.
#[derive(Clone, Debug)]
pub struct TorrentConf {
    /// The directory in which a torrent's files are placed upon download and
    /// from which they are seeded.
    pub download_dir: PathBuf,

    /// The minimum number of peers we want to keep in torrent at all times.
    /// This will be configurable later.
    pub min_requested_peer_count: usize,

    /// The max number of connected peers the torrent should have.
    pub max_connected_peer_count: usize,

    /// If the tracker doesn't provide a minimum announce interval, we default
    /// to announcing every 30 seconds.
    pub announce_interval: Duration,

    /// After this many attempts, the torrent stops announcing to a tracker.
    pub tracker_error_threshold: usize,
}

impl TorrentConf {
    /// Returns the torrent configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            // We always request at least 10 peers as anything less is a waste
            // of network round trip and it allows us to buffer up a bit more
            // than needed.
            min_requested_peer_count: 10,
            // This value is mostly picked for performance while keeping in mind
            // not to overwhelm the host.
            max_connected_peer_count: 50,
            // needs teting
            announce_interval: Duration::from_secs(60 * 60),
            // needs testing
            tracker_error_threshold: 15,
        }
    }
}
