//! The peer-wire connection engine: handshake (plaintext and MSE
//! obfuscated), message framing, post-handshake dispatch, outgoing
//! scheduling, and the connection lifecycle that ties them together.

pub mod codec;
pub mod collaborators;
pub mod crypto;
pub mod dispatch;
pub mod handshake;
pub mod sender;
pub mod session;

pub use codec::{Message, MessageCodec};
pub use collaborators::{
    BufferedPiece, ConnectionId, DownloadPolicy, Encryptor, TorrentHandle, UploadPolicy,
};
pub use handshake::HandshakeOutcome;
pub use sender::Sender;
pub use session::{command_channel, Command, CommandReceiver, CommandSender, PeerConnection};
