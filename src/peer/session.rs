//! `PeerConnection` (spec §3): wires the handshake ([`super::handshake`]),
//! the steady-state framed message loop ([`super::codec`],
//! [`super::dispatch`]), the outgoing scheduler ([`super::sender`]), and
//! the connection lifecycle (§4.8) into the single entity a `Parent`/swarm
//! controller drives.
//!
//! Grounded on the teacher's `peer.rs` `PeerSession::start`/`run`
//! (handshake-then-switch-codec structure, `select!` over the message
//! stream and a command channel standing in for the rate limiter and other
//! external drivers) and the original `Connector.py`'s
//! `connection_lost`/`connection_flushed` lifecycle hooks.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::{
    conf::PeerConf,
    error::{Error, HandshakeError},
    peer::{
        codec::{Message, MessageCodec},
        collaborators::{ConnectionId, DownloadPolicy, Encryptor, TorrentHandle, UploadPolicy},
        dispatch::{self, DispatchState},
        handshake::{self, HandshakeOutcome},
        sender::Sender,
    },
    Bitfield, PeerId, Sha1Hash,
};

/// A command sent to a running [`PeerConnection`] from outside the
/// connection engine: the `Parent`'s rate limiter calling `send_partial`,
/// the `Upload`/`Download` policy objects deciding to emit a control
/// message, or the swarm controller requesting a clean shutdown.
///
/// This is the Rust equivalent of the original's direct method calls onto
/// a live `PeerConnection` object (`conn.send_choke()`, `conn.close()`,
/// ...): since the connection owns its socket inside an async task here
/// rather than being called back into from a single-threaded reactor, the
/// external operations are instead messages delivered over a channel and
/// applied at the top of the task's event loop, which preserves the same
/// "one thread, no locks" ordering guarantee (§5).
pub enum Command {
    SendChoke,
    SendUnchoke,
    SendInterested,
    SendNotInterested,
    SendHave(u32),
    SendBitfield(Bitfield),
    SendRequest { index: u32, begin: u32, length: u32 },
    SendCancel { index: u32, begin: u32, length: u32 },
    SendPort(u16),
    SendHaveAll,
    SendHaveNone,
    SendRejectRequest { index: u32, begin: u32, length: u32 },
    SendAllowedFast(u32),
    SendKeepalive,
    /// `send_partial(n)` (§4.7): the reply carries back the number of
    /// bytes actually written, exactly as the original returns it.
    SendPartial(usize, oneshot::Sender<usize>),
    Close,
}

/// The handle a `Parent` keeps to drive a running connection.
pub type CommandSender = mpsc::UnboundedSender<Command>;
pub type CommandReceiver = mpsc::UnboundedReceiver<Command>;

/// Creates the channel pair used to drive one connection: the returned
/// [`CommandSender`] is kept by the swarm controller (alongside its
/// `ConnectionId`); the receiver is handed to [`run_outgoing`] or
/// [`run_incoming`].
pub fn command_channel() -> (CommandSender, CommandReceiver) {
    mpsc::unbounded_channel()
}

/// Wraps a [`MessageCodec`] to transparently decrypt incoming bytes with
/// an [`Encryptor`] (DESIGN NOTES: "Dynamic per-connection `encrypt`
/// hook"), without `MessageCodec` itself knowing about MSE.
///
/// `tokio_util`'s `Framed` calls `decode` repeatedly on the same
/// accumulating `BytesMut` as more bytes arrive, re-presenting bytes this
/// type has already decrypted on a prior call (minus whatever a completed
/// frame consumed via `advance`/`split_to`). `decrypted_len` tracks how
/// many bytes at the front of the buffer have already had the keystream
/// applied, so each newly-arrived span is decrypted exactly once.
struct ObfuscatedCodec {
    inner: MessageCodec,
    decrypt: Encryptor,
    decrypted_len: usize,
}

impl Decoder for ObfuscatedCodec {
    type Item = Message;
    type Error = <MessageCodec as Decoder>::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, Self::Error> {
        if src.len() > self.decrypted_len {
            let start = self.decrypted_len;
            self.decrypt.apply(&mut src[start..]);
            self.decrypted_len = src.len();
        }
        let before = src.len();
        let result = self.inner.decode(src)?;
        let consumed = before - src.len();
        self.decrypted_len = self.decrypted_len.saturating_sub(consumed);
        Ok(result)
    }
}

// `Framed` requires the codec to implement `Encoder` too, even though
// `PeerConnection` never calls `.send()` on the `Framed` sink (outgoing
// bytes go through `Sender`, which does its own encrypting, directly over
// the raw stream via `Framed::get_mut`). This impl exists only to satisfy
// that bound and is never exercised.
impl Encoder<Message> for ObfuscatedCodec {
    type Error = std::io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.inner.encode(item, dst)
    }
}

/// Wraps a transport so that [`run_outgoing`] can tell, after a failed
/// handshake, whether *any* byte was ever read from the peer (§4.8, §8
/// scenario 6: the reconnect-with-obfuscation fallback fires only when
/// zero bytes were received before the connection was lost).
struct ReceivedDataReader<S> {
    inner: S,
    received: bool,
}

impl<S: Unpin> ReceivedDataReader<S> {
    fn new(inner: S) -> Self {
        Self { inner, received: false }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for ReceivedDataReader<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let res = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(res, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.received = true;
        }
        res
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for ReceivedDataReader<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// A peer connection whose handshake has completed (§3: the moment
/// `complete` becomes true).
///
/// There is deliberately no pre-handshake variant of this type with
/// `upload`/`download` left empty: the spec's "`upload`, `download` ...
/// nil before handshake completes, non-nil after" is modeled as a
/// typestate rather than as two `Option` fields that are only ever valid
/// in lockstep. The pre-handshake phase is driven entirely by
/// [`run_outgoing`] and [`run_incoming`], which construct a
/// `PeerConnection` only once the handshake (and, for inbound
/// connections, duplicate-peer rejection) has succeeded.
pub struct PeerConnection {
    parent: Arc<dyn TorrentHandle>,
    conn_id: ConnectionId,
    ip: String,
    locally_initiated: bool,
    peer_id: PeerId,
    closed: bool,
    /// Set the moment any byte arrives from the transport. By
    /// construction this is already `true` once a `PeerConnection` exists,
    /// since the handshake itself required reading from the peer; kept as
    /// a field to mirror the data model (§3) and because a future
    /// incremental-read frame layer may want to flip it independently of
    /// construction.
    received_data: bool,
    uses_dht: bool,
    uses_cache_extension: bool,
    uses_fast_extension: bool,
    dht_port: Option<u16>,
    /// Bytes received before `download` existed. Always `0` under this
    /// typestate, since `download` is supplied at construction time — see
    /// the Open Question decision in DESIGN.md. Kept, unused beyond this
    /// comment, as the spec explicitly treats it as best-effort
    /// accounting rather than correctness-critical.
    #[allow(dead_code)]
    sloppy_pre_connection_counter: usize,
    dispatch_state: DispatchState,
    sender: Sender,
    upload: Box<dyn UploadPolicy>,
    download: Box<dyn DownloadPolicy>,
}

impl PeerConnection {
    fn new(
        parent: Arc<dyn TorrentHandle>,
        conn_id: ConnectionId,
        ip: String,
        locally_initiated: bool,
        outcome: HandshakeOutcome,
        upload: Box<dyn UploadPolicy>,
        download: Box<dyn DownloadPolicy>,
    ) -> (Self, Encryptor) {
        let conn = Self {
            parent,
            conn_id,
            ip,
            locally_initiated,
            peer_id: outcome.peer_id,
            closed: false,
            received_data: true,
            uses_dht: outcome.uses_dht,
            uses_cache_extension: outcome.uses_cache_extension,
            uses_fast_extension: outcome.uses_fast_extension,
            dht_port: None,
            sloppy_pre_connection_counter: 0,
            dispatch_state: DispatchState::new(),
            sender: Sender::new(outcome.uses_fast_extension, outcome.encryptor),
            upload,
            download,
        };
        (conn, outcome.decryptor)
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn ip(&self) -> &str {
        &self.ip
    }

    pub fn uses_dht(&self) -> bool {
        self.uses_dht
    }

    pub fn uses_cache_extension(&self) -> bool {
        self.uses_cache_extension
    }

    pub fn uses_fast_extension(&self) -> bool {
        self.uses_fast_extension
    }

    pub fn dht_port(&self) -> Option<u16> {
        self.dht_port
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// `close()` (§4.8): idempotent, one-way. The actual socket teardown
    /// happens when the steady-state loop observes `closed` and returns;
    /// this only flips the flags that make every subsequent `send_*` and
    /// incoming-frame dispatch a no-op.
    fn close(&mut self) {
        if self.closed {
            return;
        }
        log::info!("Closing connection to peer {}", self.ip);
        self.closed = true;
        self.sender.close();
    }

    fn handle_incoming(&mut self, msg: Message, numpieces: u32) -> Result<(), Error> {
        let conn_id = self.conn_id;
        log::trace!("Peer {} got message {:?}", self.ip, msg);
        let mut observed_port = None;
        dispatch::dispatch(
            &mut self.dispatch_state,
            msg,
            numpieces,
            self.uses_fast_extension,
            self.upload.as_mut(),
            self.download.as_mut(),
            |port| observed_port = Some(port),
        )
        .map_err(|e| {
            log::warn!("Peer {} sent invalid message, closing: {}", self.ip, e);
            e
        })?;
        if let Some(port) = observed_port {
            self.dht_port = Some(port);
            self.parent.got_port(conn_id, port);
        }
        Ok(())
    }

    async fn handle_command<W: AsyncWrite + Unpin>(
        &mut self,
        cmd: Command,
        writer: &mut W,
    ) -> Result<(), Error> {
        if self.closed {
            if let Command::SendPartial(_, reply) = cmd {
                let _ = reply.send(0);
            }
            return Ok(());
        }
        match cmd {
            Command::SendChoke => self.sender.send_choke(writer, self.upload.as_mut()).await?,
            Command::SendUnchoke => self.sender.send_unchoke(writer).await?,
            Command::SendInterested => self.sender.send_interested(writer).await?,
            Command::SendNotInterested => self.sender.send_not_interested(writer).await?,
            Command::SendHave(index) => self.sender.send_have(writer, index).await?,
            Command::SendBitfield(bitfield) => self.sender.send_bitfield(writer, &bitfield).await?,
            Command::SendRequest { index, begin, length } => {
                self.sender.send_request(writer, index, begin, length).await?
            }
            Command::SendCancel { index, begin, length } => {
                self.sender.send_cancel(writer, index, begin, length).await?
            }
            Command::SendPort(port) => self.sender.send_port(writer, port).await?,
            Command::SendHaveAll => self.sender.send_have_all(writer).await?,
            Command::SendHaveNone => self.sender.send_have_none(writer).await?,
            Command::SendRejectRequest { index, begin, length } => {
                self.sender.send_reject_request(writer, index, begin, length).await?
            }
            Command::SendAllowedFast(index) => self.sender.send_allowed_fast(writer, index).await?,
            Command::SendKeepalive => self.sender.send_keepalive(writer).await?,
            Command::SendPartial(n, reply) => {
                let sent = self.sender.send_partial(writer, n, self.upload.as_mut()).await?;
                let _ = reply.send(sent);
            }
            Command::Close => {
                self.close();
                return Ok(());
            }
        }

        // connection_flushed (§4.8): whenever a send leaves more data
        // ready to go out (a partial frame still draining, or more of
        // `upload.buffer` to turn into partial frames), tell the rate
        // limiter to keep scheduling us; otherwise let it drop us from its
        // queue. Both calls are assumed idempotent at the collaborator
        // boundary, matching a rate limiter that already dedupes queue
        // membership.
        if self.sender.has_pending_partial() || !self.upload.buffer_is_empty() {
            self.parent.ratelimiter_queue(self.conn_id);
        } else {
            self.parent.ratelimiter_dequeue(self.conn_id);
        }
        Ok(())
    }

    /// Connection teardown (§4.8 `connection_lost`): called once, when the
    /// steady-state loop exits for any reason.
    fn teardown(&mut self) {
        self.close();
        log::info!("Connection to peer {} lost", self.ip);
        self.parent.choker_connection_lost(self.conn_id);
        self.parent.ratelimiter_dequeue(self.conn_id);
        self.download.disconnected();
        self.parent.replace_connection();
    }

    async fn run_steady_state<S>(
        mut self,
        stream: S,
        decrypt: Encryptor,
        mut cmd_rx: CommandReceiver,
    ) -> Result<(), Error>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let max_message_length = self.parent.peer_conf().max_message_length;
        let codec = ObfuscatedCodec {
            inner: MessageCodec { max_message_length },
            decrypt,
            decrypted_len: 0,
        };
        let mut framed = Framed::new(stream, codec);

        loop {
            tokio::select! {
                frame = framed.next() => {
                    match frame {
                        Some(Ok(msg)) => {
                            self.received_data = true;
                            let numpieces = self.parent.numpieces().unwrap_or(0);
                            if self.handle_incoming(msg, numpieces).is_err() {
                                // any violation in the §4.5 table closes the
                                // connection silently; no collaborator
                                // method was called for the offending frame.
                                self.close();
                            }
                        }
                        Some(Err(_)) => self.close(),
                        None => self.close(),
                    }
                }
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            self.handle_command(cmd, framed.get_mut()).await?;
                        }
                        None => self.close(),
                    }
                }
            }

            if self.closed {
                break;
            }
        }

        self.teardown();
        Ok(())
    }
}

/// Drives a locally-initiated connection from a freshly-connected
/// transport through the handshake (plaintext or obfuscated, per
/// `conf.obfuscate_outgoing`) and into the steady-state message loop.
///
/// On handshake failure, implements the reconnect-with-obfuscation
/// fallback (§4.8, §8 scenario 6): if not a single byte was ever read
/// from the peer, calls `parent.start_connection` once, requesting
/// obfuscation on the retry.
pub async fn run_outgoing<S>(
    parent: Arc<dyn TorrentHandle>,
    stream: S,
    addr: SocketAddr,
    info_hash: Sha1Hash,
    expected_peer_id: Option<PeerId>,
    conf: PeerConf,
    cmd_rx: CommandReceiver,
    make_policies: impl FnOnce(PeerId) -> (Box<dyn UploadPolicy>, Box<dyn DownloadPolicy>),
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn_id: ConnectionId = addr;
    let mut tracked = ReceivedDataReader::new(stream);

    log::info!("Connecting to peer {}", addr);
    let outcome = match handshake::perform_outgoing(
        &mut tracked,
        &conf,
        info_hash,
        parent.my_id(),
        expected_peer_id,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(err) => {
            if !tracked.received {
                log::info!(
                    "Peer {} never sent data, retrying with obfuscation",
                    addr
                );
                parent.start_connection(addr, None, true);
            } else {
                log::warn!("Handshake with peer {} failed: {}", addr, err);
            }
            return Err(err);
        }
    };
    log::info!("Handshake with peer {} complete", addr);

    let ip = addr.ip().to_string();
    let (upload, download) = make_policies(outcome.peer_id);
    let (conn, decrypt) = PeerConnection::new(
        Arc::clone(&parent),
        conn_id,
        ip,
        true,
        outcome,
        upload,
        download,
    );
    parent.connection_completed(conn_id);
    conn.run_steady_state(tracked.inner, decrypt, cmd_rx).await
}

/// Drives a newly-accepted connection through the incoming handshake
/// (plaintext, or the obfuscated responder sequence when the first byte
/// doesn't look like the plaintext prologue) and into the steady-state
/// message loop.
pub async fn run_incoming<S>(
    parent: Arc<dyn TorrentHandle>,
    mut stream: S,
    addr: SocketAddr,
    conf: PeerConf,
    cmd_rx: CommandReceiver,
    make_policies: impl FnOnce(PeerId) -> (Box<dyn UploadPolicy>, Box<dyn DownloadPolicy>),
) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn_id: ConnectionId = addr;
    let my_id = parent.my_id();
    let parent_plain = Arc::clone(&parent);
    let parent_obfuscated = Arc::clone(&parent);

    log::info!("Accepted connection from {}", addr);
    let outcome = handshake::perform_incoming(
        &mut stream,
        &conf,
        move |hash| parent_plain.select_torrent(conn_id, hash),
        move |req2_xor_req3| parent_obfuscated.select_torrent_obfuscated(conn_id, req2_xor_req3),
        my_id,
    )
    .await
    .map_err(|e| {
        log::warn!("Handshake from {} failed: {}", addr, e);
        e
    })?;
    log::info!("Handshake with peer {} complete", addr);

    let ip = addr.ip().to_string();
    if parent.is_duplicate_peer(conn_id, &outcome.peer_id, &ip) {
        // covers both the duplicate-peer-id and (when configured)
        // duplicate-IP rejection of §4.3 step 6.
        log::warn!("Rejecting duplicate peer {} ({})", addr, ip);
        return Err(HandshakeError::DuplicatePeerId.into());
    }

    let (upload, download) = make_policies(outcome.peer_id);
    let (conn, decrypt) = PeerConnection::new(
        Arc::clone(&parent),
        conn_id,
        ip,
        false,
        outcome,
        upload,
        download,
    );
    parent.connection_completed(conn_id);
    conn.run_steady_state(stream, decrypt, cmd_rx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::collaborators::BufferedPiece;
    use std::sync::Mutex;
    use tokio::io::duplex;

    struct NullUpload;
    impl UploadPolicy for NullUpload {
        fn got_request(&mut self, _i: u32, _b: u32, _l: u32) {}
        fn got_cancel(&mut self, _i: u32, _b: u32, _l: u32) {}
        fn got_interested(&mut self) {}
        fn got_not_interested(&mut self) {}
        fn sent_choke(&mut self) {}
        fn update_rate(&mut self, _n: usize) {}
        fn choked(&self) -> bool {
            false
        }
        fn buffer_is_empty(&self) -> bool {
            true
        }
        fn pop_buffer_front(&mut self) -> Option<BufferedPiece> {
            None
        }
    }

    #[derive(Default)]
    struct RecordingDownload {
        haves: Vec<u32>,
        disconnected: bool,
    }
    impl DownloadPolicy for RecordingDownload {
        fn got_choke(&mut self) {}
        fn got_unchoke(&mut self) {}
        fn got_have(&mut self, index: u32) {
            self.haves.push(index);
        }
        fn got_have_bitfield(&mut self, _b: Bitfield) {}
        fn got_piece(&mut self, _i: u32, _b: u32, _d: Vec<u8>) {}
        fn got_suggest_piece(&mut self, _i: u32) {}
        fn got_have_all(&mut self) {}
        fn got_have_none(&mut self) {}
        fn got_reject_request(&mut self, _i: u32, _b: u32, _l: u32) {}
        fn got_allowed_fast(&mut self, _i: u32) {}
        fn disconnected(&mut self) {
            self.disconnected = true;
        }
    }

    /// A `TorrentHandle` double that records `start_connection` calls so
    /// the reconnect-on-empty-data fallback (§8 scenario 6) can be
    /// asserted on.
    struct FakeParent {
        my_id: PeerId,
        numpieces: Option<u32>,
        reconnects: Mutex<Vec<(SocketAddr, bool)>>,
    }

    impl TorrentHandle for FakeParent {
        fn my_id(&self) -> PeerId {
            self.my_id
        }
        fn numpieces(&self) -> Option<u32> {
            self.numpieces
        }
        fn peer_conf(&self) -> PeerConf {
            PeerConf::default()
        }
        fn select_torrent(&self, _conn: ConnectionId, info_hash: Sha1Hash) -> Option<Sha1Hash> {
            Some(info_hash)
        }
        fn select_torrent_obfuscated(
            &self,
            _conn: ConnectionId,
            _req2_xor_req3: Sha1Hash,
        ) -> Option<Sha1Hash> {
            None
        }
        fn is_duplicate_peer(&self, _conn: ConnectionId, _peer_id: &PeerId, _ip: &str) -> bool {
            false
        }
        fn connection_completed(&self, _conn: ConnectionId) {}
        fn got_port(&self, _conn: ConnectionId, _port: u16) {}
        fn replace_connection(&self) {}
        fn start_connection(&self, addr: SocketAddr, _id: Option<PeerId>, encrypt: bool) {
            self.reconnects.lock().unwrap().push((addr, encrypt));
        }
        fn choker_connection_lost(&self, _conn: ConnectionId) {}
        fn ratelimiter_queue(&self, _conn: ConnectionId) {}
        fn ratelimiter_dequeue(&self, _conn: ConnectionId) {}
    }

    #[tokio::test]
    async fn failed_outgoing_handshake_with_no_bytes_triggers_reconnect() {
        // `a` is dropped immediately, so `b` (the side under test) reads
        // EOF without ever having received a byte.
        let (a, b) = duplex(64);
        drop(a);

        let parent = Arc::new(FakeParent {
            my_id: [1u8; 20],
            numpieces: Some(10),
            reconnects: Mutex::new(Vec::new()),
        });
        let addr: SocketAddr = "127.0.0.1:6881".parse().unwrap();
        let (_tx, rx) = command_channel();

        let result = run_outgoing(
            Arc::clone(&parent) as Arc<dyn TorrentHandle>,
            b,
            addr,
            [2u8; 20],
            None,
            PeerConf::default(),
            rx,
            |_peer_id| (Box::new(NullUpload), Box::new(RecordingDownload::default())),
        )
        .await;

        assert!(result.is_err());
        let reconnects = parent.reconnects.lock().unwrap();
        assert_eq!(reconnects.as_slice(), &[(addr, true)]);
    }

    #[tokio::test]
    async fn plaintext_handshake_then_have_dispatches_and_completes() {
        let (mut a, b) = duplex(4096);
        let info_hash = [7u8; 20];
        let my_id_a = [3u8; 20];
        let my_id_b = [4u8; 20];

        let parent = Arc::new(FakeParent {
            my_id: my_id_b,
            numpieces: Some(10),
            reconnects: Mutex::new(Vec::new()),
        });
        let addr: SocketAddr = "127.0.0.1:6882".parse().unwrap();
        let (tx, rx) = command_channel();

        let conf = PeerConf::default();
        let server = tokio::spawn(run_incoming(
            Arc::clone(&parent) as Arc<dyn TorrentHandle>,
            b,
            addr,
            conf,
            rx,
            |_peer_id| (Box::new(NullUpload), Box::new(RecordingDownload::default())),
        ));

        // act as the locally-initiated side by hand, so we can keep
        // driving bytes after the handshake completes.
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut prologue = Vec::new();
        prologue.push(19u8);
        prologue.extend_from_slice(b"BitTorrent protocol");
        prologue.extend_from_slice(&[0u8; 8]);
        prologue.extend_from_slice(&info_hash);
        prologue.extend_from_slice(&my_id_a);
        a.write_all(&prologue).await.unwrap();

        let mut reply = [0u8; 68];
        a.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply[1..20], b"BitTorrent protocol");
        assert_eq!(&reply[48..68], &my_id_b);

        // now send a HAVE frame and ask the connection to close.
        a.write_all(&[0x00, 0x00, 0x00, 0x05, 0x04, 0x00, 0x00, 0x00, 0x02])
            .await
            .unwrap();
        tx.send(Command::Close).unwrap();
        drop(tx);

        let result = server.await.unwrap();
        assert!(result.is_ok());
    }
}
