//! Outgoing message construction and the `send_partial(n)` scheduler
//! (spec §4.6, §4.7).
//!
//! `Sender` owns exactly the wire-facing state `PeerConnection` doesn't:
//! `partial_message` and `outqueue` (§3). It is generic over the writer
//! half of the connection so it can be driven against a real socket in
//! `session.rs` or an in-memory buffer in tests.

use std::collections::VecDeque;
use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::codec::Encoder;

use crate::peer::{
    codec::{Message, MessageCodec},
    collaborators::{Encryptor, UploadPolicy},
};

/// The sending half of a [`super::session::PeerConnection`].
pub struct Sender {
    closed: bool,
    uses_fast_extension: bool,
    /// Last choke bit actually written to the peer; compared against
    /// `upload.choked()` at every `send_partial` drain (§4.7 step 5).
    choke_sent: bool,
    partial_message: BytesMut,
    outqueue: VecDeque<BytesMut>,
    /// Applied to every frame's bytes exactly once, at the moment the frame
    /// is assembled (here, in [`Sender::encode`]) rather than at the moment
    /// it is actually written. Since ARC4 is a pure running XOR keystream,
    /// and every frame this type assembles is encoded in the exact relative
    /// order it will eventually reach the wire (`partial_message` bytes,
    /// then the drain-time choke/unchoke reconciliation, then `outqueue` in
    /// FIFO order), encrypting at assembly time consumes the keystream in
    /// the same order a naive "encrypt right before write" scheme would,
    /// without having to re-borrow `partial_message` mutably at drain time.
    encrypt: Encryptor,
}

impl Sender {
    pub fn new(uses_fast_extension: bool, encrypt: Encryptor) -> Self {
        Self {
            closed: false,
            uses_fast_extension,
            choke_sent: true,
            partial_message: BytesMut::new(),
            outqueue: VecDeque::new(),
            encrypt,
        }
    }

    fn encode(&mut self, msg: Message) -> BytesMut {
        let mut buf = BytesMut::new();
        // max_message_length only bounds decoding; encoding an outgoing
        // message we constructed ourselves can never exceed it in
        // practice, so Encoder::encode's Error type (io::Error) is never
        // actually hit.
        MessageCodec {
            max_message_length: u32::MAX,
        }
        .encode(msg, &mut buf)
        .expect("encoding a locally constructed message cannot fail");
        self.encrypt.apply(&mut buf);
        buf
    }

    /// Marks this sender closed; all subsequent `send_*` calls become
    /// no-ops (§4.8, §8 invariant: after `close()` no `send_*` writes).
    pub fn close(&mut self) {
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn has_pending_partial(&self) -> bool {
        !self.partial_message.is_empty()
    }

    async fn write_frame<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        msg: Message,
    ) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        log::trace!("Sending message {:?}", msg);
        let buf = self.encode(msg);
        writer.write_all(&buf).await
    }

    /// Queues `msg` as a control frame if a `partial_message` is in
    /// flight (so it never interleaves with piece payload bytes), else
    /// writes it immediately.
    async fn write_or_queue<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        msg: Message,
    ) -> io::Result<()> {
        if self.closed {
            return Ok(());
        }
        if self.partial_message.is_empty() {
            self.write_frame(writer, msg).await
        } else {
            let buf = self.encode(msg);
            self.outqueue.push_back(buf);
            Ok(())
        }
    }

    /// `send_choke`/`send_unchoke` are suppressed entirely while a
    /// partial message is in flight (§4.6): their effect is applied at
    /// drain time by comparing `choke_sent` against `upload.choked()`
    /// (§4.7 step 5), not queued like other control frames.
    pub async fn send_choke<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        upload: &mut dyn UploadPolicy,
    ) -> io::Result<()> {
        if self.closed || !self.partial_message.is_empty() {
            return Ok(());
        }
        self.write_frame(writer, Message::Choke).await?;
        self.choke_sent = true;
        upload.sent_choke();
        Ok(())
    }

    pub async fn send_unchoke<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<()> {
        if self.closed || !self.partial_message.is_empty() {
            return Ok(());
        }
        self.write_frame(writer, Message::Unchoke).await?;
        self.choke_sent = false;
        Ok(())
    }

    pub async fn send_interested<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<()> {
        self.write_or_queue(writer, Message::Interested).await
    }

    pub async fn send_not_interested<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
    ) -> io::Result<()> {
        self.write_or_queue(writer, Message::NotInterested).await
    }

    pub async fn send_have<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        index: u32,
    ) -> io::Result<()> {
        self.write_or_queue(writer, Message::Have { index }).await
    }

    pub async fn send_bitfield<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        bitfield: &crate::Bitfield,
    ) -> io::Result<()> {
        let bytes = crate::bitfield::to_bytes(bitfield);
        self.write_or_queue(writer, Message::Bitfield { bytes }).await
    }

    pub async fn send_request<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        index: u32,
        begin: u32,
        length: u32,
    ) -> io::Result<()> {
        self.write_or_queue(writer, Message::Request { index, begin, length })
            .await
    }

    pub async fn send_cancel<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        index: u32,
        begin: u32,
        length: u32,
    ) -> io::Result<()> {
        self.write_or_queue(writer, Message::Cancel { index, begin, length })
            .await
    }

    pub async fn send_port<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        port: u16,
    ) -> io::Result<()> {
        self.write_or_queue(writer, Message::Port { port }).await
    }

    pub async fn send_have_all<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<()> {
        if !self.uses_fast_extension {
            return Ok(());
        }
        self.write_or_queue(writer, Message::HaveAll).await
    }

    pub async fn send_have_none<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<()> {
        if !self.uses_fast_extension {
            return Ok(());
        }
        self.write_or_queue(writer, Message::HaveNone).await
    }

    pub async fn send_reject_request<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        index: u32,
        begin: u32,
        length: u32,
    ) -> io::Result<()> {
        if !self.uses_fast_extension {
            return Ok(());
        }
        self.write_or_queue(writer, Message::RejectRequest { index, begin, length })
            .await
    }

    pub async fn send_allowed_fast<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        index: u32,
    ) -> io::Result<()> {
        if !self.uses_fast_extension {
            return Ok(());
        }
        self.write_or_queue(writer, Message::AllowedFast { index })
            .await
    }

    pub async fn send_keepalive<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> io::Result<()> {
        self.write_or_queue(writer, Message::KeepAlive).await
    }

    /// Implements the `send_partial(n)` protocol (§4.7): hands the rate
    /// limiter at most `n` bytes of outgoing payload now, returning the
    /// number of bytes actually written.
    pub async fn send_partial<W: AsyncWrite + Unpin>(
        &mut self,
        writer: &mut W,
        n: usize,
        upload: &mut dyn UploadPolicy,
    ) -> io::Result<usize> {
        if self.closed {
            return Ok(0);
        }
        if self.partial_message.is_empty() && upload.buffer_is_empty() {
            return Ok(0);
        }

        if self.partial_message.is_empty() {
            while self.partial_message.len() < n {
                match upload.pop_buffer_front() {
                    Some(piece) => {
                        let frame = self.encode(Message::Piece {
                            index: piece.index,
                            begin: piece.begin,
                            data: piece.data,
                        });
                        self.partial_message.extend_from_slice(&frame);
                    }
                    None => break,
                }
            }
        }

        if self.partial_message.is_empty() {
            return Ok(0);
        }

        if n < self.partial_message.len() {
            let head = self.partial_message.split_to(n);
            writer.write_all(&head).await?;
            upload.update_rate(n);
            return Ok(n);
        }

        let drained = self.partial_message.split_to(self.partial_message.len());
        writer.write_all(&drained).await?;
        upload.update_rate(drained.len());
        let mut total = drained.len();

        if self.choke_sent != upload.choked() {
            let msg = if upload.choked() {
                Message::Choke
            } else {
                Message::Unchoke
            };
            let buf = self.encode(msg);
            writer.write_all(&buf).await?;
            total += buf.len();
            self.choke_sent = upload.choked();
            if self.choke_sent {
                upload.sent_choke();
            }
        }

        while let Some(frame) = self.outqueue.pop_front() {
            writer.write_all(&frame).await?;
            total += frame.len();
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::collaborators::BufferedPiece;
    use pretty_assertions::assert_eq;

    struct FakeUpload {
        choked: bool,
        buffer: VecDeque<BufferedPiece>,
        rate: usize,
        choke_sends: usize,
    }

    impl UploadPolicy for FakeUpload {
        fn got_request(&mut self, _i: u32, _b: u32, _l: u32) {}
        fn got_cancel(&mut self, _i: u32, _b: u32, _l: u32) {}
        fn got_interested(&mut self) {}
        fn got_not_interested(&mut self) {}
        fn sent_choke(&mut self) {
            self.choke_sends += 1;
        }
        fn update_rate(&mut self, byte_count: usize) {
            self.rate += byte_count;
        }
        fn choked(&self) -> bool {
            self.choked
        }
        fn buffer_is_empty(&self) -> bool {
            self.buffer.is_empty()
        }
        fn pop_buffer_front(&mut self) -> Option<BufferedPiece> {
            self.buffer.pop_front()
        }
    }

    #[tokio::test]
    async fn send_have_writes_bit_exact_frame() {
        let mut sender = Sender::new(false, Encryptor::Plain);
        let mut out = Vec::new();
        sender.send_have(&mut out, 0x0102_0304).await.unwrap();
        assert_eq!(
            out,
            vec![0x00, 0x00, 0x00, 0x05, 0x04, 0x01, 0x02, 0x03, 0x04]
        );
    }

    #[tokio::test]
    async fn closed_sender_writes_nothing() {
        let mut sender = Sender::new(false, Encryptor::Plain);
        sender.close();
        let mut out = Vec::new();
        sender.send_have(&mut out, 1).await.unwrap();
        sender.send_keepalive(&mut out).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn fast_senders_are_no_ops_without_negotiation() {
        let mut sender = Sender::new(false, Encryptor::Plain);
        let mut out = Vec::new();
        sender.send_have_all(&mut out).await.unwrap();
        sender.send_allowed_fast(&mut out, 1).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn send_partial_sequencing_matches_scenario_5() {
        let mut sender = Sender::new(false, Encryptor::Plain);
        // a fresh Sender starts choke_sent == true (the connection starts
        // choked), so the upload side starts choked too: no mismatch yet.
        let mut upload = FakeUpload {
            choked: true,
            buffer: VecDeque::new(),
            rate: 0,
            choke_sends: 0,
        };
        // a single 1009-byte PIECE frame: 9-byte header + 996-byte payload.
        upload.buffer.push_back(BufferedPiece {
            index: 1,
            begin: 0,
            data: vec![0u8; 996],
        });

        let mut out = Vec::new();
        let sent = sender.send_partial(&mut out, 500, &mut upload).await.unwrap();
        assert_eq!(sent, 500);
        assert_eq!(out.len(), 500);
        assert!(sender.has_pending_partial());

        // upload unchokes while the partial is in flight; send_unchoke is
        // suppressed, not written immediately.
        upload.choked = false;
        sender.send_unchoke(&mut out).await.unwrap();
        assert_eq!(out.len(), 500);

        let sent = sender
            .send_partial(&mut out, 10_000, &mut upload)
            .await
            .unwrap();
        // remaining 509 bytes of the PIECE frame, plus the deferred UNCHOKE.
        assert_eq!(sent, 509 + 5);
        assert_eq!(out.len(), 1009 + 5);
        assert_eq!(&out[1009..], &[0x00, 0x00, 0x00, 0x01, 0x01][..]);
        assert_eq!(upload.choke_sends, 0);
        assert!(!sender.has_pending_partial());
    }

    #[tokio::test]
    async fn send_partial_returns_zero_when_nothing_pending() {
        let mut sender = Sender::new(false, Encryptor::Plain);
        let mut upload = FakeUpload {
            choked: false,
            buffer: VecDeque::new(),
            rate: 0,
            choke_sends: 0,
        };
        let mut out = Vec::new();
        let sent = sender.send_partial(&mut out, 100, &mut upload).await.unwrap();
        assert_eq!(sent, 0);
        assert!(out.is_empty());
    }
}
