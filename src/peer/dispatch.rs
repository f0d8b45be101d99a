//! Post-handshake message validation and routing (spec §4.5).
//!
//! `dispatch` takes one decoded [`Message`] and either routes it to the
//! `Upload`/`Download` collaborator or to the torrent handle's `got_port`
//! hook, or reports a [`MessageError`] that the caller (`session.rs`)
//! turns into a silent connection close, per policy (§7): no protocol
//! violation ever reaches a collaborator method.

use crate::{
    bitfield,
    error::MessageError,
    peer::{
        codec::Message,
        collaborators::{DownloadPolicy, UploadPolicy},
    },
};

/// Tracks the one piece of dispatch state that isn't already on
/// `PeerConnection`: whether any post-handshake frame has been dispatched
/// yet (`got_anything`, §3), which gates BITFIELD/HAVE_ALL/HAVE_NONE.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchState {
    got_anything: bool,
}

impl DispatchState {
    pub fn new() -> Self {
        Self { got_anything: false }
    }

    pub fn got_anything(&self) -> bool {
        self.got_anything
    }
}

/// Validates and routes `msg` per the §4.5 table. `numpieces` and
/// `uses_fast_extension` come from the handshake; `dht_port` is written
/// back through a callback rather than returned, since the caller owns
/// where it lives on `PeerConnection`.
///
/// Returns `Ok(())` having dispatched to a collaborator (or done nothing,
/// for `KeepAlive`), or `Err` for any violation in the table — the caller
/// must close the connection without having called any collaborator
/// method for that frame.
pub fn dispatch(
    state: &mut DispatchState,
    msg: Message,
    numpieces: u32,
    uses_fast_extension: bool,
    upload: &mut dyn UploadPolicy,
    download: &mut dyn DownloadPolicy,
    mut got_port: impl FnMut(u16),
) -> Result<(), MessageError> {
    let is_have_class_first = matches!(
        msg,
        Message::Bitfield { .. } | Message::HaveAll | Message::HaveNone
    );
    if is_have_class_first && state.got_anything {
        return Err(MessageError::BitfieldNotFirst);
    }

    let requires_fast = matches!(
        msg,
        Message::SuggestPiece { .. }
            | Message::HaveAll
            | Message::HaveNone
            | Message::RejectRequest { .. }
            | Message::AllowedFast { .. }
    );
    if requires_fast && !uses_fast_extension {
        return Err(MessageError::FastExtensionNotNegotiated);
    }

    match msg {
        Message::KeepAlive => return Ok(()),
        Message::Choke => download.got_choke(),
        Message::Unchoke => download.got_unchoke(),
        Message::Interested => upload.got_interested(),
        Message::NotInterested => upload.got_not_interested(),
        Message::Have { index } => {
            check_index(index, numpieces)?;
            download.got_have(index);
        }
        Message::Bitfield { bytes } => {
            let bitfield = bitfield::from_bytes(numpieces, &bytes)
                .map_err(|_| MessageError::InvalidPieceIndex { index: 0, numpieces })?;
            download.got_have_bitfield(bitfield);
        }
        Message::Request { index, begin, length } => {
            check_index(index, numpieces)?;
            upload.got_request(index, begin, length);
        }
        Message::Cancel { index, begin, length } => {
            check_index(index, numpieces)?;
            upload.got_cancel(index, begin, length);
        }
        Message::Piece { index, begin, data } => {
            check_index(index, numpieces)?;
            download.got_piece(index, begin, data);
        }
        Message::Port { port } => got_port(port),
        Message::SuggestPiece { index } => {
            check_index(index, numpieces)?;
            download.got_suggest_piece(index);
        }
        Message::HaveAll => download.got_have_all(),
        Message::HaveNone => download.got_have_none(),
        Message::RejectRequest { index, begin, length } => {
            check_index(index, numpieces)?;
            download.got_reject_request(index, begin, length);
        }
        Message::AllowedFast { index } => {
            check_index(index, numpieces)?;
            download.got_allowed_fast(index);
        }
    }

    state.got_anything = true;
    Ok(())
}

fn check_index(index: u32, numpieces: u32) -> Result<(), MessageError> {
    if index >= numpieces {
        Err(MessageError::InvalidPieceIndex { index, numpieces })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::collaborators::BufferedPiece;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct RecordingUpload {
        interested: bool,
        requests: Vec<(u32, u32, u32)>,
    }

    impl UploadPolicy for RecordingUpload {
        fn got_request(&mut self, index: u32, begin: u32, length: u32) {
            self.requests.push((index, begin, length));
        }
        fn got_cancel(&mut self, _index: u32, _begin: u32, _length: u32) {}
        fn got_interested(&mut self) {
            self.interested = true;
        }
        fn got_not_interested(&mut self) {
            self.interested = false;
        }
        fn sent_choke(&mut self) {}
        fn update_rate(&mut self, _byte_count: usize) {}
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
        pieces_received: usize,
        bitfield_received: bool,
    }

    impl DownloadPolicy for RecordingDownload {
        fn got_choke(&mut self) {}
        fn got_unchoke(&mut self) {}
        fn got_have(&mut self, index: u32) {
            self.haves.push(index);
        }
        fn got_have_bitfield(&mut self, _bitfield: crate::Bitfield) {
            self.bitfield_received = true;
        }
        fn got_piece(&mut self, _index: u32, _begin: u32, _data: Vec<u8>) {
            self.pieces_received += 1;
        }
        fn got_suggest_piece(&mut self, _index: u32) {}
        fn got_have_all(&mut self) {}
        fn got_have_none(&mut self) {}
        fn got_reject_request(&mut self, _index: u32, _begin: u32, _length: u32) {}
        fn got_allowed_fast(&mut self, _index: u32) {}
        fn disconnected(&mut self) {}
    }

    #[test]
    fn have_within_bounds_dispatches_and_sets_latch() {
        let mut state = DispatchState::new();
        let mut upload = RecordingUpload::default();
        let mut download = RecordingDownload::default();
        dispatch(
            &mut state,
            Message::Have { index: 3 },
            100,
            false,
            &mut upload,
            &mut download,
            |_| {},
        )
        .unwrap();
        assert_eq!(download.haves, vec![3]);
        assert!(state.got_anything());
    }

    #[test]
    fn oversize_piece_index_closes_without_dispatch() {
        let mut state = DispatchState::new();
        let mut upload = RecordingUpload::default();
        let mut download = RecordingDownload::default();
        let err = dispatch(
            &mut state,
            Message::Piece {
                index: 100,
                begin: 0,
                data: vec![1, 2, 3],
            },
            100,
            false,
            &mut upload,
            &mut download,
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, MessageError::InvalidPieceIndex { .. }));
        assert_eq!(download.pieces_received, 0);
        assert!(!state.got_anything());
    }

    #[test]
    fn bitfield_after_have_closes() {
        let mut state = DispatchState::new();
        let mut upload = RecordingUpload::default();
        let mut download = RecordingDownload::default();
        dispatch(
            &mut state,
            Message::Have { index: 1 },
            100,
            false,
            &mut upload,
            &mut download,
            |_| {},
        )
        .unwrap();

        let bytes = vec![0u8; 13];
        let err = dispatch(
            &mut state,
            Message::Bitfield { bytes },
            100,
            false,
            &mut upload,
            &mut download,
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, MessageError::BitfieldNotFirst));
        assert!(!download.bitfield_received);
    }

    #[test]
    fn fast_message_without_negotiation_closes() {
        let mut state = DispatchState::new();
        let mut upload = RecordingUpload::default();
        let mut download = RecordingDownload::default();
        let err = dispatch(
            &mut state,
            Message::HaveAll,
            100,
            false,
            &mut upload,
            &mut download,
            |_| {},
        )
        .unwrap_err();
        assert!(matches!(err, MessageError::FastExtensionNotNegotiated));
    }

    #[test]
    fn port_message_invokes_callback() {
        let mut state = DispatchState::new();
        let mut upload = RecordingUpload::default();
        let mut download = RecordingDownload::default();
        let mut seen_port = None;
        dispatch(
            &mut state,
            Message::Port { port: 6881 },
            100,
            false,
            &mut upload,
            &mut download,
            |port| seen_port = Some(port),
        )
        .unwrap();
        assert_eq!(seen_port, Some(6881));
    }
}
