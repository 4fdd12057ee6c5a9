//! Packet framing (C1): turns a byte stream into reassembled application
//! messages, and application payloads into wire frames. This module knows
//! nothing about command codes or node layouts — it only frames bytes.

/// Every HID-mode frame is exactly this many bytes.
pub const HID_FRAME_SIZE: usize = 64;
/// Maximum application payload bytes carried by a single HID frame.
pub const HID_FRAME_PAYLOAD_MAX: usize = HID_FRAME_SIZE - 2;

/// Every stream-mode frame is exactly this many bytes (local socket / BLE).
pub const STREAM_FRAME_SIZE: usize = 560;
/// Maximum application payload bytes carried by a single stream frame.
pub const STREAM_FRAME_PAYLOAD_MAX: usize = STREAM_FRAME_SIZE - 4;

#[derive(Debug, Clone, thiserror::Error)]
pub enum FrameError {
    #[error("frame is {got} bytes, expected {expected}")]
    WrongSize { expected: usize, got: usize },
    #[error("payload length {len} exceeds the {max}-byte frame capacity")]
    PayloadTooLarge { len: usize, max: usize },
}

/// One HID-mode frame, decoded from its 64-byte wire form.
///
/// `header` carries the command code on the first frame of a message; on
/// every following frame of the same message it instead carries that
/// frame's 1-based packet number, per the frozen layout's "multi-packet
/// messages are numbered in the header" rule. There is no continuation bit:
/// a frame whose payload is shorter than [`HID_FRAME_PAYLOAD_MAX`] is always
/// the last frame of its message (see [`hid_create_frames`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidFrame {
    /// Alternates between logically distinct commands; stale-response guard.
    pub flip: bool,
    pub ack_flag: bool,
    pub header: u8,
    pub payload: Vec<u8>,
}

impl HidFrame {
    /// Encodes as `[ (len & 0x3F) | (flip<<7) | (ack_flag<<6), header, payload..., 0-pad ]`.
    pub fn encode(&self) -> Result<[u8; HID_FRAME_SIZE], FrameError> {
        if self.payload.len() > HID_FRAME_PAYLOAD_MAX {
            return Err(FrameError::PayloadTooLarge {
                len: self.payload.len(),
                max: HID_FRAME_PAYLOAD_MAX,
            });
        }
        let mut out = [0u8; HID_FRAME_SIZE];
        let len_byte = (self.payload.len() as u8 & 0x3F)
            | ((self.flip as u8) << 7)
            | ((self.ack_flag as u8) << 6);
        out[0] = len_byte;
        out[1] = self.header;
        out[2..2 + self.payload.len()].copy_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, FrameError> {
        if frame.len() != HID_FRAME_SIZE {
            return Err(FrameError::WrongSize {
                expected: HID_FRAME_SIZE,
                got: frame.len(),
            });
        }
        let len = (frame[0] & 0x3F) as usize;
        let flip = frame[0] & 0x80 != 0;
        let ack_flag = frame[0] & 0x40 != 0;
        let header = frame[1];
        let payload = frame[2..2 + len].to_vec();
        Ok(Self {
            flip,
            ack_flag,
            header,
            payload,
        })
    }
}

/// Reassembles a sequence of HID frames belonging to one logical message.
/// The first frame pushed supplies the command and flip bit for the whole
/// message; a frame whose payload is shorter than the frame capacity
/// completes the message (see [`hid_create_frames`] for why this is always
/// unambiguous).
#[derive(Debug, Default)]
pub struct HidReassembler {
    command: Option<u8>,
    flip: Option<bool>,
    payload: Vec<u8>,
}

impl HidReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one decoded frame. Returns the complete `(command, flip,
    /// payload)` once the final frame of a message has been pushed.
    pub fn push(&mut self, frame: HidFrame) -> Option<(u8, bool, Vec<u8>)> {
        if self.command.is_none() {
            self.command = Some(frame.header);
            self.flip = Some(frame.flip);
        }
        let is_final = frame.payload.len() < HID_FRAME_PAYLOAD_MAX;
        self.payload.extend_from_slice(&frame.payload);
        if is_final {
            let command = self.command.take().unwrap_or(frame.header);
            let flip = self.flip.take().unwrap_or(frame.flip);
            Some((command, flip, std::mem::take(&mut self.payload)))
        } else {
            None
        }
    }
}

/// Encodes one application payload into one or more HID frames. The first
/// frame's header byte is the command code; every following frame's header
/// byte is instead that frame's 1-based packet number. When the payload is
/// an exact multiple of the per-frame capacity, a trailing empty frame is
/// appended so the reassembler always sees a short final frame.
pub fn hid_create_frames(command: u8, flip: bool, payload: &[u8]) -> Vec<[u8; HID_FRAME_SIZE]> {
    if payload.is_empty() {
        return vec![HidFrame {
            flip,
            ack_flag: false,
            header: command,
            payload: Vec::new(),
        }
        .encode()
        .expect("empty payload always fits")];
    }
    let mut frames: Vec<[u8; HID_FRAME_SIZE]> = payload
        .chunks(HID_FRAME_PAYLOAD_MAX)
        .enumerate()
        .map(|(i, chunk)| {
            let header = if i == 0 { command } else { i as u8 };
            HidFrame {
                flip,
                ack_flag: false,
                header,
                payload: chunk.to_vec(),
            }
            .encode()
            .expect("chunk respects frame capacity")
        })
        .collect();
    if payload.len() % HID_FRAME_PAYLOAD_MAX == 0 {
        let packet_number = (payload.len() / HID_FRAME_PAYLOAD_MAX) as u8;
        frames.push(
            HidFrame {
                flip,
                ack_flag: false,
                header: packet_number,
                payload: Vec::new(),
            }
            .encode()
            .expect("empty payload always fits"),
        );
    }
    frames
}

/// Encodes one application payload into a single stream-mode frame:
/// `[0, 0, len_lo, len_hi, payload..., 0-pad]`, total `STREAM_FRAME_SIZE` bytes.
pub fn stream_encode_frame(payload: &[u8]) -> Result<[u8; STREAM_FRAME_SIZE], FrameError> {
    if payload.len() > STREAM_FRAME_PAYLOAD_MAX {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max: STREAM_FRAME_PAYLOAD_MAX,
        });
    }
    let mut out = [0u8; STREAM_FRAME_SIZE];
    let len = payload.len() as u16;
    out[2..4].copy_from_slice(&len.to_le_bytes());
    out[4..4 + payload.len()].copy_from_slice(payload);
    Ok(out)
}

/// Splits a possibly-oversized application payload into as many
/// `STREAM_FRAME_SIZE` frames as needed. Unlike HID mode there is no
/// continuation marker in the frozen frame format, so each stream frame is
/// addressed to the same command and the reader concatenates payloads in
/// order up to the total length carried out-of-band by the caller.
pub fn stream_create_frames(payload: &[u8]) -> Vec<[u8; STREAM_FRAME_SIZE]> {
    if payload.is_empty() {
        return vec![stream_encode_frame(&[]).expect("empty payload always fits")];
    }
    payload
        .chunks(STREAM_FRAME_PAYLOAD_MAX)
        .map(|chunk| stream_encode_frame(chunk).expect("chunk respects frame capacity"))
        .collect()
}

/// Accumulates raw bytes from a stream-oriented transport (local socket /
/// BLE) and yields one payload per complete `STREAM_FRAME_SIZE`-byte frame.
/// Handles arbitrary read granularity: a read may deliver less than one
/// frame, more than one frame, or a frame boundary mid-frame.
#[derive(Debug, Default)]
pub struct StreamReassembler {
    buf: Vec<u8>,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds newly-read bytes, draining and returning every payload whose
    /// frame is now fully buffered.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        while self.buf.len() >= STREAM_FRAME_SIZE {
            let frame: Vec<u8> = self.buf.drain(..STREAM_FRAME_SIZE).collect();
            let len = u16::from_le_bytes([frame[2], frame[3]]) as usize;
            let len = len.min(STREAM_FRAME_PAYLOAD_MAX);
            out.push(frame[4..4 + len].to_vec());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hid_frame_round_trip_small_payload() {
        for len in 0..=HID_FRAME_PAYLOAD_MAX {
            let payload: Vec<u8> = (0..len as u8).collect();
            let frame = HidFrame {
                flip: len % 2 == 0,
                ack_flag: false,
                header: 0x42,
                payload: payload.clone(),
            };
            let encoded = frame.encode().unwrap();
            let decoded = HidFrame::decode(&encoded).unwrap();
            assert_eq!(decoded.payload, payload);
            assert_eq!(decoded.header, 0x42);
            assert_eq!(decoded.flip, frame.flip);
            assert!(!decoded.ack_flag);
        }
    }

    #[test]
    fn hid_flip_bit_survives_round_trip() {
        let a = HidFrame {
            flip: true,
            ack_flag: false,
            header: 1,
            payload: vec![],
        }
        .encode()
        .unwrap();
        let b = HidFrame {
            flip: false,
            ack_flag: false,
            header: 1,
            payload: vec![],
        }
        .encode()
        .unwrap();
        assert_ne!(a[0], b[0]);
    }

    #[test]
    fn hid_ack_flag_survives_round_trip() {
        let encoded = HidFrame {
            flip: false,
            ack_flag: true,
            header: 1,
            payload: vec![],
        }
        .encode()
        .unwrap();
        let decoded = HidFrame::decode(&encoded).unwrap();
        assert!(decoded.ack_flag);
    }

    #[test]
    fn hid_multi_frame_reassembly() {
        let payload: Vec<u8> = (0..200u16).map(|v| v as u8).collect();
        let frames = hid_create_frames(0x10, true, &payload);
        assert!(frames.len() > 1);
        let mut reassembler = HidReassembler::new();
        let mut result = None;
        for raw in &frames {
            let frame = HidFrame::decode(raw).unwrap();
            if let Some(done) = reassembler.push(frame) {
                result = Some(done);
            }
        }
        let (command, flip, got) = result.expect("message completed");
        assert_eq!(command, 0x10);
        assert!(flip);
        assert_eq!(got, payload);
    }

    #[test]
    fn hid_multi_frame_reassembly_with_exact_multiple_payload() {
        let payload = vec![0xAAu8; HID_FRAME_PAYLOAD_MAX * 2];
        let frames = hid_create_frames(0x20, false, &payload);
        // Two full chunks plus the trailing empty frame that signals completion.
        assert_eq!(frames.len(), 3);
        let mut reassembler = HidReassembler::new();
        let mut result = None;
        for raw in &frames {
            let frame = HidFrame::decode(raw).unwrap();
            if let Some(done) = reassembler.push(frame) {
                result = Some(done);
            }
        }
        let (command, _flip, got) = result.expect("message completed");
        assert_eq!(command, 0x20);
        assert_eq!(got, payload);
    }

    #[test]
    fn hid_continuation_frames_are_numbered_in_the_header() {
        let payload: Vec<u8> = (0..200u16).map(|v| v as u8).collect();
        let frames = hid_create_frames(0x10, true, &payload);
        let decoded: Vec<_> = frames.iter().map(|f| HidFrame::decode(f).unwrap()).collect();
        assert_eq!(decoded[0].header, 0x10);
        for (i, frame) in decoded.iter().enumerate().skip(1) {
            assert_eq!(frame.header, i as u8);
        }
    }

    #[test]
    fn stream_frame_is_fixed_size_and_zero_padded() {
        let frame = stream_encode_frame(b"hi").unwrap();
        assert_eq!(frame.len(), STREAM_FRAME_SIZE);
        assert_eq!(&frame[0..2], &[0, 0]);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 2);
        assert_eq!(&frame[4..6], b"hi");
        assert!(frame[6..].iter().all(|&b| b == 0));
    }

    #[test]
    fn stream_reassembler_handles_split_reads() {
        let frame = stream_encode_frame(b"payload").unwrap();
        let mut reassembler = StreamReassembler::new();
        assert!(reassembler.push(&frame[..10]).is_empty());
        assert!(reassembler.push(&frame[10..300]).is_empty());
        let got = reassembler.push(&frame[300..]);
        assert_eq!(got, vec![b"payload".to_vec()]);
    }

    #[test]
    fn stream_reassembler_handles_multiple_frames_in_one_read() {
        let f1 = stream_encode_frame(b"one").unwrap();
        let f2 = stream_encode_frame(b"two").unwrap();
        let mut combined = f1.to_vec();
        combined.extend_from_slice(&f2);
        let mut reassembler = StreamReassembler::new();
        let got = reassembler.push(&combined);
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let payload = vec![0u8; STREAM_FRAME_PAYLOAD_MAX + 1];
        assert!(matches!(
            stream_encode_frame(&payload),
            Err(FrameError::PayloadTooLarge { .. })
        ));
    }
}
