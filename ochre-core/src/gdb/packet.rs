//! Remote-serial packet framing: streaming decode and run-length encode.
//!
//! The wire form of a packet is `$<body>#<checksum>` where the checksum is
//! the byte sum of the body, modulo 256, as two lowercase hex digits. Inside
//! a body, `}` escapes the next byte by XOR with `0x20`. The single bytes
//! `+`, `-`, and `0x03` are complete packets of their own when they arrive
//! between frames.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Upper bound on the body of one incoming packet.
pub const MAX_PACKET_BYTES: usize = 1_048_576;

#[derive(Error, Debug, Clone, Eq, PartialEq)]
pub enum PacketError {
    #[error("packet checksum mismatch")]
    BadChecksum,
    #[error("malformed packet")]
    BadPacket,
    #[error("packet exceeds maximum size")]
    BufferOverflow,
    #[error("internal decoder failure")]
    InternalError,
    #[error("no new packet")]
    NoNewPacket,
}

/// Byte sum of `body`, modulo 256. The empty body sums to zero.
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |sum, &byte| sum.wrapping_add(byte))
}

/// Applies the inverse `}`-escape. `None` if an escape is dangling or
/// escapes another `}`.
pub fn remove_escape(body: &[u8]) -> Option<Vec<u8>> {
    let mut result = Vec::with_capacity(body.len());
    let mut bytes = body.iter();
    while let Some(&byte) = bytes.next() {
        if byte == b'}' {
            let &escaped = bytes.next()?;
            if escaped == b'}' {
                return None;
            }
            result.push(escaped ^ 0x20);
        } else {
            result.push(byte);
        }
    }
    Some(result)
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum State {
    WaitingDollar,
    Body,
    Checksum1,
    Checksum2,
}

/// Push-oriented streaming packet decoder.
///
/// Bytes go in through [`push`](Self::push); complete results (decoded
/// bodies or per-packet errors) come out of an internal queue through
/// [`pop_packet`](Self::pop_packet). The queue is shared under a lock so a
/// reader on another thread can drain it while the connection keeps feeding
/// the decoder; `new_packet_available` is published through an atomic flag.
#[derive(Debug)]
pub struct PacketDecoder {
    state: State,
    body: Vec<u8>,
    checksum_chars: [u8; 2],
    out_queue: Mutex<VecDeque<Result<String, PacketError>>>,
    available: AtomicBool,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketDecoder {
    pub fn new() -> Self {
        Self {
            state: State::WaitingDollar,
            body: Vec::new(),
            checksum_chars: [0; 2],
            out_queue: Mutex::new(VecDeque::new()),
            available: AtomicBool::new(false),
        }
    }

    fn push_result(&mut self, result: Result<String, PacketError>) {
        let mut queue = self.out_queue.lock().unwrap();
        queue.push_back(result);
        self.available.store(true, Ordering::Release);
        self.body.clear();
    }

    /// Feeds raw connection bytes into the decoder. Use
    /// [`new_packet_available`](Self::new_packet_available) to learn whether
    /// this produced anything.
    pub fn push(&mut self, input: &[u8]) {
        for &byte in input {
            match self.state {
                State::WaitingDollar => match byte {
                    b'$' => self.state = State::Body,
                    // ACK, NAK, and Ctrl-C are packets of their own.
                    b'+' | b'-' | 0x03 => {
                        self.push_result(Ok((byte as char).to_string()));
                    }
                    _ => {}
                },
                State::Body => match byte {
                    b'#' => self.state = State::Checksum1,
                    // A fresh `$` abandons the current attempt and starts
                    // over with a new body.
                    b'$' => {
                        self.push_result(Err(PacketError::BadPacket));
                        self.state = State::Body;
                    }
                    _ => {
                        if self.body.len() >= MAX_PACKET_BYTES {
                            self.push_result(Err(PacketError::BufferOverflow));
                            self.state = State::WaitingDollar;
                        } else {
                            self.body.push(byte);
                        }
                    }
                },
                State::Checksum1 | State::Checksum2 => match byte {
                    b'$' => {
                        self.push_result(Err(PacketError::BadPacket));
                        self.state = State::Body;
                    }
                    b'+' | b'-' | 0x03 => {
                        self.push_result(Err(PacketError::BadPacket));
                        self.push_result(Ok((byte as char).to_string()));
                        self.state = State::WaitingDollar;
                    }
                    _ => {
                        if self.state == State::Checksum1 {
                            self.checksum_chars[0] = byte;
                            self.state = State::Checksum2;
                        } else {
                            self.checksum_chars[1] = byte;
                            let decoded = self.decode_body();
                            self.push_result(decoded);
                            self.state = State::WaitingDollar;
                        }
                    }
                },
            }
        }
    }

    fn decode_body(&self) -> Result<String, PacketError> {
        if !self.checksum_chars.iter().all(u8::is_ascii_hexdigit) {
            return Err(PacketError::BadPacket);
        }
        let received = checksum_chars_value(self.checksum_chars);
        if received != checksum(&self.body) {
            return Err(PacketError::BadChecksum);
        }
        let unescaped = remove_escape(&self.body).ok_or(PacketError::BadPacket)?;
        String::from_utf8(unescaped).map_err(|_| PacketError::InternalError)
    }

    /// Returns `true` if [`pop_packet`](Self::pop_packet) has something to
    /// deliver.
    pub fn new_packet_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }

    /// Pops the oldest decode result, or [`PacketError::NoNewPacket`] when
    /// the queue is empty.
    pub fn pop_packet(&self) -> Result<String, PacketError> {
        let mut queue = self.out_queue.lock().unwrap();
        let packet = queue.pop_front().unwrap_or(Err(PacketError::NoNewPacket));
        self.available.store(!queue.is_empty(), Ordering::Release);
        packet
    }
}

fn checksum_chars_value(chars: [u8; 2]) -> u8 {
    let digit = |c: u8| (c as char).to_digit(16).unwrap() as u8;
    digit(chars[0]) << 4 | digit(chars[1])
}

/// Run-length encoder producing the outgoing wire form.
#[derive(Debug, Default)]
pub struct PacketEncoder {
    out: Vec<u8>,
    last: u8,
    repeat: u8,
}

/// Largest number of extra repetitions one `*` marker can carry
/// (`b'~' - 29`).
const MAX_RUN_EXTRA: u8 = 126 - 29;

impl PacketEncoder {
    /// Encodes `body` into a complete framed packet, applying escaping and
    /// run-length encoding.
    pub fn encode(body: &str) -> String {
        let mut encoder = Self::default();
        for &byte in body.as_bytes() {
            encoder.push(byte);
        }
        encoder.flush_run();

        let sum = checksum(&encoder.out);
        let mut framed = Vec::with_capacity(encoder.out.len() + 4);
        framed.push(b'$');
        framed.extend_from_slice(&encoder.out);
        framed.extend_from_slice(format!("#{sum:02x}").as_bytes());
        String::from_utf8(framed).expect("wire form is ascii")
    }

    fn push(&mut self, byte: u8) {
        if byte == 0 {
            return;
        }
        if byte != self.last || self.repeat >= MAX_RUN_EXTRA {
            self.flush_run();
            self.last = byte;
            self.repeat = 0;
            if matches!(byte, b'*' | b'$' | b'}' | b'#') {
                self.out.push(b'}');
                self.out.push(byte ^ 0x20);
            } else {
                self.out.push(byte);
            }
        } else {
            self.repeat += 1;
        }
    }

    fn flush_run(&mut self) {
        if self.repeat == 0 || self.last == 0 {
            return;
        }
        match self.repeat {
            // Short runs are cheaper spelled out.
            1 | 2 => {
                for _ in 0..self.repeat {
                    self.out.push(self.last);
                }
            }
            // The markers for 6 and 7 extras would be `#` and `$`, which
            // collide with the framing; emit a 5-marker plus literals.
            6 => self.out.extend_from_slice(&[b'*', b'"', self.last]),
            7 => self
                .out
                .extend_from_slice(&[b'*', b'"', self.last, self.last]),
            extra => self.out.extend_from_slice(&[b'*', extra + 29]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_packets_produce_nothing() {
        for input in ["", "$", "$#"] {
            let mut decoder = PacketDecoder::new();
            decoder.push(input.as_bytes());
            assert!(!decoder.new_packet_available());
        }
        let decoder = PacketDecoder::new();
        assert_eq!(Err(PacketError::NoNewPacket), decoder.pop_packet());
    }

    #[test]
    fn acknowledge_bytes_are_packets() {
        let mut decoder = PacketDecoder::new();
        decoder.push(b"+");
        assert_eq!(Ok("+".to_string()), decoder.pop_packet());

        let mut decoder = PacketDecoder::new();
        decoder.push(b"-");
        assert_eq!(Ok("-".to_string()), decoder.pop_packet());

        let mut decoder = PacketDecoder::new();
        decoder.push(b"+$Hello#f4");
        assert_eq!(Ok("+".to_string()), decoder.pop_packet());
        assert_eq!(Ok("Hello".to_string()), decoder.pop_packet());
    }

    #[test]
    fn invalid_packets() {
        for input in ["$#vv", "$$", "$##q", "$#$"] {
            let mut decoder = PacketDecoder::new();
            decoder.push(input.as_bytes());
            assert_eq!(
                Err(PacketError::BadPacket),
                decoder.pop_packet(),
                "input {input:?}"
            );
        }
    }

    #[test]
    fn checksum_validation() {
        let mut decoder = PacketDecoder::new();
        decoder.push(b"$#00");
        assert_eq!(Ok(String::new()), decoder.pop_packet());

        let mut decoder = PacketDecoder::new();
        decoder.push(b"$#f5");
        assert_eq!(Err(PacketError::BadChecksum), decoder.pop_packet());

        let mut decoder = PacketDecoder::new();
        decoder.push(b"$Hello#f4");
        assert_eq!(Ok("Hello".to_string()), decoder.pop_packet());

        let mut decoder = PacketDecoder::new();
        decoder.push(b"$Hello#20");
        assert_eq!(Err(PacketError::BadChecksum), decoder.pop_packet());
    }

    #[test]
    fn body_overflow() {
        let mut input = vec![b'$'];
        input.extend(std::iter::repeat(b'A').take(MAX_PACKET_BYTES + 1));
        input.push(b'#');
        let sum = (b'A' as usize * (MAX_PACKET_BYTES + 1) % 256) as u8;
        input.extend_from_slice(format!("{sum:02x}").as_bytes());

        let mut decoder = PacketDecoder::new();
        decoder.push(&input);
        assert_eq!(Err(PacketError::BufferOverflow), decoder.pop_packet());
    }

    #[test]
    fn multiple_packets_in_one_push() {
        let mut decoder = PacketDecoder::new();
        decoder.push(b"$Hello#f4$World#08");
        assert_eq!(Ok("Hello".to_string()), decoder.pop_packet());
        assert_eq!(Ok("World".to_string()), decoder.pop_packet());
        assert!(!decoder.new_packet_available());

        // A bad packet does not corrupt the one that follows.
        let mut decoder = PacketDecoder::new();
        decoder.push(b"$Hello#f0$World#08");
        assert_eq!(Err(PacketError::BadChecksum), decoder.pop_packet());
        assert_eq!(Ok("World".to_string()), decoder.pop_packet());
        assert!(!decoder.new_packet_available());
    }

    #[test]
    fn real_world_packets() {
        let mut decoder = PacketDecoder::new();
        decoder.push(b"$vMustReplyEmpty#3a");
        assert_eq!(Ok("vMustReplyEmpty".to_string()), decoder.pop_packet());

        let body = "qSupported:multiprocess+;swbreak+;hwbreak+;qRelocInsn+;fork-events+;\
                    vfork-events+;exec-events+;vContSupported+;QThreadEvents+;\
                    QThreadOptions+;no-resumed+;memory-tagging+;error-message+";
        let mut decoder = PacketDecoder::new();
        decoder.push(format!("${body}#89").as_bytes());
        assert_eq!(Ok(body.to_string()), decoder.pop_packet());
    }

    #[test]
    fn ack_after_and_inside_frames() {
        let mut decoder = PacketDecoder::new();
        decoder.push(b"$vMustReplyEmpty#3a-");
        assert_eq!(Ok("vMustReplyEmpty".to_string()), decoder.pop_packet());
        assert_eq!(Ok("-".to_string()), decoder.pop_packet());

        // A NAK in the middle of a checksum flunks the frame but is itself
        // still delivered, in that order.
        let mut decoder = PacketDecoder::new();
        decoder.push(b"$vMustReplyEmpty#-");
        assert_eq!(Err(PacketError::BadPacket), decoder.pop_packet());
        assert_eq!(Ok("-".to_string()), decoder.pop_packet());
    }

    #[test]
    fn escape_removal() {
        assert_eq!(Some(b"Hello".to_vec()), remove_escape(b"Hello"));
        assert_eq!(
            Some(b"Hello".to_vec()),
            remove_escape(&[b'}', b'H' ^ 0x20, b'e', b'l', b'l', b'o'])
        );
        assert_eq!(
            None,
            remove_escape(&[b'}', b'H' ^ 0x20, b'e', b'l', b'l', b'o', b'}'])
        );
        assert_eq!(None, remove_escape(b"}}Hello"));
        assert_eq!(Some(b"}".to_vec()), remove_escape(&[b'}', b'}' ^ 0x20]));
    }

    #[test]
    fn run_length_encoding_table() {
        let encode_repeat = |n: usize| PacketEncoder::encode(&"0".repeat(n));

        assert_eq!("$0#30", encode_repeat(1));
        assert_eq!("$00#60", encode_repeat(2));
        assert_eq!("$000#90", encode_repeat(3));
        assert_eq!("$0* #7a", encode_repeat(4));
        assert_eq!("$0*!#7b", encode_repeat(5));
        assert_eq!("$0*\"#7c", encode_repeat(6));
        assert_eq!("$0*\"0#ac", encode_repeat(7));
        assert_eq!("$0*\"00#dc", encode_repeat(8));
        assert_eq!("$0*%#7f", encode_repeat(9));

        assert_eq!("$0*~#d8", encode_repeat(98));
        assert_eq!("$0*~0#08", encode_repeat(99));
        assert_eq!("$0*~00#38", encode_repeat(100));
        assert_eq!("$0*~000#68", encode_repeat(101));
        assert_eq!("$0*~0* #52", encode_repeat(102));
    }

    #[test]
    fn encode_mixed_runs() {
        assert_eq!(
            "$My favourite * number is 0* 1234#0e",
            PacketEncoder::encode("My favourite    number is 00001234")
        );
    }

    #[test]
    fn encode_escapes_specials() {
        assert_eq!("$}\x04#81", PacketEncoder::encode("$"));
        assert_eq!("$}\x03#80", PacketEncoder::encode("#"));
        assert_eq!("$}\x0a#87", PacketEncoder::encode("*"));
        assert_eq!("$}]#da", PacketEncoder::encode("}"));
    }

    #[test]
    fn encode_decode_roundtrip() {
        let bodies = [
            "OK",
            "T05hwbreak:;",
            "m00000000ffffffff",
            "E.no such breakpoint",
            "words   with   runs    of spaces",
        ];
        for body in bodies {
            let wire = PacketEncoder::encode(body);
            // Expand RLE the way the debugger would before re-decoding.
            let mut expanded = String::new();
            let mut chars = wire[1..wire.len() - 3].chars().peekable();
            let mut previous = '\0';
            while let Some(c) = chars.next() {
                if c == '*' {
                    let count = chars.next().unwrap() as u8 - 29;
                    for _ in 0..count {
                        expanded.push(previous);
                    }
                } else {
                    expanded.push(c);
                    previous = c;
                }
            }
            let mut decoder = PacketDecoder::new();
            decoder.push(format!("${}#{:02x}", expanded, checksum(expanded.as_bytes())).as_bytes());
            assert_eq!(Ok(body.to_string()), decoder.pop_packet(), "body {body:?}");
        }
    }
}
