//! Wire disciplines
//!
//! Encoding and decoding rules for raw streams, length-framed streams and
//! datagrams, plus the growable buffer the worker reads into.

use super::{SocketError, SocketResult};
use std::io::{ErrorKind, Read, Write};

/// Length of the big-endian frame header on framed streams
pub const FRAME_HEADER_LEN: usize = 4;

/// Receive capacity a stream handle starts with
pub const INITIAL_BUFFER_SIZE: usize = 1 << 12;

/// Largest payload accepted by a datagram send
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Receive capacity reserved for datagram listeners
pub const DATAGRAM_BUFFER_SIZE: usize = 1 << 16;

/// Wire framing rule of a socket, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discipline {
    /// Stream socket without message boundaries
    RawStream,
    /// Stream socket carrying length-prefixed frames
    FramedStream,
    /// Unframed datagram socket
    Datagram,
}

impl Discipline {
    pub fn as_str(&self) -> &'static str {
        match self {
            Discipline::RawStream => "raw",
            Discipline::FramedStream => "framed",
            Discipline::Datagram => "datagram",
        }
    }

    pub fn is_stream(&self) -> bool {
        !matches!(self, Discipline::Datagram)
    }
}

/// Encode a payload length as a frame header
pub fn encode_frame_header(len: usize) -> SocketResult<[u8; FRAME_HEADER_LEN]> {
    let len = u32::try_from(len).map_err(|_| SocketError::Send)?;
    Ok(len.to_be_bytes())
}

/// Decode a frame header into a payload length
pub fn decode_frame_header(header: [u8; FRAME_HEADER_LEN]) -> usize {
    u32::from_be_bytes(header) as usize
}

/// Reject datagram payloads over [`MAX_DATAGRAM_SIZE`]
pub fn check_datagram_len(len: usize) -> SocketResult<()> {
    if len > MAX_DATAGRAM_SIZE {
        return Err(SocketError::Send);
    }
    Ok(())
}

/// Receive buffer owned by a handle's worker.
///
/// Capacity only ever grows. A framed message longer than the current
/// capacity grows it to twice the declared length. Growth only reserves
/// address space; bytes are committed as they arrive.
#[derive(Debug)]
pub struct RecvBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_BUFFER_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Make room for a message of `len` bytes, doubling past it when growing
    pub fn reserve_message(&mut self, len: usize) -> SocketResult<()> {
        if len <= self.capacity {
            return Ok(());
        }
        let target = len.checked_mul(2).ok_or(SocketError::Buffer)?;
        self.grow_to(target)
    }

    /// Make room for at least `capacity` bytes
    pub fn ensure_capacity(&mut self, capacity: usize) -> SocketResult<()> {
        if capacity <= self.capacity {
            return Ok(());
        }
        self.grow_to(capacity)
    }

    fn grow_to(&mut self, target: usize) -> SocketResult<()> {
        self.data
            .try_reserve_exact(target.saturating_sub(self.data.len()))
            .map_err(|e| {
                log::debug!("receive buffer of {} bytes refused: {}", target, e);
                SocketError::Buffer
            })?;
        self.capacity = target;
        Ok(())
    }

    /// The whole capacity as one writable slice, for single reads
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Already reserved, so this never reallocates
        self.data.resize(self.capacity, 0);
        &mut self.data
    }

    /// The first `len` bytes of the buffer
    pub fn filled(&self, len: usize) -> &[u8] {
        &self.data[..len]
    }

    /// Replace the contents with exactly `len` bytes from `reader`
    fn read_payload<R: Read>(&mut self, reader: &mut R, len: usize) -> SocketResult<()> {
        self.data.clear();
        match reader.take(len as u64).read_to_end(&mut self.data) {
            Ok(_) if self.data.len() == len => Ok(()),
            Ok(_) => Err(SocketError::Closed),
            Err(e) => {
                log::debug!("frame read failed: {}", e);
                Err(SocketError::Receive)
            }
        }
    }
}

/// Read whatever the stream has, up to the buffer capacity.
///
/// Returns the number of bytes read, never zero.
pub(crate) fn read_chunk<R: Read>(
    reader: &mut R,
    buffer: &mut RecvBuffer,
) -> SocketResult<usize> {
    loop {
        match reader.read(buffer.as_mut_slice()) {
            Ok(0) => return Err(SocketError::Closed),
            Ok(len) => return Ok(len),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("stream read failed: {}", e);
                return Err(SocketError::Receive);
            }
        }
    }
}

/// Read one frame (header, then payload) into the buffer.
///
/// Returns the payload length. The payload is at the start of the buffer.
pub(crate) fn read_frame<R: Read>(
    reader: &mut R,
    buffer: &mut RecvBuffer,
) -> SocketResult<usize> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    fill(reader, &mut header)?;

    let len = decode_frame_header(header);
    buffer.reserve_message(len)?;
    buffer.read_payload(reader, len)?;

    Ok(len)
}

fn fill<R: Read>(reader: &mut R, buf: &mut [u8]) -> SocketResult<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(SocketError::Closed),
            Ok(len) => filled += len,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                log::debug!("frame header read failed: {}", e);
                return Err(SocketError::Receive);
            }
        }
    }
    Ok(())
}

/// Write one message to a stream, with a frame header when framed
pub(crate) fn write_message<W: Write>(
    writer: &mut W,
    discipline: Discipline,
    payload: &[u8],
) -> SocketResult<()> {
    if discipline == Discipline::FramedStream {
        let header = encode_frame_header(payload.len())?;
        writer.write_all(&header).map_err(closed)?;
    }
    writer.write_all(payload).map_err(closed)?;
    writer.flush().map_err(closed)
}

fn closed(e: std::io::Error) -> SocketError {
    log::debug!("stream write failed: {}", e);
    SocketError::Closed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that hands out at most `step` bytes per call
    struct Trickle {
        data: Vec<u8>,
        pos: usize,
        step: usize,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            let end = (self.pos + self.step).min(self.data.len());
            let len = (end - self.pos).min(buf.len());
            buf[..len].copy_from_slice(&self.data[self.pos..self.pos + len]);
            self.pos += len;
            Ok(len)
        }
    }

    fn framed(payload: &[u8]) -> Vec<u8> {
        let mut wire = Vec::new();
        write_message(&mut wire, Discipline::FramedStream, payload).unwrap();
        wire
    }

    #[test]
    fn test_frame_header_is_big_endian() {
        assert_eq!(encode_frame_header(0x0102_0304).unwrap(), [1, 2, 3, 4]);
        assert_eq!(decode_frame_header([0, 0, 1, 0]), 256);
    }

    #[test]
    fn test_raw_write_has_no_header() {
        let mut wire = Vec::new();
        write_message(&mut wire, Discipline::RawStream, b"power on").unwrap();
        assert_eq!(wire, b"power on");
    }

    #[test]
    fn test_framed_write_prefixes_length() {
        let wire = framed(b"hello");
        assert_eq!(&wire[..4], &[0, 0, 0, 5]);
        assert_eq!(&wire[4..], b"hello");
    }

    #[test]
    fn test_read_frame_grows_buffer_to_twice_length() {
        let payload = vec![7u8; 4097];
        let mut reader = Cursor::new(framed(&payload));
        let mut buffer = RecvBuffer::new();

        let len = read_frame(&mut reader, &mut buffer).unwrap();

        assert_eq!(len, 4097);
        assert_eq!(buffer.capacity(), 8194);
        assert_eq!(buffer.filled(len), payload.as_slice());
    }

    #[test]
    fn test_read_frame_keeps_capacity_for_small_messages() {
        let mut wire = framed(&vec![1u8; 10_000]);
        wire.extend(framed(b"tiny"));
        let mut reader = Cursor::new(wire);
        let mut buffer = RecvBuffer::new();

        read_frame(&mut reader, &mut buffer).unwrap();
        let grown = buffer.capacity();
        let len = read_frame(&mut reader, &mut buffer).unwrap();

        assert_eq!(buffer.filled(len), b"tiny");
        assert_eq!(buffer.capacity(), grown);
    }

    #[test]
    fn test_read_frame_reassembles_split_reads() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let mut reader = Trickle {
            data: framed(&payload),
            pos: 0,
            step: 3,
        };
        let mut buffer = RecvBuffer::new();

        let len = read_frame(&mut reader, &mut buffer).unwrap();
        assert_eq!(buffer.filled(len), payload.as_slice());
    }

    #[test]
    fn test_read_frame_empty_payload() {
        let mut reader = Cursor::new(framed(b""));
        let mut buffer = RecvBuffer::new();
        assert_eq!(read_frame(&mut reader, &mut buffer).unwrap(), 0);
        assert_eq!(buffer.capacity(), INITIAL_BUFFER_SIZE);
    }

    #[test]
    fn test_read_frame_close_mid_header() {
        let mut reader = Cursor::new(vec![0u8, 0]);
        let mut buffer = RecvBuffer::new();
        assert_eq!(read_frame(&mut reader, &mut buffer), Err(SocketError::Closed));
    }

    #[test]
    fn test_read_frame_close_mid_payload() {
        let mut wire = framed(b"truncated");
        wire.truncate(8);
        let mut reader = Cursor::new(wire);
        let mut buffer = RecvBuffer::new();
        assert_eq!(read_frame(&mut reader, &mut buffer), Err(SocketError::Closed));
    }

    #[test]
    fn test_read_chunk_returns_bytes_read() {
        let mut reader = Cursor::new(b"abc".to_vec());
        let mut buffer = RecvBuffer::new();
        let len = read_chunk(&mut reader, &mut buffer).unwrap();
        assert_eq!(buffer.filled(len), b"abc");
        assert_eq!(read_chunk(&mut reader, &mut buffer), Err(SocketError::Closed));
    }

    #[test]
    fn test_buffer_never_shrinks() {
        let mut buffer = RecvBuffer::with_capacity(100);
        buffer.ensure_capacity(50).unwrap();
        buffer.reserve_message(80).unwrap();
        assert_eq!(buffer.capacity(), 100);

        buffer.ensure_capacity(DATAGRAM_BUFFER_SIZE).unwrap();
        assert_eq!(buffer.capacity(), DATAGRAM_BUFFER_SIZE);
    }

    #[test]
    fn test_huge_header_reserves_without_committing() {
        let mut reader = Cursor::new(encode_frame_header(512 << 20).unwrap().to_vec());
        let mut buffer = RecvBuffer::new();

        let result = read_frame(&mut reader, &mut buffer);

        assert!(
            matches!(result, Err(SocketError::Closed) | Err(SocketError::Buffer)),
            "{:?}",
            result
        );
        assert!(buffer.data.is_empty());
    }

    #[test]
    fn test_unreservable_capacity_is_buffer_error() {
        let mut buffer = RecvBuffer::new();
        assert_eq!(buffer.reserve_message(usize::MAX), Err(SocketError::Buffer));
        assert_eq!(
            buffer.ensure_capacity(isize::MAX as usize + 1),
            Err(SocketError::Buffer)
        );
        assert_eq!(buffer.capacity(), INITIAL_BUFFER_SIZE);
    }

    #[test]
    fn test_datagram_size_limit() {
        assert!(check_datagram_len(MAX_DATAGRAM_SIZE).is_ok());
        assert_eq!(
            check_datagram_len(MAX_DATAGRAM_SIZE + 1),
            Err(SocketError::Send)
        );
    }
}
