//! Length-prefixed packet framing.
//!
//! Every packet starts with a little-endian size header whose value counts
//! the header itself, so a 2-byte header followed by a 10-byte body reads
//! `0x0c 0x00`. [`PacketSession`] adapts a [`PacketHandler`] that wants whole
//! packets into the byte-oriented [`SessionHandler`] interface, and
//! [`encode_frame`] and [`encode_frame_with`] write framed packets into send
//! regions.

use crate::{
    send_arena::{ArenaError, SendAllocator, SendRegion},
    DisconnectReason, Session, SessionHandler,
};
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;
use tracing::warn;

/// The width of the size header in front of every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HeaderWidth {
    U16,
    U32,
}

impl HeaderWidth {
    pub const fn len(self) -> usize {
        match self {
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// The largest frame, header included, the header can describe.
    pub const fn max_frame(self) -> usize {
        match self {
            Self::U16 => u16::MAX as usize,
            Self::U32 => u32::MAX as usize,
        }
    }

    /// Reads a size header. `buf` must hold at least [`len`](Self::len)
    /// bytes.
    fn read(self, buf: &[u8]) -> usize {
        match self {
            Self::U16 => u16::from_le_bytes([buf[0], buf[1]]) as usize,
            Self::U32 => u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize,
        }
    }

    /// Writes a size header. `size` must not exceed
    /// [`max_frame`](Self::max_frame).
    fn write(self, buf: &mut [u8], size: usize) {
        match self {
            Self::U16 => buf[..2].copy_from_slice(&(size as u16).to_le_bytes()),
            Self::U32 => buf[..4].copy_from_slice(&(size as u32).to_le_bytes()),
        }
    }
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame size {size} is smaller than its own {header} byte header")]
    HeaderTooSmall { size: usize, header: usize },
    #[error("Frame size {size} exceeds the limit of {max}")]
    TooLarge { size: usize, max: usize },
}

#[derive(Debug, ThisError, Clone, Copy, PartialEq, Eq)]
pub enum EncodeError {
    #[error("{0}")]
    Frame(#[from] FrameError),
    #[error("{0}")]
    Arena(#[from] ArenaError),
}

/// Returns the length of the first whole frame at the start of `buf`, or
/// `None` if more bytes are needed to complete it.
pub fn next_frame(
    buf: &[u8],
    width: HeaderWidth,
    max_frame: usize,
) -> Result<Option<usize>, FrameError> {
    let header = width.len();
    if buf.len() < header {
        return Ok(None);
    }
    let size = width.read(buf);
    if size < header {
        return Err(FrameError::HeaderTooSmall { size, header });
    }
    if size > max_frame {
        return Err(FrameError::TooLarge {
            size,
            max: max_frame,
        });
    }
    if buf.len() < size {
        return Ok(None);
    }
    Ok(Some(size))
}

/// Writes a frame by reserving room for `max_body` bytes of body, letting
/// `write_body` serialize into it and committing only what it reports it
/// wrote.
pub fn encode_frame_with<F>(
    allocator: &mut SendAllocator,
    width: HeaderWidth,
    max_body: usize,
    write_body: F,
) -> Result<SendRegion, EncodeError>
where
    F: FnOnce(&mut [u8]) -> usize,
{
    let header = width.len();
    let reserved = header + max_body;
    if reserved > width.max_frame() {
        return Err(FrameError::TooLarge {
            size: reserved,
            max: width.max_frame(),
        }
        .into());
    }
    let buf = allocator.open(reserved)?;
    let body = write_body(&mut buf[header..]);
    // over-reporting is caught by the commit below
    let size = header + body;
    if size <= reserved {
        width.write(buf, size);
    }
    Ok(allocator.close(size)?)
}

/// Writes `body` behind a size header.
pub fn encode_frame(
    allocator: &mut SendAllocator,
    width: HeaderWidth,
    body: &[u8],
) -> Result<SendRegion, EncodeError> {
    encode_frame_with(allocator, width, body.len(), |buf| {
        buf.copy_from_slice(body);
        body.len()
    })
}

/// The application half of a session that exchanges framed packets.
pub trait PacketHandler: Send + Sync + 'static {
    fn on_connected(&self, _session: &Session) {}

    /// Called once per whole packet, in arrival order, with the header
    /// stripped.
    fn on_packet(&self, session: &Session, packet: &[u8]);

    fn on_send(&self, _session: &Session, _bytes: usize) {}

    fn on_disconnected(&self, _session: &Session, _reason: &DisconnectReason) {}
}

/// Splits the received byte stream into packets for a [`PacketHandler`].
///
/// Consumes exactly the bytes of whole packets; a trailing partial packet
/// stays in the receive window until the rest arrives. A size header smaller
/// than the header or larger than the frame limit tears the session down with
/// [`DisconnectReason::MalformedFrame`].
pub struct PacketSession<H> {
    handler: H,
    width: HeaderWidth,
    max_frame: usize,
}

impl<H: PacketHandler> PacketSession<H> {
    pub fn new(handler: H, width: HeaderWidth) -> Self {
        Self {
            handler,
            width,
            max_frame: width.max_frame(),
        }
    }

    /// Limits the accepted frame size. Frames larger than the session's
    /// receive window can never complete, so this should not exceed it.
    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame.min(self.width.max_frame());
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }
}

impl<H: PacketHandler> SessionHandler for PacketSession<H> {
    fn on_connected(&self, session: &Session) {
        self.handler.on_connected(session)
    }

    fn on_receive(&self, session: &Session, data: &[u8]) -> usize {
        let header = self.width.len();
        let mut consumed = 0;
        loop {
            match next_frame(&data[consumed..], self.width, self.max_frame) {
                Ok(Some(size)) => {
                    let frame = &data[consumed..consumed + size];
                    self.handler.on_packet(session, &frame[header..]);
                    consumed += size;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(session = %session.id(), error = %e, "Dropping session");
                    session.disconnect_with(DisconnectReason::MalformedFrame);
                    break;
                }
            }
        }
        consumed
    }

    fn on_send(&self, session: &Session, bytes: usize) {
        self.handler.on_send(session, bytes)
    }

    fn on_disconnected(&self, session: &Session, reason: &DisconnectReason) {
        self.handler.on_disconnected(session, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::SessionConfig,
        recv_window::RecvWindow,
        session::ReceiveStep,
        SessionId,
    };
    use rand::{rngs::SmallRng, Rng, SeedableRng};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct Packets(Mutex<Vec<Vec<u8>>>);

    struct Collect(Arc<Packets>);

    impl PacketHandler for Collect {
        fn on_packet(&self, _session: &Session, packet: &[u8]) {
            self.0 .0.lock().unwrap().push(packet.to_vec());
        }
    }

    fn packet_session(
        width: HeaderWidth,
        max_frame: usize,
        packets: &Arc<Packets>,
    ) -> Arc<Session> {
        Session::new(
            SessionId::new(7),
            "127.0.0.1:4000".parse().unwrap(),
            SessionConfig::default(),
            Box::new(PacketSession::new(Collect(packets.clone()), width).with_max_frame(max_frame)),
        )
    }

    /// Feeds `chunk` through the window the way the reader task does, in as
    /// many reads as the free tail requires.
    fn receive(session: &Session, window: &mut RecvWindow, mut chunk: &[u8]) {
        while !chunk.is_empty() {
            window.compact();
            let n = chunk.len().min(window.free_size());
            assert!(n > 0, "window full without progress");
            window.writable()[..n].copy_from_slice(&chunk[..n]);
            assert_eq!(session.receive_step(window, Ok(n)), ReceiveStep::Rearm);
            chunk = &chunk[n..];
        }
    }

    fn frame(width: HeaderWidth, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0; width.len()];
        width.write(&mut out, width.len() + body.len());
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn next_frame_cases() {
        let w = HeaderWidth::U16;
        assert_eq!(next_frame(&[], w, 100), Ok(None));
        assert_eq!(next_frame(&[5], w, 100), Ok(None));
        assert_eq!(next_frame(&[5, 0, 1, 2], w, 100), Ok(None));
        assert_eq!(next_frame(&[5, 0, 1, 2, 3, 9], w, 100), Ok(Some(5)));
        assert_eq!(
            next_frame(&[1, 0], w, 100),
            Err(FrameError::HeaderTooSmall { size: 1, header: 2 })
        );
        assert_eq!(
            next_frame(&[101, 0], w, 100),
            Err(FrameError::TooLarge { size: 101, max: 100 })
        );
        assert_eq!(
            next_frame(&[6, 0, 0, 0, 1, 2], HeaderWidth::U32, 100),
            Ok(Some(6))
        );
    }

    #[test]
    fn fragmented_then_coalesced_delivery() {
        // a 12 byte frame followed by 7 bytes of the next one, read into a
        // 16 byte window as 10 bytes and then 9
        let packets = Arc::new(Packets::default());
        let session = packet_session(HeaderWidth::U16, 16, &packets);
        let mut window = RecvWindow::new(16);
        let mut stream = frame(HeaderWidth::U16, b"0123456789");
        stream.extend_from_slice(&frame(HeaderWidth::U16, b"abcdefghij")[..7]);
        assert_eq!(stream.len(), 19);

        receive(&session, &mut window, &stream[..10]);
        assert!(packets.0.lock().unwrap().is_empty());
        assert_eq!(window.data_size(), 10);

        // only 6 of the 9 bytes fit until the first frame is consumed
        assert_eq!(window.free_size(), 6);
        receive(&session, &mut window, &stream[10..]);
        assert_eq!(
            packets.0.lock().unwrap().as_slice(),
            &[b"0123456789".to_vec()]
        );
        assert_eq!(window.data_size(), 7);
        assert_eq!(window.readable(), &stream[12..]);
    }

    #[test]
    fn split_points_do_not_change_the_packets() {
        let mut rng = SmallRng::seed_from_u64(0x5e55);
        let bodies: Vec<Vec<u8>> = (0..40)
            .map(|i| {
                let len = rng.gen_range(0..30);
                (0..len).map(|j| (i * 31 + j) as u8).collect()
            })
            .collect();
        let stream: Vec<u8> = bodies
            .iter()
            .flat_map(|body| frame(HeaderWidth::U32, body))
            .collect();

        for _ in 0..50 {
            let packets = Arc::new(Packets::default());
            let session = packet_session(HeaderWidth::U32, 64, &packets);
            let mut window = RecvWindow::new(64);
            let mut rest = &stream[..];
            while !rest.is_empty() {
                let n = rng.gen_range(1..=rest.len().min(50));
                receive(&session, &mut window, &rest[..n]);
                rest = &rest[n..];
            }
            assert_eq!(*packets.0.lock().unwrap(), bodies);
            assert_eq!(window.data_size(), 0);
            assert!(!session.is_disconnected());
        }
    }

    #[test]
    fn malformed_header_disconnects() {
        let packets = Arc::new(Packets::default());
        let session = packet_session(HeaderWidth::U16, 32, &packets);
        let mut window = RecvWindow::new(32);
        let mut stream = frame(HeaderWidth::U16, b"ok");
        stream.extend_from_slice(&[0, 0, 9, 9]);
        window.writable()[..stream.len()].copy_from_slice(&stream);
        assert_eq!(
            session.receive_step(&mut window, Ok(stream.len())),
            ReceiveStep::Rearm
        );
        // the whole frame before the bad header was still delivered
        assert_eq!(packets.0.lock().unwrap().as_slice(), &[b"ok".to_vec()]);
        assert!(session.is_disconnected());
    }

    #[test]
    fn encodes_into_the_allocator() {
        let mut allocator = SendAllocator::with_capacity(64);
        let first = encode_frame(&mut allocator, HeaderWidth::U16, b"ping").unwrap();
        assert_eq!(&first[..], &[6, 0, b'p', b'i', b'n', b'g']);

        let second = encode_frame_with(&mut allocator, HeaderWidth::U32, 32, |buf| {
            buf[..3].copy_from_slice(b"abc");
            3
        })
        .unwrap();
        assert_eq!(&second[..], &[7, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(second.offset(), first.len());
        assert_eq!(allocator.arena().unwrap().used_size(), 13);
    }

    #[test]
    fn encode_rejects_over_reporting_and_oversize() {
        let mut allocator = SendAllocator::with_capacity(64);
        assert_eq!(
            encode_frame_with(&mut allocator, HeaderWidth::U16, 4, |_| 5).unwrap_err(),
            EncodeError::Arena(ArenaError::CommitExceedsReservation {
                used: 7,
                reserved: 6
            })
        );
        assert_eq!(
            encode_frame(&mut allocator, HeaderWidth::U16, &[0; 80]).unwrap_err(),
            EncodeError::Arena(ArenaError::TooLarge {
                requested: 82,
                capacity: 64
            })
        );
        assert!(matches!(
            encode_frame_with(&mut allocator, HeaderWidth::U16, 70_000, |_| 0),
            Err(EncodeError::Frame(FrameError::TooLarge { .. }))
        ));
    }
}
