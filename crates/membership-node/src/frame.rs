//! Length-prefixed framing over non-blocking sockets.
//!
//! Every frame is `[magic: u32 BE][length: u32 BE][length bytes]`. Reading and
//! writing are two independent state machines so that a connection can flush
//! a frame while the next one is arriving. Both only ever call `try_read` /
//! `try_write`; the selector re-arms readiness when they report `Pending`.

use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes};
use std::io;
use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;

/// Magic preceding every frame ("ANUB").
pub const FRAME_MAGIC: u32 = 0x414E_5542;

pub const HEADER_LEN: usize = 8;

pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frames handed out by a single `read_from` call before yielding to other
/// connections.
const MAX_FRAMES_PER_READ: usize = 64;

/// Non-blocking byte I/O. `WouldBlock` means "try again after readiness".
pub trait NonBlockingIo {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize>;
    fn try_write(&self, buf: &[u8]) -> io::Result<usize>;
}

impl NonBlockingIo for TcpStream {
    fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::try_read(self, buf)
    }

    fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpStream::try_write(self, buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Initial,
    Header,
    Message,
    Error,
    Close,
}

/// What the caller should do after driving a state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing more can be done until the socket is ready again
    Pending,
    /// The write in flight is fully flushed, or there was nothing to write
    Idle,
    /// The peer closed its end
    Closed,
}

fn encode_header(len: usize) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    let mut cursor = &mut header[..];
    cursor.put_u32(FRAME_MAGIC);
    cursor.put_u32(len as u32);
    header
}

/// Read side: `Initial → Header → Message → Initial`, ending in `Error` or `Close`.
#[derive(Debug)]
pub struct FrameReader {
    state: FrameState,
    header: [u8; HEADER_LEN],
    header_filled: usize,
    body: Vec<u8>,
    body_filled: usize,
    max_frame_size: usize,
}

impl FrameReader {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: FrameState::Initial,
            header: [0; HEADER_LEN],
            header_filled: 0,
            body: Vec::new(),
            body_filled: 0,
            max_frame_size,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Read as much as the socket offers, appending complete payloads to `frames`.
    ///
    /// Any error leaves the reader in `Error`; the connection must be closed.
    pub fn read_from(
        &mut self,
        io: &impl NonBlockingIo,
        frames: &mut Vec<Bytes>,
    ) -> Result<Progress, TransportError> {
        let result = self.advance(io, frames);
        if result.is_err() {
            self.state = FrameState::Error;
            self.body = Vec::new();
        }
        result
    }

    /// Stop reading; later calls report `Closed`.
    pub fn close(&mut self) {
        if self.state != FrameState::Error {
            self.state = FrameState::Close;
        }
        self.body = Vec::new();
    }

    fn advance(
        &mut self,
        io: &impl NonBlockingIo,
        frames: &mut Vec<Bytes>,
    ) -> Result<Progress, TransportError> {
        let mut delivered = 0;
        loop {
            match self.state {
                FrameState::Error => return Err(TransportError::Closed),
                FrameState::Close => return Ok(Progress::Closed),
                FrameState::Initial => {
                    if delivered >= MAX_FRAMES_PER_READ {
                        return Ok(Progress::Pending);
                    }
                    self.header_filled = 0;
                    self.state = FrameState::Header;
                }
                FrameState::Header => {
                    let Some(n) = fill(io, &mut self.header[self.header_filled..])? else {
                        return Ok(Progress::Pending);
                    };
                    if n == 0 {
                        self.state = FrameState::Close;
                        return Ok(Progress::Closed);
                    }
                    self.header_filled += n;
                    if self.header_filled == HEADER_LEN {
                        self.start_message()?;
                    }
                }
                FrameState::Message => {
                    if self.body_filled == self.body.len() {
                        let body = std::mem::take(&mut self.body);
                        frames.push(Bytes::from(body));
                        delivered += 1;
                        self.state = FrameState::Initial;
                        continue;
                    }
                    let Some(n) = fill(io, &mut self.body[self.body_filled..])? else {
                        return Ok(Progress::Pending);
                    };
                    if n == 0 {
                        self.state = FrameState::Close;
                        return Ok(Progress::Closed);
                    }
                    self.body_filled += n;
                }
            }
        }
    }

    fn start_message(&mut self) -> Result<(), TransportError> {
        let mut header = &self.header[..];
        let magic = header.get_u32();
        if magic != FRAME_MAGIC {
            return Err(TransportError::BadMagic(magic));
        }
        let len = header.get_u32() as usize;
        if len > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_size,
            });
        }
        self.body = vec![0; len];
        self.body_filled = 0;
        self.state = FrameState::Message;
        Ok(())
    }
}

/// Write side. Holds the connection's write permit while a frame is in flight.
#[derive(Debug)]
pub struct FrameWriter {
    state: FrameState,
    header: [u8; HEADER_LEN],
    header_written: usize,
    body: Bytes,
    permit: Option<OwnedSemaphorePermit>,
    max_frame_size: usize,
}

impl FrameWriter {
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            state: FrameState::Initial,
            header: [0; HEADER_LEN],
            header_written: 0,
            body: Bytes::new(),
            permit: None,
            max_frame_size,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == FrameState::Initial
    }

    /// Queue `payload` as the frame in flight. `permit` is released once the
    /// whole frame has been written, or when the writer is closed.
    pub fn begin(
        &mut self,
        payload: Bytes,
        permit: OwnedSemaphorePermit,
    ) -> Result<(), TransportError> {
        match self.state {
            FrameState::Initial => {}
            FrameState::Header | FrameState::Message => {
                panic!("FrameWriter::begin while a frame is in flight")
            }
            FrameState::Error | FrameState::Close => return Err(TransportError::Closed),
        }
        if payload.len() > self.max_frame_size {
            return Err(TransportError::FrameTooLarge {
                len: payload.len(),
                max: self.max_frame_size,
            });
        }
        self.header = encode_header(payload.len());
        self.header_written = 0;
        self.body = payload;
        self.permit = Some(permit);
        self.state = FrameState::Header;
        Ok(())
    }

    /// Flush as much of the frame in flight as the socket accepts.
    pub fn write_to(&mut self, io: &impl NonBlockingIo) -> Result<Progress, TransportError> {
        let result = self.advance(io);
        if result.is_err() {
            self.state = FrameState::Error;
            self.release();
        }
        result
    }

    pub fn close(&mut self) {
        if self.state != FrameState::Error {
            self.state = FrameState::Close;
        }
        self.release();
    }

    fn release(&mut self) {
        self.body = Bytes::new();
        self.permit = None;
    }

    fn advance(&mut self, io: &impl NonBlockingIo) -> Result<Progress, TransportError> {
        loop {
            match self.state {
                FrameState::Initial => return Ok(Progress::Idle),
                FrameState::Error => return Err(TransportError::Closed),
                FrameState::Close => return Ok(Progress::Closed),
                FrameState::Header => {
                    let Some(n) = drain(io, &self.header[self.header_written..])? else {
                        return Ok(Progress::Pending);
                    };
                    self.header_written += n;
                    if self.header_written == HEADER_LEN {
                        self.state = FrameState::Message;
                    }
                }
                FrameState::Message => {
                    if self.body.is_empty() {
                        self.state = FrameState::Initial;
                        self.release();
                        continue;
                    }
                    let Some(n) = drain(io, &self.body)? else {
                        return Ok(Progress::Pending);
                    };
                    self.body.advance(n);
                }
            }
        }
    }
}

/// One `try_read`; `None` on would-block.
fn fill(io: &impl NonBlockingIo, buf: &mut [u8]) -> Result<Option<usize>, TransportError> {
    loop {
        match io.try_read(buf) {
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// One `try_write`; `None` on would-block. A zero-length write means the
/// socket can no longer accept data.
fn drain(io: &impl NonBlockingIo, buf: &[u8]) -> Result<Option<usize>, TransportError> {
    loop {
        match io.try_write(buf) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
            Ok(n) => return Ok(Some(n)),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

/// Encode one complete frame. Used where the caller owns a blocking stream.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&encode_header(payload.len()));
    out.extend_from_slice(payload);
    Bytes::from(out)
}
