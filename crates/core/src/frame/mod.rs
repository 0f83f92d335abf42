use std::{
    fmt,
    fs::File,
    io::{BufReader, ErrorKind, Read},
    net::{TcpStream, ToSocketAddrs},
    path::Path,
    thread,
    time::Duration,
};

use image::{GrayImage, ImageFormat, RgbImage};

use crate::{MotionAlarmError, Result, ShutdownToken};

const SOI: [u8; 2] = [0xFF, 0xD8];
const EOI: [u8; 2] = [0xFF, 0xD9];
const READ_CHUNK: usize = 16 * 1024;
/// Largest JPEG accepted from a stream before it is treated as corrupt.
pub const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;
/// Read timeout on stream sockets; bounds how long a stalled stream can
/// delay a shutdown request.
pub const STALL_POLL: Duration = Duration::from_millis(100);

/// A single color frame pulled from the camera stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    image: RgbImage,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self { image }
    }

    /// Builds a frame from packed RGB8 data. Returns `None` when the buffer
    /// length does not match the dimensions.
    pub fn from_raw(width: u32, height: u32, rgb: Vec<u8>) -> Option<Self> {
        RgbImage::from_raw(width, height, rgb).map(Self::new)
    }

    /// Frame filled with a single color.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self::new(RgbImage::from_pixel(width, height, image::Rgb(rgb)))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn to_gray(&self) -> GrayImage {
        image::imageops::grayscale(&self.image)
    }
}

/// Supplier of successive frames. `None` means the stream ended or hiccuped;
/// the frame loop treats it as the end of the run.
pub trait FrameSource {
    fn next_frame(&mut self) -> Option<Frame>;
}

/// Reads a motion-JPEG byte stream and decodes one frame per JPEG image.
///
/// Both multipart (`multipart/x-mixed-replace`) and raw concatenated streams
/// are accepted: anything outside an SOI..EOI pair is skipped. A pending
/// image that grows past the frame size limit is dropped and the reader
/// resynchronises on the next start marker.
pub struct MjpegSource<R> {
    reader: R,
    buffer: Vec<u8>,
    /// Offset where the next end-marker search starts, when `buffer` begins
    /// with a start marker.
    scanned: usize,
    max_frame_bytes: usize,
    exhausted: bool,
    shutdown: Option<ShutdownToken>,
}

impl MjpegSource<BufReader<TcpStream>> {
    /// Connects to a TCP endpoint serving an MJPEG stream.
    ///
    /// Reads time out every [`STALL_POLL`] so a stalled stream still notices
    /// cancellation through [`MjpegSource::with_shutdown`].
    pub fn connect(addr: impl ToSocketAddrs + fmt::Debug) -> Result<Self> {
        let stream = TcpStream::connect(&addr).map_err(|err| {
            MotionAlarmError::StreamUnavailable(format!("cannot connect to {addr:?}: {err}"))
        })?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(STALL_POLL))?;
        Ok(Self::new(BufReader::new(stream)))
    }
}

impl MjpegSource<BufReader<File>> {
    /// Opens a recorded MJPEG file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|err| {
            MotionAlarmError::StreamUnavailable(format!("cannot open {}: {err}", path.display()))
        })?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: Read> MjpegSource<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(READ_CHUNK),
            scanned: 0,
            max_frame_bytes: MAX_FRAME_BYTES,
            exhausted: false,
            shutdown: None,
        }
    }

    /// Makes a blocked fetch give up with `None` once `token` is cancelled.
    pub fn with_shutdown(mut self, token: ShutdownToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn with_max_frame_bytes(mut self, limit: usize) -> Self {
        self.max_frame_bytes = limit.max(SOI.len() + EOI.len());
        self
    }

    fn cancelled(&self) -> bool {
        self.shutdown
            .as_ref()
            .is_some_and(|token| token.is_cancelled())
    }

    fn next_jpeg(&mut self) -> Option<Vec<u8>> {
        loop {
            if let Some(jpeg) = self.take_jpeg() {
                return Some(jpeg);
            }

            if self.exhausted || self.cancelled() {
                return None;
            }

            let mut chunk = [0u8; READ_CHUNK];
            match self.reader.read(&mut chunk) {
                Ok(0) => self.exhausted = true,
                Ok(read) => self.buffer.extend_from_slice(&chunk[..read]),
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    tracing::trace!("mjpeg stream idle");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "mjpeg stream read failed");
                    self.exhausted = true;
                }
            }
        }
    }

    /// Cuts the next complete SOI..EOI image out of the buffer, if one is
    /// there. Only bytes appended since the previous call are scanned.
    fn take_jpeg(&mut self) -> Option<Vec<u8>> {
        loop {
            if !self.buffer.starts_with(&SOI) {
                self.scanned = 0;
                match find_marker(&self.buffer, 0, SOI) {
                    Some(start) => {
                        self.buffer.drain(..start);
                    }
                    None => {
                        self.keep_trailing_byte();
                        return None;
                    }
                }
            }

            let from = self.scanned.max(SOI.len());
            if let Some(eoi) = find_marker(&self.buffer, from, EOI) {
                self.scanned = 0;
                return Some(self.buffer.drain(..eoi + EOI.len()).collect());
            }

            if self.buffer.len() <= self.max_frame_bytes {
                // A marker split across reads starts at the last byte.
                self.scanned = self.buffer.len() - 1;
                return None;
            }

            tracing::warn!(
                buffered = self.buffer.len(),
                limit = self.max_frame_bytes,
                "mjpeg frame has no end marker within the size limit, resyncing"
            );
            self.scanned = 0;
            match find_marker(&self.buffer, SOI.len(), SOI) {
                Some(next) => {
                    self.buffer.drain(..next);
                }
                None => {
                    self.keep_trailing_byte();
                    return None;
                }
            }
        }
    }

    /// Without a start marker only the trailing byte can still begin one.
    fn keep_trailing_byte(&mut self) {
        let keep_from = self.buffer.len().saturating_sub(1);
        self.buffer.drain(..keep_from);
    }
}

impl<R: Read> FrameSource for MjpegSource<R> {
    fn next_frame(&mut self) -> Option<Frame> {
        loop {
            let jpeg = self.next_jpeg()?;
            match image::load_from_memory_with_format(&jpeg, ImageFormat::Jpeg) {
                Ok(decoded) => return Some(Frame::new(decoded.to_rgb8())),
                Err(err) => {
                    tracing::warn!(error = %err, bytes = jpeg.len(), "skipping undecodable frame");
                }
            }
        }
    }
}

impl<R> fmt::Debug for MjpegSource<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MjpegSource")
            .field("buffered", &self.buffer.len())
            .field("max_frame_bytes", &self.max_frame_bytes)
            .field("exhausted", &self.exhausted)
            .field("shutdown", &self.shutdown)
            .finish()
    }
}

/// Polls `source` until it yields a frame, at most `attempts` times.
///
/// Cameras often deliver empty frames while auto-exposure settles; this is the
/// only bounded retry in the controller.
pub fn warm_up<S: FrameSource + ?Sized>(
    source: &mut S,
    attempts: u32,
    delay: Duration,
) -> Result<Frame> {
    for attempt in 1..=attempts {
        if let Some(frame) = source.next_frame() {
            return Ok(frame);
        }
        tracing::warn!(attempt, attempts, "warm-up: empty frame from stream, retrying");
        if attempt < attempts && !delay.is_zero() {
            thread::sleep(delay);
        }
    }

    Err(MotionAlarmError::StreamUnavailable(format!(
        "no frames during warm-up after {attempts} attempts"
    )))
}

fn find_marker(buffer: &[u8], from: usize, marker: [u8; 2]) -> Option<usize> {
    buffer
        .get(from..)?
        .windows(2)
        .position(|window| window == marker)
        .map(|offset| offset + from)
}
