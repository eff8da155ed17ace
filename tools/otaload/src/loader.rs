//! The sending half of the download protocol.
//!
//! The image goes out as a little-endian `u32` length, its SHA-256 digest,
//! and then the payload one flash page at a time. The target answers every
//! page, including a short final one, with a single ack byte once the page is
//! in flash.

use sha2::{Digest, Sha256};
use std::{
    fmt,
    io::{self, Read, Write},
    time::{Duration, Instant},
};
use tracing::{debug, info, trace};

#[derive(Debug, Clone, clap::Args)]
pub struct Settings {
    /// bytes the target writes between acks
    #[arg(long, default_value_t = Settings::DEFAULT_PAGE_SIZE)]
    pub page_size: usize,

    /// the byte the target acknowledges each page with
    #[arg(long, default_value_t = Settings::DEFAULT_ACK_BYTE)]
    pub ack_byte: u8,

    /// how long to wait for each ack, in milliseconds
    #[arg(long, default_value_t = Settings::DEFAULT_ACK_TIMEOUT_MS)]
    pub ack_timeout_ms: u64,
}

impl Settings {
    pub const DEFAULT_PAGE_SIZE: usize = 8192;
    pub const DEFAULT_ACK_BYTE: u8 = 0xFF;
    pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 10_000;

    fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            page_size: Self::DEFAULT_PAGE_SIZE,
            ack_byte: Self::DEFAULT_ACK_BYTE,
            ack_timeout_ms: Self::DEFAULT_ACK_TIMEOUT_MS,
        }
    }
}

#[derive(Debug)]
pub enum LoadError {
    /// The image does not fit the `u32` length prefix.
    TooLarge(usize),
    /// Nothing to send.
    Empty,
    Io(io::Error),
    /// The target sent something other than the ack byte.
    BadAck { page: usize, byte: u8 },
    /// No ack arrived in time.
    AckTimeout { page: usize },
    /// The target closed the link.
    Closed { page: usize },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TooLarge(len) => write!(f, "image of {len} bytes is too large"),
            Self::Empty => f.write_str("image is empty"),
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::BadAck { page, byte } => {
                write!(f, "page {page}: expected an ack, got {byte:#04x}")
            }
            Self::AckTimeout { page } => write!(f, "page {page}: timed out waiting for an ack"),
            Self::Closed { page } => write!(f, "page {page}: target closed the connection"),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<io::Error> for LoadError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Streams `image` to the target, returning its digest once every page has
/// been acknowledged.
pub fn send_image<C>(conn: &mut C, image: &[u8], settings: &Settings) -> Result<[u8; 32], LoadError>
where
    C: Read + Write,
{
    if image.is_empty() {
        return Err(LoadError::Empty);
    }
    let len = u32::try_from(image.len()).map_err(|_| LoadError::TooLarge(image.len()))?;
    let digest: [u8; 32] = Sha256::digest(image).into();

    conn.write_all(&len.to_le_bytes())?;
    conn.write_all(&digest)?;
    info!(len, pages = image.len().div_ceil(settings.page_size), "sending image");

    for (page, chunk) in image.chunks(settings.page_size.max(1)).enumerate() {
        conn.write_all(chunk)?;
        conn.flush()?;
        trace!(page, len = chunk.len(), "page sent");
        wait_for_ack(conn, page, settings)?;
        debug!(page, "page acked");
    }

    Ok(digest)
}

fn wait_for_ack<C: Read>(conn: &mut C, page: usize, settings: &Settings) -> Result<(), LoadError> {
    let deadline = Instant::now() + settings.ack_timeout();
    let mut byte = [0u8; 1];
    loop {
        match conn.read(&mut byte) {
            Ok(0) => return Err(LoadError::Closed { page }),
            Ok(_) if byte[0] == settings.ack_byte => return Ok(()),
            Ok(_) => {
                return Err(LoadError::BadAck {
                    page,
                    byte: byte[0],
                })
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => return Err(e.into()),
        }
        if Instant::now() >= deadline {
            return Err(LoadError::AckTimeout { page });
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Acks every `page` bytes it receives past the 36 byte preamble.
    struct FakeTarget {
        page: usize,
        rx: Vec<u8>,
        acks: usize,
        ack_byte: u8,
        mute: bool,
    }

    impl FakeTarget {
        fn new(page: usize) -> Self {
            Self {
                page,
                rx: Vec::new(),
                acks: 0,
                ack_byte: 0xFF,
                mute: false,
            }
        }

        fn owed(&self) -> usize {
            let payload = self.rx.len().saturating_sub(36);
            let len = self
                .rx
                .get(..4)
                .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
                .unwrap_or(0);
            let done = if payload >= len {
                len.div_ceil(self.page)
            } else {
                payload / self.page
            };
            done - self.acks
        }
    }

    impl Write for FakeTarget {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.rx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for FakeTarget {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.mute || self.owed() == 0 {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.acks += 1;
            buf[0] = self.ack_byte;
            Ok(1)
        }
    }

    fn settings() -> Settings {
        Settings {
            page_size: 16,
            ack_timeout_ms: 50,
            ..Settings::default()
        }
    }

    #[test]
    fn sends_preamble_then_pages() {
        let image: Vec<u8> = (0..40u8).collect();
        let mut target = FakeTarget::new(16);
        let digest = send_image(&mut target, &image, &settings()).unwrap();

        assert_eq!(&target.rx[..4], &40u32.to_le_bytes());
        assert_eq!(&target.rx[4..36], &digest);
        assert_eq!(&target.rx[36..], &image[..]);
        assert_eq!(target.acks, 3, "two full pages and a partial one");
        assert_eq!(digest, <[u8; 32]>::from(Sha256::digest(&image)));
    }

    #[test]
    fn wrong_ack_byte_is_an_error() {
        let mut target = FakeTarget::new(16);
        target.ack_byte = 0x00;
        let err = send_image(&mut target, &[1; 20], &settings()).unwrap_err();
        assert!(matches!(err, LoadError::BadAck { page: 0, byte: 0 }));
    }

    #[test]
    fn silent_target_times_out() {
        let mut target = FakeTarget::new(16);
        target.mute = true;
        let err = send_image(&mut target, &[1; 20], &settings()).unwrap_err();
        assert!(matches!(err, LoadError::AckTimeout { page: 0 }));
    }

    #[test]
    fn empty_image_is_refused() {
        let mut target = FakeTarget::new(16);
        assert!(matches!(
            send_image(&mut target, &[], &settings()),
            Err(LoadError::Empty)
        ));
        assert!(target.rx.is_empty());
    }
}
