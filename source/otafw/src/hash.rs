//! Image digests
//!
//! The hash peripheral consumes 32-bit words in the opposite byte order to
//! the bytes in flash, so every chunk is passed through [`normalize_words`]
//! before being handed to a [`HashEngine`]. Engines undo that, and the
//! resulting digest is plain SHA-256 of the image bytes.

use crate::flash::{FlashController, FlashError, FlashManager};
use core::fmt;
use sha2::{Digest as _, Sha256};
use tracing::trace;

pub const DIGEST_LEN: usize = 32;

pub type Digest = [u8; DIGEST_LEN];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashError {
    /// `accumulate` was called with a length that is not a whole number of
    /// words
    UnalignedChunk(usize),
    /// Data was fed before `start`
    NotStarted,
    /// The hash peripheral reported an error
    Hardware,
}

impl fmt::Display for HashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnalignedChunk(len) => {
                write!(f, "hash input of {len} bytes is not a whole number of words")
            }
            Self::NotStarted => f.write_str("hash engine was not started"),
            Self::Hardware => f.write_str("hash peripheral error"),
        }
    }
}

#[cfg(any(test, feature = "use-std"))]
impl std::error::Error for HashError {}

/// A streaming SHA-256 engine fed with word-normalized data.
pub trait HashEngine {
    /// Discards any previous state and begins a new digest.
    fn start(&mut self) -> Result<(), HashError>;

    /// Feeds a chunk. `data.len()` must be a multiple of 4.
    fn accumulate(&mut self, data: &[u8]) -> Result<(), HashError>;

    /// Feeds the final chunk, of any length, and returns the digest.
    fn finish(&mut self, last: &[u8]) -> Result<Digest, HashError>;
}

/// Reverses the byte order of every complete 32-bit word in `data`. Trailing
/// bytes that do not form a whole word are left alone.
pub fn normalize_words(data: &mut [u8]) {
    for word in data.chunks_exact_mut(4) {
        word.reverse();
    }
}

/// Software SHA-256.
#[derive(Clone, Default)]
pub struct Sha256Engine {
    state: Option<Sha256>,
}

impl Sha256Engine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn update(state: &mut Sha256, data: &[u8]) {
        let mut block = [0u8; 64];
        let mut words = data.chunks_exact(block.len());
        for chunk in words.by_ref() {
            block.copy_from_slice(chunk);
            normalize_words(&mut block);
            state.update(block);
        }
        let rest = words.remainder();
        let block = &mut block[..rest.len()];
        block.copy_from_slice(rest);
        normalize_words(block);
        state.update(block);
    }
}

impl fmt::Debug for Sha256Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sha256Engine")
            .field("started", &self.state.is_some())
            .finish()
    }
}

impl HashEngine for Sha256Engine {
    fn start(&mut self) -> Result<(), HashError> {
        self.state = Some(Sha256::new());
        Ok(())
    }

    fn accumulate(&mut self, data: &[u8]) -> Result<(), HashError> {
        if data.len() % 4 != 0 {
            return Err(HashError::UnalignedChunk(data.len()));
        }
        let state = self.state.as_mut().ok_or(HashError::NotStarted)?;
        Self::update(state, data);
        Ok(())
    }

    fn finish(&mut self, last: &[u8]) -> Result<Digest, HashError> {
        let mut state = self.state.take().ok_or(HashError::NotStarted)?;
        Self::update(&mut state, last);
        Ok(state.finalize().into())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestError {
    Flash(FlashError),
    Hash(HashError),
}

impl From<FlashError> for DigestError {
    fn from(e: FlashError) -> Self {
        Self::Flash(e)
    }
}

impl From<HashError> for DigestError {
    fn from(e: HashError) -> Self {
        Self::Hash(e)
    }
}

/// Computes the digest of `len` bytes of flash starting at `address`, reading
/// through `buf` one chunk at a time.
///
/// `buf` must be a non-empty whole number of words; it is normally the
/// page buffer.
pub fn flash_digest<F, H>(
    flash: &mut FlashManager<F>,
    hasher: &mut H,
    address: u32,
    len: usize,
    buf: &mut [u8],
) -> Result<Digest, DigestError>
where
    F: FlashController,
    H: HashEngine + ?Sized,
{
    let chunk = buf.len() - buf.len() % 4;
    if chunk == 0 {
        return Err(HashError::UnalignedChunk(buf.len()).into());
    }

    hasher.start()?;
    let mut at = address;
    let mut remaining = len;
    loop {
        let n = remaining.min(chunk);
        let data = &mut buf[..n];
        flash.read(at, data)?;
        normalize_words(data);
        if n == remaining {
            trace!(address, len, "digest complete");
            return Ok(hasher.finish(data)?);
        }
        hasher.accumulate(data)?;
        at += n as u32;
        remaining -= n;
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::flash::{Geometry, PAGE_SIZE};
    use crate::sim::SimFlash;

    const GEOM: Geometry = Geometry {
        base: 0x0800_0000,
        pages_per_bank: 4,
    };

    fn written(image: &[u8]) -> FlashManager<SimFlash> {
        let mut fm = FlashManager::new(SimFlash::new(GEOM), GEOM);
        for (page, chunk) in image.chunks(PAGE_SIZE).enumerate() {
            fm.erase_page(page as u32).unwrap();
            let mut padded = chunk.to_vec();
            padded.resize(chunk.len().next_multiple_of(16), 0xFF);
            fm.write_large(GEOM.page_address(page as u32).unwrap(), &padded)
                .unwrap();
        }
        fm
    }

    #[test]
    fn normalize_only_touches_whole_words() {
        let mut data = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10];
        normalize_words(&mut data);
        assert_eq!(data, [4, 3, 2, 1, 8, 7, 6, 5, 9, 10]);
    }

    #[test]
    fn engine_matches_plain_sha256() {
        let image: Vec<u8> = (0..1000u32).map(|i| (i * 7 + 3) as u8).collect();
        let mut normalized = image.clone();
        normalize_words(&mut normalized);

        let mut engine = Sha256Engine::new();
        engine.start().unwrap();
        engine.accumulate(&normalized[..512]).unwrap();
        let digest = engine.finish(&normalized[512..]).unwrap();

        let expected: Digest = Sha256::digest(&image).into();
        assert_eq!(digest, expected);
    }

    #[test]
    fn engine_rejects_misuse() {
        let mut engine = Sha256Engine::new();
        assert_eq!(engine.accumulate(&[0; 4]), Err(HashError::NotStarted));
        engine.start().unwrap();
        assert_eq!(engine.accumulate(&[0; 6]), Err(HashError::UnalignedChunk(6)));
        engine.finish(&[]).unwrap();
        assert_eq!(engine.finish(&[]), Err(HashError::NotStarted));
    }

    #[test]
    fn flash_digest_spans_pages() {
        let image: Vec<u8> = (0..2 * PAGE_SIZE + 1234).map(|i| (i % 251) as u8).collect();
        let mut fm = written(&image);
        let mut buf = vec![0u8; PAGE_SIZE];

        let digest =
            flash_digest(&mut fm, &mut Sha256Engine::new(), GEOM.base, image.len(), &mut buf)
                .unwrap();
        let expected: Digest = Sha256::digest(&image).into();
        assert_eq!(digest, expected);

        // Same bytes, same digest.
        let again =
            flash_digest(&mut fm, &mut Sha256Engine::new(), GEOM.base, image.len(), &mut buf)
                .unwrap();
        assert_eq!(digest, again);
    }

    #[test]
    fn flash_digest_of_nothing() {
        let mut fm = written(&[]);
        let mut buf = [0u8; 64];
        let digest = flash_digest(&mut fm, &mut Sha256Engine::new(), GEOM.base, 0, &mut buf).unwrap();
        let expected: Digest = Sha256::digest([]).into();
        assert_eq!(digest, expected);
    }
}
