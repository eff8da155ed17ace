use super::port::{Peer, Wire};
use crate::{flash::PAGE_SIZE, hash::Digest};
use sha2::{Digest as _, Sha256};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tracing::{debug, warn};

/// The remote end of a download: sends the size, the digest and the first
/// page as soon as the link is up, then one more page for every ack.
pub struct SimSender {
    image: Vec<u8>,
    size: u32,
    digest: Digest,
    ack_byte: u8,
    sent: usize,
    wire: Option<Wire>,
    acks: Arc<AtomicUsize>,
}

impl SimSender {
    #[must_use]
    pub fn new(image: Vec<u8>) -> Self {
        let digest = Sha256::digest(&image).into();
        Self {
            size: image.len() as u32,
            image,
            digest,
            ack_byte: 0xFF,
            sent: 0,
            wire: None,
            acks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Announces `digest` instead of the image's real digest.
    #[must_use]
    pub fn with_digest(self, digest: Digest) -> Self {
        Self { digest, ..self }
    }

    /// Announces `size` instead of the image's real length.
    #[must_use]
    pub fn with_size(self, size: u32) -> Self {
        Self { size, ..self }
    }

    #[must_use]
    pub fn with_ack_byte(self, ack_byte: u8) -> Self {
        Self { ack_byte, ..self }
    }

    #[must_use]
    pub fn digest(&self) -> Digest {
        self.digest
    }

    /// Count of acks received so far.
    #[must_use]
    pub fn acks(&self) -> Arc<AtomicUsize> {
        self.acks.clone()
    }

    fn send_page(&mut self) {
        let Some(wire) = self.wire.as_ref() else {
            return;
        };
        let end = (self.sent + PAGE_SIZE).min(self.image.len());
        wire.send(&self.image[self.sent..end]);
        self.sent = end;
    }
}

impl Peer for SimSender {
    fn connected(&mut self, wire: Wire) {
        wire.send(&self.size.to_le_bytes());
        wire.send(&self.digest);
        self.wire = Some(wire);
        self.send_page();
    }

    fn on_byte(&mut self, byte: u8) {
        if byte != self.ack_byte {
            warn!(byte, "sender got something other than an ack");
            return;
        }
        let acks = self.acks.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(acks, sent = self.sent, "sender got ack");
        self.send_page();
    }
}
