use super::{DownloadState, OtaError, State, Upgrader};
use crate::{
    flash::{FlashController, ERASED, PAGE_SIZE, QUAD_WORD},
    hash::{self, Digest, HashEngine, DIGEST_LEN},
    module::{self, LinkMode, ModeControl},
    serial::Transport,
};
use tracing::{debug, info, trace};

/// What the download leg wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadReport {
    /// Image length in bytes
    pub size: usize,
    /// Verified SHA-256 of the image
    pub digest: Digest,
    /// First logical page written
    pub start_page: u32,
    /// Pages erased and written, including a trailing partial page
    pub pages: u32,
}

impl<'a, T, F, H, M> Upgrader<'a, T, F, H, M>
where
    T: Transport + ?Sized,
    F: FlashController,
    H: HashEngine + ?Sized,
    M: ModeControl + ?Sized,
{
    /// Receives an image over the data link and writes it to flash starting
    /// at logical page `start_page`.
    ///
    /// The sender sends the image size as a little-endian `u32`, then its
    /// SHA-256 digest, then the image. Every page written is acknowledged
    /// with one [`ack_byte`](crate::settings::OtaSettings::ack_byte), which
    /// the sender waits for before sending the next page. Once the whole
    /// image is in flash its digest is recomputed from flash and compared.
    ///
    /// On a digest mismatch the written pages are left as they are.
    #[tracing::instrument(name = "download", skip(self))]
    pub fn download(&mut self, start_page: u32) -> Result<DownloadReport, OtaError> {
        match self.run_download(start_page) {
            Ok(report) => {
                self.set_state(State::Done);
                info!(size = report.size, pages = report.pages, "image downloaded and verified");
                Ok(report)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn run_download(&mut self, start_page: u32) -> Result<DownloadReport, OtaError> {
        let ch = self.settings.module_channel;
        if !module::set_link_mode(self.mode, LinkMode::Data) {
            return Err(OtaError::ModeSwitch(LinkMode::Data));
        }

        self.set_state(State::Download(DownloadState::AwaitSize));
        let mut size = [0u8; 4];
        self.transport.buffered_read(ch, &mut size)?;
        let size = u32::from_le_bytes(size) as usize;
        let capacity = self.settings.capacity_from(start_page);
        if size == 0 {
            return Err(OtaError::EmptyImage);
        }
        if size > capacity {
            return Err(OtaError::ImageTooLarge { size, capacity });
        }
        info!(size, start_page, "receiving image");

        self.set_state(State::Download(DownloadState::AwaitDigest));
        let mut expected = [0u8; DIGEST_LEN];
        self.transport.buffered_read(ch, &mut expected)?;

        self.set_state(State::Download(DownloadState::DownloadPages));
        let full_pages = (size / PAGE_SIZE) as u32;
        let leftover = size % PAGE_SIZE;

        for page in start_page..start_page + full_pages {
            self.transport.buffered_read(ch, &mut self.page)?;
            self.flash.erase_page(page)?;
            self.flash.write_page(page, &self.page)?;
            self.ack()?;
            trace!(page, "page written");
        }

        let mut pages = full_pages;
        if leftover != 0 {
            let page = start_page + full_pages;
            self.page.fill(ERASED);
            self.transport.buffered_read(ch, &mut self.page[..leftover])?;
            self.flash.erase_page(page)?;
            let address = self.settings.geometry.page_address(page)?;
            let padded = leftover.next_multiple_of(QUAD_WORD);
            self.flash.write_large(address, &self.page[..padded])?;
            self.ack()?;
            trace!(page, leftover, "partial page written");
            pages += 1;
        }

        self.set_state(State::Download(DownloadState::VerifyDigest));
        let address = self.settings.geometry.page_address(start_page)?;
        let actual = hash::flash_digest(self.flash, self.hasher, address, size, &mut self.page)?;
        if actual != expected {
            return Err(OtaError::DigestMismatch { expected, actual });
        }
        debug!("digest verified");

        Ok(DownloadReport {
            size,
            digest: actual,
            start_page,
            pages,
        })
    }

    fn ack(&mut self) -> Result<(), OtaError> {
        let ch = self.settings.module_channel;
        self.transport.blocking_write(ch, &[self.settings.ack_byte])?;
        Ok(())
    }
}
