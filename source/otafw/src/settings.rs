//! Upgrade settings

use crate::flash::{Geometry, PAGE_SIZE};
use crate::serial::{ChannelId, RxTimeout};
use bgapi_proto::Command;
use core::fmt;
use serde::{Deserialize, Serialize};

/// OTA Settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct OtaSettings {
    /// Flash layout. Defaults to [`Geometry::STM32U5_4M`]
    pub geometry: Geometry,
    /// Logical page a module image is staged at. Defaults to 128
    pub image_start_page: u32,
    /// Channel wired to the radio module. Defaults to 2
    pub module_channel: ChannelId,
    /// Bytes per DFU upload command. Defaults to 128
    pub upload_chunk: usize,
    /// Byte sent back to the sender for every page written. Defaults to `0xFF`
    pub ack_byte: u8,
    /// How long buffered reads wait for data. Defaults to forever.
    ///
    /// [`Upgrader::new`](crate::ota::Upgrader::new) applies this to its
    /// transport.
    pub rx_timeout: RxTimeout,
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct OtaSettingsOverrides {
    /// Flash layout. Defaults to [`Geometry::STM32U5_4M`]
    pub geometry: Option<Geometry>,
    /// Logical page a module image is staged at. Defaults to 128
    pub image_start_page: Option<u32>,
    /// Channel wired to the radio module. Defaults to 2
    pub module_channel: Option<ChannelId>,
    /// Bytes per DFU upload command. Defaults to 128
    pub upload_chunk: Option<usize>,
    /// Byte sent back to the sender for every page written. Defaults to `0xFF`
    pub ack_byte: Option<u8>,
    /// How long buffered reads wait for data. Defaults to forever
    pub rx_timeout: Option<RxTimeout>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    /// The staging page is not inside flash
    StartPageOutOfRange { page: u32, total_pages: u32 },
    /// The upload chunk is zero or longer than a DFU upload command can carry
    UploadChunk(usize),
    /// The flash manager was built for a different geometry
    GeometryMismatch,
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StartPageOutOfRange { page, total_pages } => {
                write!(f, "start page {page} is not below {total_pages}")
            }
            Self::UploadChunk(len) => write!(
                f,
                "upload chunk of {len} bytes is not within 1..={}",
                Command::MAX_UPLOAD_CHUNK
            ),
            Self::GeometryMismatch => f.write_str("flash geometry does not match the settings"),
        }
    }
}

#[cfg(any(test, feature = "use-std"))]
impl std::error::Error for SettingsError {}

impl OtaSettings {
    pub const DEFAULT_GEOMETRY: Geometry = Geometry::STM32U5_4M;
    pub const DEFAULT_IMAGE_START_PAGE: u32 = 128;
    pub const DEFAULT_MODULE_CHANNEL: ChannelId = ChannelId::from_const(2);
    pub const DEFAULT_UPLOAD_CHUNK: usize = 128;
    pub const DEFAULT_ACK_BYTE: u8 = 0xFF;
    pub const DEFAULT_RX_TIMEOUT: RxTimeout = RxTimeout::Forever;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            geometry: Self::DEFAULT_GEOMETRY,
            image_start_page: Self::DEFAULT_IMAGE_START_PAGE,
            module_channel: Self::DEFAULT_MODULE_CHANNEL,
            upload_chunk: Self::DEFAULT_UPLOAD_CHUNK,
            ack_byte: Self::DEFAULT_ACK_BYTE,
            rx_timeout: Self::DEFAULT_RX_TIMEOUT,
        }
    }

    /// Largest image that fits between `start_page` and the end of flash.
    #[must_use]
    pub fn capacity_from(&self, start_page: u32) -> usize {
        self.geometry.total_pages().saturating_sub(start_page) as usize * PAGE_SIZE
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let total_pages = self.geometry.total_pages();
        if self.image_start_page >= total_pages {
            return Err(SettingsError::StartPageOutOfRange {
                page: self.image_start_page,
                total_pages,
            });
        }
        if self.upload_chunk == 0 || self.upload_chunk > Command::MAX_UPLOAD_CHUNK {
            return Err(SettingsError::UploadChunk(self.upload_chunk));
        }
        Ok(())
    }
}

impl Default for OtaSettings {
    fn default() -> Self {
        Self::new()
    }
}

impl OtaSettingsOverrides {
    pub fn into_settings(self) -> OtaSettings {
        OtaSettings {
            geometry: self.geometry.unwrap_or(OtaSettings::DEFAULT_GEOMETRY),
            image_start_page: self
                .image_start_page
                .unwrap_or(OtaSettings::DEFAULT_IMAGE_START_PAGE),
            module_channel: self
                .module_channel
                .unwrap_or(OtaSettings::DEFAULT_MODULE_CHANNEL),
            upload_chunk: self
                .upload_chunk
                .unwrap_or(OtaSettings::DEFAULT_UPLOAD_CHUNK),
            ack_byte: self.ack_byte.unwrap_or(OtaSettings::DEFAULT_ACK_BYTE),
            rx_timeout: self.rx_timeout.unwrap_or(OtaSettings::DEFAULT_RX_TIMEOUT),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::time::Duration;

    #[test]
    fn defaults_match_deployment() {
        let s = OtaSettings::default();
        assert_eq!(s.geometry.page_address(s.image_start_page), Ok(0x0810_0000));
        assert_eq!(s.capacity_from(s.image_start_page), 384 * PAGE_SIZE);
        assert_eq!(s.rx_timeout, RxTimeout::Forever);
        assert_eq!(s.validate(), Ok(()));
        assert_eq!(OtaSettingsOverrides::default().into_settings(), s);
    }

    #[test]
    fn overrides_apply() {
        let overrides = OtaSettingsOverrides {
            upload_chunk: Some(200),
            rx_timeout: Some(RxTimeout::After(Duration::from_secs(5))),
            ..Default::default()
        };
        let s = overrides.into_settings();
        assert_eq!(s.upload_chunk, 200);
        assert_eq!(s.ack_byte, 0xFF);
        assert_eq!(s.rx_timeout, RxTimeout::After(Duration::from_secs(5)));
    }

    #[test]
    fn rejects_bad_values() {
        let mut s = OtaSettings::new();
        s.upload_chunk = 256;
        assert_eq!(s.validate(), Err(SettingsError::UploadChunk(256)));
        s.upload_chunk = 0;
        assert_eq!(s.validate(), Err(SettingsError::UploadChunk(0)));

        let mut s = OtaSettings::new();
        s.image_start_page = 512;
        assert_eq!(
            s.validate(),
            Err(SettingsError::StartPageOutOfRange {
                page: 512,
                total_pages: 512
            })
        );
    }
}
