//! Upgrade orchestration
//!
//! An upgrade has up to two legs:
//!
//! * the **download** leg ([`Upgrader::download`]) receives an image over the
//!   module's transparent data link, writes it to flash a page at a time and
//!   verifies its digest;
//! * the **upload** leg ([`Upgrader::upload`]) switches the module to BGAPI
//!   and drives its DFU bootloader, feeding it the staged image out of flash.
//!
//! [`Upgrader::upgrade_module`] runs both. [`Upgrader::upgrade_mcu`] runs the
//! download leg into the inactive bank and then swaps banks.

use crate::{
    flash::{FlashController, FlashError, FlashManager, PAGE_SIZE},
    hash::{Digest, DigestError, HashEngine, HashError},
    link::LinkError,
    module::{LinkMode, ModeControl},
    serial::{SerialError, Transport},
    settings::{OtaSettings, SettingsError},
};
use bgapi_proto::SystemBoot;
use core::fmt;
use tracing::{debug, error};

mod download;
mod upload;


pub use self::download::DownloadReport;

////////////////////////////////////////////////////////////////////////////////
// Results and Errors
////////////////////////////////////////////////////////////////////////////////

/// DFU commands whose responses carry a result code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    SetAddress,
    Upload,
    UploadFinish,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtaError {
    /// The serial link failed
    Serial(SerialError),
    /// Flash validation or hardware failure
    Flash(FlashError),
    /// The hash engine failed
    Hash(HashError),
    /// The module sent a message that could not be decoded, or a command
    /// could not be encoded
    Protocol(bgapi_proto::Error),
    /// The sender announced a zero-length image
    EmptyImage,
    /// The announced image does not fit in the target region
    ImageTooLarge { size: usize, capacity: usize },
    /// The image written to flash does not have the digest the sender sent
    DigestMismatch { expected: Digest, actual: Digest },
    /// The module came back up in its bootloader after receiving the whole
    /// image, so it did not accept the new firmware
    ImageRejected,
    /// The module answered a DFU command with a non-zero result
    ResultCode { stage: Stage, result: u16 },
    /// The upgrade settings are inconsistent
    InvalidSettings(SettingsError),
    /// The module's mode indicator did not follow the toggle pulse
    ModeSwitch(LinkMode),
}

impl From<SerialError> for OtaError {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl From<FlashError> for OtaError {
    fn from(e: FlashError) -> Self {
        Self::Flash(e)
    }
}

impl From<HashError> for OtaError {
    fn from(e: HashError) -> Self {
        Self::Hash(e)
    }
}

impl From<bgapi_proto::Error> for OtaError {
    fn from(e: bgapi_proto::Error) -> Self {
        Self::Protocol(e)
    }
}

impl From<LinkError> for OtaError {
    fn from(e: LinkError) -> Self {
        match e {
            LinkError::Serial(e) => Self::Serial(e),
            LinkError::Protocol(e) => Self::Protocol(e),
        }
    }
}

impl From<DigestError> for OtaError {
    fn from(e: DigestError) -> Self {
        match e {
            DigestError::Flash(e) => Self::Flash(e),
            DigestError::Hash(e) => Self::Hash(e),
        }
    }
}

impl From<SettingsError> for OtaError {
    fn from(e: SettingsError) -> Self {
        Self::InvalidSettings(e)
    }
}

impl fmt::Display for OtaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(e) => fmt::Display::fmt(e, f),
            Self::Flash(e) => fmt::Display::fmt(e, f),
            Self::Hash(e) => fmt::Display::fmt(e, f),
            Self::Protocol(e) => write!(f, "bgapi: {e}"),
            Self::EmptyImage => f.write_str("image is empty"),
            Self::ImageTooLarge { size, capacity } => {
                write!(f, "image of {size} bytes does not fit in {capacity} bytes")
            }
            Self::DigestMismatch { .. } => f.write_str("image digest does not match"),
            Self::ImageRejected => f.write_str("module rejected the new image"),
            Self::ResultCode { stage, result } => {
                write!(f, "module returned {result:#06x} for {stage:?}")
            }
            Self::InvalidSettings(e) => write!(f, "invalid settings: {e}"),
            Self::ModeSwitch(mode) => write!(f, "module did not switch to {mode:?} mode"),
        }
    }
}

#[cfg(any(test, feature = "use-std"))]
impl std::error::Error for OtaError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStatus {
    Success,
    Failed(OtaError),
}

/// Outcome of a module upgrade.
///
/// The version fields are zero unless the corresponding event was seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareInfo {
    pub status: UpgradeStatus,
    /// Bootloader version reported by the DFU boot event
    pub old_bootloader_version: u32,
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
    pub build: u16,
    /// Bootloader version reported when the new firmware booted
    pub new_bootloader_version: u16,
    pub hardware_type: u16,
}

impl FirmwareInfo {
    fn new(old_bootloader_version: u32, res: Result<SystemBoot, OtaError>) -> Self {
        let (status, boot) = match res {
            Ok(boot) => (UpgradeStatus::Success, boot),
            Err(e) => (UpgradeStatus::Failed(e), SystemBoot::default()),
        };
        Self {
            status,
            old_bootloader_version,
            major: boot.major,
            minor: boot.minor,
            patch: boot.patch,
            build: boot.build,
            new_bootloader_version: boot.bootloader,
            hardware_type: boot.hw,
        }
    }

    fn failed(error: OtaError) -> Self {
        Self::new(0, Err(error))
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == UpgradeStatus::Success
    }

    #[must_use]
    pub fn error(&self) -> Option<OtaError> {
        match self.status {
            UpgradeStatus::Success => None,
            UpgradeStatus::Failed(e) => Some(e),
        }
    }
}

impl fmt::Display for FirmwareInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            UpgradeStatus::Success => write!(
                f,
                "firmware {}.{}.{}-{} (bootloader {} -> {}, hw {})",
                self.major,
                self.minor,
                self.patch,
                self.build,
                self.old_bootloader_version,
                self.new_bootloader_version,
                self.hardware_type
            ),
            UpgradeStatus::Failed(e) => write!(f, "upgrade failed: {e}"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadState {
    AwaitSize,
    AwaitDigest,
    DownloadPages,
    VerifyDigest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    AwaitDfuBoot,
    SetAddress,
    UploadLoop,
    Finish,
    AwaitNormalBoot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    Download(DownloadState),
    Upload(UploadState),
    Done,
    Failed,
}

////////////////////////////////////////////////////////////////////////////////
// Upgrader
////////////////////////////////////////////////////////////////////////////////

/// Drives an upgrade using borrowed hardware.
pub struct Upgrader<'a, T: ?Sized, F, H: ?Sized, M: ?Sized> {
    transport: &'a mut T,
    flash: &'a mut FlashManager<F>,
    hasher: &'a mut H,
    mode: &'a mut M,
    settings: OtaSettings,
    page: [u8; PAGE_SIZE],
    state: State,
}

impl<'a, T, F, H, M> Upgrader<'a, T, F, H, M>
where
    T: Transport + ?Sized,
    F: FlashController,
    H: HashEngine + ?Sized,
    M: ModeControl + ?Sized,
{
    /// Checks `settings` against the flash geometry and applies
    /// [`rx_timeout`](OtaSettings::rx_timeout) to `transport`.
    pub fn new(
        transport: &'a mut T,
        flash: &'a mut FlashManager<F>,
        hasher: &'a mut H,
        mode: &'a mut M,
        settings: OtaSettings,
    ) -> Result<Self, OtaError> {
        settings.validate()?;
        if flash.geometry() != settings.geometry {
            return Err(SettingsError::GeometryMismatch.into());
        }
        transport.set_timeout(settings.rx_timeout);
        Ok(Self {
            transport,
            flash,
            hasher,
            mode,
            settings,
            page: [0; PAGE_SIZE],
            state: State::Idle,
        })
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    #[must_use]
    pub fn settings(&self) -> &OtaSettings {
        &self.settings
    }

    /// Downloads an image into the staging region and uploads it to the
    /// radio module.
    #[tracing::instrument(name = "upgrade_module", skip(self))]
    pub fn upgrade_module(&mut self) -> FirmwareInfo {
        match self.download(self.settings.image_start_page) {
            Ok(report) => self.upload(report.size),
            Err(e) => FirmwareInfo::failed(e),
        }
    }

    /// Downloads an image into the inactive bank and, once its digest has been
    /// verified, swaps banks so the image runs after the next reset.
    ///
    /// Resetting is left to the caller.
    #[tracing::instrument(name = "upgrade_mcu", skip(self))]
    pub fn upgrade_mcu(&mut self) -> Result<DownloadReport, OtaError> {
        let start = self.settings.geometry.inactive_bank_start();
        let report = self.download(start)?;
        let swap = self.flash.swap_banks().map_err(|e| self.fail(e.into()))?;
        tracing::info!(?swap, size = report.size, "new MCU image staged");
        Ok(report)
    }

    fn set_state(&mut self, state: State) {
        debug!(from = ?self.state, to = ?state, "state");
        self.state = state;
    }

    fn fail(&mut self, e: OtaError) -> OtaError {
        error!(state = ?self.state, error = %e, "upgrade failed");
        self.state = State::Failed;
        e
    }
}
