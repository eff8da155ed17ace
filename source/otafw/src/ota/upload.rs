use super::{FirmwareInfo, OtaError, Stage, State, UploadState, Upgrader};
use crate::{
    flash::{FlashController, PAGE_SIZE},
    hash::HashEngine,
    link,
    module::{self, LinkMode, ModeControl},
    serial::Transport,
};
use bgapi_proto::{Command, Message, SystemBoot, MAX_MESSAGE_LEN};
use tracing::{debug, info, warn};

impl<'a, T, F, H, M> Upgrader<'a, T, F, H, M>
where
    T: Transport + ?Sized,
    F: FlashController,
    H: HashEngine + ?Sized,
    M: ModeControl + ?Sized,
{
    /// Uploads the `size`-byte image staged in flash to the radio module
    /// through its DFU bootloader.
    ///
    /// The module is reset into DFU mode, the image is sent in chunks of
    /// [`upload_chunk`](crate::settings::OtaSettings::upload_chunk) bytes,
    /// and the module is reset into the new firmware. The upgrade succeeds
    /// when the module reports a normal boot.
    #[tracing::instrument(name = "upload", skip(self))]
    pub fn upload(&mut self, size: usize) -> FirmwareInfo {
        let mut old_bootloader_version = 0;
        let res = self.run_upload(size, &mut old_bootloader_version);
        let info = FirmwareInfo::new(old_bootloader_version, res.map_err(|e| self.fail(e)));
        if info.is_success() {
            self.set_state(State::Done);
            info!(%info, "module upgraded");
        }
        info
    }

    fn run_upload(&mut self, size: usize, old_bootloader_version: &mut u32) -> Result<SystemBoot, OtaError> {
        let ch = self.settings.module_channel;
        let chunk = self.settings.upload_chunk;
        if size == 0 {
            return Err(OtaError::EmptyImage);
        }
        let base = self.settings.geometry.page_address(self.settings.image_start_page)?;
        self.settings.geometry.check_range(base, size)?;

        if !module::set_link_mode(self.mode, LinkMode::Protocol) {
            return Err(OtaError::ModeSwitch(LinkMode::Protocol));
        }
        self.set_state(State::Upload(UploadState::AwaitDfuBoot));
        link::send_command(self.transport, ch, &Command::DfuReset { dfu: true })?;

        let mut uploaded = 0usize;
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        loop {
            let frame = link::read_frame(self.transport, ch, &mut buf)?;
            let msg = frame.message()?;
            match msg {
                Message::DfuBoot { bootloader_version } => {
                    // Back in the bootloader with everything sent: the new
                    // image did not boot.
                    if uploaded == size {
                        link::send_command(self.transport, ch, &Command::DfuReset { dfu: false })?;
                        return Err(OtaError::ImageRejected);
                    }
                    info!(bootloader_version, "module in DFU mode");
                    *old_bootloader_version = bootloader_version;
                    self.set_state(State::Upload(UploadState::SetAddress));
                    link::send_command(self.transport, ch, &Command::DfuFlashSetAddress { address: 0 })?;
                }
                Message::DfuFlashSetAddressRsp { result } | Message::DfuFlashUploadRsp { result } => {
                    if result != 0 {
                        let stage = match msg {
                            Message::DfuFlashSetAddressRsp { .. } => Stage::SetAddress,
                            _ => Stage::Upload,
                        };
                        return Err(OtaError::ResultCode { stage, result });
                    }

                    if uploaded == size {
                        self.set_state(State::Upload(UploadState::Finish));
                        link::send_command(self.transport, ch, &Command::DfuFlashUploadFinish)?;
                        continue;
                    }

                    if uploaded == 0 {
                        self.set_state(State::Upload(UploadState::UploadLoop));
                    }
                    let n = chunk.min(size - uploaded);
                    let mut data = [0u8; Command::MAX_UPLOAD_CHUNK];
                    self.flash.read(base + uploaded as u32, &mut data[..n])?;
                    link::send_command(self.transport, ch, &Command::DfuFlashUpload { data: &data[..n] })?;
                    uploaded += n;
                    if uploaded % PAGE_SIZE == 0 || uploaded == size {
                        debug!(uploaded, size, "upload progress");
                    }
                }
                Message::DfuFlashUploadFinishRsp { result } => {
                    if result != 0 {
                        return Err(OtaError::ResultCode {
                            stage: Stage::UploadFinish,
                            result,
                        });
                    }
                    info!("upload finished, rebooting module");
                    self.set_state(State::Upload(UploadState::AwaitNormalBoot));
                    link::send_command(self.transport, ch, &Command::DfuReset { dfu: false })?;
                }
                Message::SystemBoot(boot) => return Ok(boot),
                Message::SystemInitialized { address } => {
                    debug!(?address, "module stack initialized");
                }
                Message::Unknown { id, payload } => {
                    warn!(%id, len = payload.len(), "ignoring unexpected message");
                }
            }
        }
    }
}
