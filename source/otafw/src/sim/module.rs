use super::port::{Peer, Wire};
use crate::module::{LinkMode, ModeControl};
use bgapi_proto::{frame_len, Command, Header, Message, MessageId, SystemBoot, HEADER_LEN, MAX_MESSAGE_LEN};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace, warn};

/// Result code the simulated bootloader uses for refused commands.
pub const DFU_ERROR: u16 = 0x0181;

/// How the simulated module behaves.
#[derive(Debug, Clone)]
pub struct ModuleConfig {
    /// UART mode at power-up.
    pub initial_mode: LinkMode,
    /// Version reported in the DFU boot event.
    pub bootloader_version: u32,
    /// Versions reported in the system boot event.
    pub boot: SystemBoot,
    /// Answer this upload command (counting from zero) with this result.
    pub fail_upload_at: Option<(usize, u16)>,
    /// Answer the set-address command with this result.
    pub fail_set_address: Option<u16>,
    /// Answer the upload-finish command with this result.
    pub fail_finish: Option<u16>,
    /// Fall back to the bootloader instead of booting the new image.
    pub reject_image: bool,
    /// Emit a stray `0x00` before the DFU boot event, like the real module's
    /// UART does across a reset.
    pub leading_zero: bool,
    /// Emit messages the upgrade logic has no use for between the useful ones.
    pub chatter: bool,
    /// Ignore pulses on the mode toggle input.
    pub stuck_mode: bool,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            initial_mode: LinkMode::Data,
            bootloader_version: 3,
            boot: SystemBoot {
                major: 1,
                minor: 2,
                patch: 0,
                build: 146,
                bootloader: 4,
                hw: 0x0d,
            },
            fail_upload_at: None,
            fail_set_address: None,
            fail_finish: None,
            reject_image: false,
            leading_zero: false,
            chatter: false,
            stuck_mode: false,
        }
    }
}

struct ModuleState {
    config: ModuleConfig,
    mode: LinkMode,
    toggles: usize,
    wire: Option<Wire>,
    data_peer: Option<Box<dyn Peer>>,
    data_peer_connected: bool,
    rx: Vec<u8>,
    in_dfu: bool,
    image: Vec<u8>,
    upload_chunks: Vec<usize>,
    commands: Vec<MessageId>,
}

impl ModuleState {
    fn connect_data_peer(&mut self) {
        if self.data_peer_connected || self.mode != LinkMode::Data {
            return;
        }
        if let (Some(wire), Some(peer)) = (self.wire.as_ref(), self.data_peer.as_mut()) {
            peer.connected(wire.clone());
            self.data_peer_connected = true;
        }
    }

    fn send(&self, msg: &Message<'_>) {
        let Some(wire) = self.wire.as_ref() else {
            return;
        };
        let mut buf = [0u8; MAX_MESSAGE_LEN];
        match msg.encode_to(&mut buf) {
            Ok(bytes) => wire.send(bytes),
            Err(error) => warn!(%error, id = %msg.id(), "module failed to encode message"),
        }
    }

    fn chatter(&self) {
        if self.config.chatter {
            self.send(&Message::Unknown {
                id: MessageId::from_raw(0x0004_03a0),
                payload: &[0x01, 0x02],
            });
        }
    }

    fn boot_dfu(&mut self) {
        self.in_dfu = true;
        self.image.clear();
        self.upload_chunks.clear();
        if self.config.leading_zero {
            if let Some(wire) = self.wire.as_ref() {
                wire.send(&[0]);
            }
        }
        self.send(&Message::DfuBoot {
            bootloader_version: self.config.bootloader_version,
        });
    }

    fn boot_normal(&mut self) {
        self.in_dfu = false;
        let boot = self.config.boot;
        self.send(&Message::SystemBoot(boot));
        self.chatter();
        self.send(&Message::SystemInitialized {
            address: [0x00, 0x07, 0x80, 0x12, 0x34, 0x56],
        });
    }

    fn handle(&mut self, header: Header, payload: &[u8]) {
        let cmd = match Command::decode(&header, payload) {
            Ok(cmd) => cmd,
            Err(error) => {
                warn!(%error, "module ignoring undecodable command");
                return;
            }
        };
        self.commands.push(cmd.id());
        trace!(?cmd, "module rx");
        self.chatter();

        match cmd {
            Command::DfuReset { dfu } | Command::SystemReset { dfu } => {
                if dfu || (self.config.reject_image && !self.image.is_empty()) {
                    self.boot_dfu();
                } else {
                    self.boot_normal();
                }
            }
            Command::DfuFlashSetAddress { .. } => {
                let result = self.config.fail_set_address.unwrap_or(0);
                self.send(&Message::DfuFlashSetAddressRsp { result });
            }
            Command::DfuFlashUpload { data } => {
                let idx = self.upload_chunks.len();
                let result = match self.config.fail_upload_at {
                    Some((at, result)) if at == idx => result,
                    _ => {
                        self.image.extend_from_slice(data);
                        0
                    }
                };
                self.upload_chunks.push(data.len());
                self.send(&Message::DfuFlashUploadRsp { result });
            }
            Command::DfuFlashUploadFinish => {
                let result = self.config.fail_finish.unwrap_or(0);
                self.send(&Message::DfuFlashUploadFinishRsp { result });
            }
        }
    }

    fn on_protocol_byte(&mut self, byte: u8) {
        self.rx.push(byte);
        let Some(len) = frame_len(&self.rx) else {
            return;
        };
        if self.rx.len() < len {
            return;
        }
        let frame = core::mem::take(&mut self.rx);
        let header = Header::from_bytes([frame[0], frame[1], frame[2], frame[3]]);
        self.handle(header, &frame[HEADER_LEN..len]);
    }
}

/// A simulated BT122.
///
/// In [`LinkMode::Data`] bytes from the MCU go to the data peer (the remote
/// device on the other end of the Bluetooth link) and the data peer's bytes
/// go to the MCU. In [`LinkMode::Protocol`] the module answers BGAPI DFU
/// commands according to its [`ModuleConfig`].
pub struct SimModule {
    state: Arc<Mutex<ModuleState>>,
}

impl SimModule {
    #[must_use]
    pub fn new(config: ModuleConfig) -> Self {
        let mode = config.initial_mode;
        Self {
            state: Arc::new(Mutex::new(ModuleState {
                config,
                mode,
                toggles: 0,
                wire: None,
                data_peer: None,
                data_peer_connected: false,
                rx: Vec::new(),
                in_dfu: false,
                image: Vec::new(),
                upload_chunks: Vec::new(),
                commands: Vec::new(),
            })),
        }
    }

    /// Sets the device on the far side of the data link. It is connected the
    /// first time the module is in data mode.
    #[must_use]
    pub fn with_data_peer(self, peer: impl Peer + 'static) -> Self {
        lock(&self.state).data_peer = Some(Box::new(peer));
        self
    }

    /// Returns the module's mode pins, which also give access to what the
    /// module received.
    #[must_use]
    pub fn probe(&self) -> ModuleProbe {
        ModuleProbe {
            state: self.state.clone(),
        }
    }
}

impl Peer for SimModule {
    fn connected(&mut self, wire: Wire) {
        let mut state = lock(&self.state);
        state.wire = Some(wire);
        state.connect_data_peer();
    }

    fn on_byte(&mut self, byte: u8) {
        let mut state = lock(&self.state);
        match state.mode {
            LinkMode::Data => match state.data_peer.as_mut() {
                Some(peer) => peer.on_byte(byte),
                None => trace!(byte, "no data peer"),
            },
            LinkMode::Protocol => state.on_protocol_byte(byte),
        }
    }
}

/// Mode pins and introspection for a [`SimModule`].
#[derive(Clone)]
pub struct ModuleProbe {
    state: Arc<Mutex<ModuleState>>,
}

impl ModuleProbe {
    /// Image bytes the bootloader accepted.
    #[must_use]
    pub fn image(&self) -> Vec<u8> {
        lock(&self.state).image.clone()
    }

    /// Length of every upload command received.
    #[must_use]
    pub fn upload_chunks(&self) -> Vec<usize> {
        lock(&self.state).upload_chunks.clone()
    }

    /// Ids of every command received, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<MessageId> {
        lock(&self.state).commands.clone()
    }

    #[must_use]
    pub fn toggles(&self) -> usize {
        lock(&self.state).toggles
    }

    #[must_use]
    pub fn in_dfu(&self) -> bool {
        lock(&self.state).in_dfu
    }
}

impl ModeControl for ModuleProbe {
    fn mode(&mut self) -> LinkMode {
        lock(&self.state).mode
    }

    fn toggle(&mut self) {
        let mut state = lock(&self.state);
        state.toggles += 1;
        if state.config.stuck_mode {
            debug!(mode = ?state.mode, "module ignored mode toggle");
            return;
        }
        state.mode = match state.mode {
            LinkMode::Data => LinkMode::Protocol,
            LinkMode::Protocol => LinkMode::Data,
        };
        state.rx.clear();
        debug!(mode = ?state.mode, "module UART mode toggled");
        state.connect_data_peer();
    }
}

fn lock(state: &Mutex<ModuleState>) -> MutexGuard<'_, ModuleState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
