//! Configuration types for otasim
//!
//! Separate crate so it can be used from the build.rs script

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use otafw::{module::LinkMode, sim::ModuleConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    /// TCP listener standing in for the module's transparent data link
    pub tcp_uart: TcpUartConfigOverrides,

    /// Behaviour of the simulated BT122
    pub module: SimModuleOverrides,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TcpUartConfig {
    /// Socket addr the image sender connects to
    ///
    /// For example: "127.0.0.1:9999"
    pub socket_addr: SocketAddr,
    /// Largest chunk handed to the receive interrupt at once
    pub read_chunk: usize,
}

impl TcpUartConfig {
    pub const DEFAULT_SOCKET_ADDR: SocketAddr =
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9999));
    const DEFAULT_READ_CHUNK: usize = 256;
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TcpUartConfigOverrides {
    /// Socket addr the image sender connects to
    pub socket_addr: Option<SocketAddr>,
    /// Largest chunk handed to the receive interrupt at once
    pub read_chunk: Option<usize>,
}

impl TcpUartConfigOverrides {
    pub fn into_settings(self) -> TcpUartConfig {
        TcpUartConfig {
            socket_addr: self
                .socket_addr
                .unwrap_or(TcpUartConfig::DEFAULT_SOCKET_ADDR),
            read_chunk: self
                .read_chunk
                .unwrap_or(TcpUartConfig::DEFAULT_READ_CHUNK)
                .max(1),
        }
    }
}

/// Overrides for the simulated module.
///
/// Versions are what the module reports after booting the uploaded image;
/// the `fail_*` fields inject DFU result codes.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SimModuleOverrides {
    pub initial_mode: Option<LinkMode>,
    pub bootloader_version: Option<u32>,
    pub major: Option<u16>,
    pub minor: Option<u16>,
    pub patch: Option<u16>,
    pub build: Option<u16>,
    pub new_bootloader_version: Option<u16>,
    pub hardware_type: Option<u16>,
    /// Upload command index (counting from zero) and the result to answer it with
    pub fail_upload_at: Option<(usize, u16)>,
    pub fail_set_address: Option<u16>,
    pub fail_finish: Option<u16>,
    pub reject_image: Option<bool>,
    pub leading_zero: Option<bool>,
    pub chatter: Option<bool>,
    /// Ignore the mode toggle pulse
    pub stuck_mode: Option<bool>,
}

impl SimModuleOverrides {
    pub fn into_settings(self) -> ModuleConfig {
        let mut config = ModuleConfig::default();
        let boot = &mut config.boot;
        boot.major = self.major.unwrap_or(boot.major);
        boot.minor = self.minor.unwrap_or(boot.minor);
        boot.patch = self.patch.unwrap_or(boot.patch);
        boot.build = self.build.unwrap_or(boot.build);
        boot.bootloader = self.new_bootloader_version.unwrap_or(boot.bootloader);
        boot.hw = self.hardware_type.unwrap_or(boot.hw);

        config.initial_mode = self.initial_mode.unwrap_or(config.initial_mode);
        config.bootloader_version = self
            .bootloader_version
            .unwrap_or(config.bootloader_version);
        config.fail_upload_at = self.fail_upload_at;
        config.fail_set_address = self.fail_set_address;
        config.fail_finish = self.fail_finish;
        config.reject_image = self.reject_image.unwrap_or(config.reject_image);
        config.leading_zero = self.leading_zero.unwrap_or(config.leading_zero);
        config.chatter = self.chatter.unwrap_or(config.chatter);
        config.stuck_mode = self.stuck_mode.unwrap_or(config.stuck_mode);
        config
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_overrides_match_module_defaults() {
        let cfg = SimModuleOverrides::default().into_settings();
        let dflt = ModuleConfig::default();
        assert_eq!(cfg.boot, dflt.boot);
        assert_eq!(cfg.initial_mode, dflt.initial_mode);
        assert_eq!(cfg.bootloader_version, dflt.bootloader_version);
        assert!(!cfg.reject_image);
        assert!(!cfg.stuck_mode);

        let tcp = TcpUartConfigOverrides::default().into_settings();
        assert_eq!(tcp.socket_addr.to_string(), "127.0.0.1:9999");
    }

    #[test]
    fn overrides_reach_the_module() {
        let cfg = SimModuleOverrides {
            major: Some(2),
            hardware_type: Some(0x0e),
            fail_upload_at: Some((3, 0x0181)),
            chatter: Some(true),
            ..Default::default()
        }
        .into_settings();
        assert_eq!(cfg.boot.major, 2);
        assert_eq!(cfg.boot.minor, ModuleConfig::default().boot.minor);
        assert_eq!(cfg.boot.hw, 0x0e);
        assert_eq!(cfg.fail_upload_at, Some((3, 0x0181)));
        assert!(cfg.chatter);
    }
}
