//! The simulated board: flash, the module UART and the BT122 behind it.

use crate::tcp_bridge::TcpBridge;
use miette::{IntoDiagnostic, WrapErr};
use otafw::{
    flash::{BankSwap, FlashManager},
    hash::Sha256Engine,
    ota::DownloadReport,
    serial::{ChannelRegistry, HwHandle, SerialTransport, StdClock},
    sim::{ModuleConfig, SimFlash, SimModule, SimPort},
    FirmwareInfo, OtaError, OtaSettings, Upgrader,
};
use std::sync::Arc;
use tracing::info;

/// Handle of the UART wired to the module.
const MODULE_HW: HwHandle = HwHandle(0x4000_4800);
/// Serial channels on the board. Channel ids run from 1 to this.
const CHANNELS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Target {
    /// Stage the image and upload it to the radio module
    Module,
    /// Write the image to the inactive bank and swap banks
    Mcu,
}

#[derive(Debug)]
pub enum Outcome {
    Module(FirmwareInfo),
    Mcu {
        report: Result<DownloadReport, OtaError>,
        /// Bank mapping in effect after the simulated reset
        after_reset: BankSwap,
    },
}

/// Wires up the board and runs one upgrade against it.
///
/// Blocks until the upgrade finishes, so call it off the async runtime.
pub fn run(
    settings: OtaSettings,
    module: ModuleConfig,
    bridge: TcpBridge,
    target: Target,
) -> miette::Result<Outcome> {
    let mut registry: ChannelRegistry<CHANNELS> = ChannelRegistry::new();
    registry
        .register(settings.module_channel, MODULE_HW)
        .into_diagnostic()
        .wrap_err("failed to register the module channel")?;
    let registry = Arc::new(registry);

    let module = SimModule::new(module).with_data_peer(bridge);
    let mut probe = module.probe();
    let port = SimPort::connect(registry.clone(), MODULE_HW, module);

    let mut transport = SerialTransport::new(&*registry, StdClock::new());
    transport
        .attach(settings.module_channel, port)
        .into_diagnostic()?;

    let mut flash = FlashManager::new(SimFlash::new(settings.geometry), settings.geometry);
    let mut hasher = Sha256Engine::new();
    let mut upgrader = Upgrader::new(&mut transport, &mut flash, &mut hasher, &mut probe, settings)
        .into_diagnostic()
        .wrap_err("invalid upgrade settings")?;

    let outcome = match target {
        Target::Module => Outcome::Module(upgrader.upgrade_module()),
        Target::Mcu => {
            let report = upgrader.upgrade_mcu();
            drop(upgrader);
            info!("resetting MCU");
            flash.controller_mut().reset();
            Outcome::Mcu {
                report,
                after_reset: flash.banks_swapped(),
            }
        }
    };
    Ok(outcome)
}
