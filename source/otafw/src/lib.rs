//! # Over-the-air firmware upgrades
//!
//! `otafw` upgrades the firmware of a dual-bank MCU and of the BT122
//! Bluetooth module attached to it, with images streamed in from a remote
//! sender over the module's data link.
//!
//! ## Hardware model
//!
//! The crate never touches registers itself. Platform code provides:
//!
//! * a [`SerialPort`](serial::SerialPort) per UART, plus a call to
//!   [`ChannelRegistry::on_rx_complete`](serial::ChannelRegistry::on_rx_complete)
//!   from each receive-complete interrupt;
//! * a [`FlashController`](flash::FlashController) for the internal flash;
//! * a [`HashEngine`](hash::HashEngine), or the software
//!   [`Sha256Engine`](hash::Sha256Engine);
//! * a [`ModeControl`](module::ModeControl) for the module's UART mode pins;
//! * a [`Clock`](serial::Clock), if receive timeouts are wanted.
//!
//! ## Running an upgrade
//!
//! Register the serial channels, attach their ports to a
//! [`SerialTransport`](serial::SerialTransport), wrap the flash controller in a
//! [`FlashManager`](flash::FlashManager) and hand everything to an
//! [`Upgrader`](ota::Upgrader):
//!
//! * [`Upgrader::upgrade_module`](ota::Upgrader::upgrade_module) downloads an
//!   image into the staging region and uploads it to the module through its
//!   DFU bootloader, returning a [`FirmwareInfo`](ota::FirmwareInfo).
//! * [`Upgrader::upgrade_mcu`](ota::Upgrader::upgrade_mcu) downloads an image
//!   into the inactive flash bank and flips the bank swap option so it runs
//!   after the next reset.
//!
//! ## Simulation
//!
//! With the `sim` feature, [`sim`] provides in-memory flash, UARTs, a
//! simulated BT122 and a simulated sender.

#![cfg_attr(not(any(test, feature = "use-std")), no_std)]
#![allow(clippy::missing_safety_doc)]

pub mod flash;
pub mod hash;
pub mod isr;
pub mod link;
pub mod module;
pub mod ota;
pub mod serial;
pub mod settings;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

#[cfg(test)]
pub(crate) mod test_util;

pub use self::ota::{FirmwareInfo, OtaError, UpgradeStatus, Upgrader};
pub use self::settings::{OtaSettings, OtaSettingsOverrides};
