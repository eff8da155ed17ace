//! Desktop simulator for OTA upgrades.
//!
//! A TCP listener stands in for the radio module's transparent data link, so
//! `otaload` (or anything speaking the download protocol) can stream an image
//! in. The image lands in simulated flash and is then either uploaded to a
//! simulated BT122 or staged in the inactive bank.

pub mod board;
pub mod cli;
pub mod sim_tracing;
pub mod tcp_bridge;
