//! Simulated hardware
//!
//! In-memory stand-ins for the flash controller, the UARTs, the BT122 and
//! the remote sender, used by the crate's tests and by the desktop
//! simulator.

mod flash;
mod module;
mod port;
mod sender;

pub use self::flash::{FlashOp, SimFlash};
pub use self::module::{ModuleConfig, ModuleProbe, SimModule, DFU_ERROR};
pub use self::port::{Peer, SimPort, Wire};
pub use self::sender::SimSender;
