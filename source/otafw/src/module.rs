//! BT122 UART mode control
//!
//! The module's UART is either carrying BGAPI frames ([`LinkMode::Protocol`])
//! or passing raw bytes through from the paired Bluetooth peer
//! ([`LinkMode::Data`]). The module reports the current mode on an indicator
//! pin and switches on a pulse of its mode-toggle input.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMode {
    /// BGAPI command/event framing.
    Protocol,
    /// Transparent data from the remote peer.
    Data,
}

/// Access to the module's mode pins.
pub trait ModeControl {
    /// Samples the mode indicator.
    fn mode(&mut self) -> LinkMode;

    /// Pulses the mode toggle input, including whatever hold time the module
    /// needs.
    fn toggle(&mut self);
}

impl<M: ModeControl + ?Sized> ModeControl for &mut M {
    fn mode(&mut self) -> LinkMode {
        (**self).mode()
    }

    fn toggle(&mut self) {
        (**self).toggle();
    }
}

/// Puts the module's UART into `mode`. Pulses the toggle only if the module
/// is currently in the other mode.
///
/// Returns whether the indicator reports `mode` afterwards.
pub fn set_link_mode<M: ModeControl + ?Sized>(ctrl: &mut M, mode: LinkMode) -> bool {
    if ctrl.mode() == mode {
        debug!(?mode, "module already in requested mode");
        return true;
    }

    info!(?mode, "switching module UART mode");
    ctrl.toggle();
    let now = ctrl.mode();
    if now != mode {
        warn!(wanted = ?mode, reported = ?now, "module did not change mode");
        return false;
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;

    struct Pins {
        mode: LinkMode,
        toggles: usize,
        stuck: bool,
    }

    impl ModeControl for Pins {
        fn mode(&mut self) -> LinkMode {
            self.mode
        }

        fn toggle(&mut self) {
            self.toggles += 1;
            if !self.stuck {
                self.mode = match self.mode {
                    LinkMode::Data => LinkMode::Protocol,
                    LinkMode::Protocol => LinkMode::Data,
                };
            }
        }
    }

    #[test]
    fn only_pulses_on_change() {
        let mut pins = Pins {
            mode: LinkMode::Data,
            toggles: 0,
            stuck: false,
        };
        assert!(set_link_mode(&mut pins, LinkMode::Data));
        assert_eq!(pins.toggles, 0);
        assert!(set_link_mode(&mut pins, LinkMode::Protocol));
        assert!(set_link_mode(&mut pins, LinkMode::Protocol));
        assert_eq!(pins.toggles, 1);
        assert_eq!(pins.mode, LinkMode::Protocol);
    }

    #[test]
    fn reports_a_stuck_module() {
        let mut pins = Pins {
            mode: LinkMode::Protocol,
            toggles: 0,
            stuck: true,
        };
        assert!(!set_link_mode(&mut pins, LinkMode::Data));
        assert_eq!(pins.toggles, 1);
    }
}
