use crate::serial::{ChannelRegistry, HwHandle, PortError, SerialPort};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    mpsc, Arc,
};
use tracing::{debug, trace};

/// The receive side of a simulated UART, as seen by the device at the other
/// end of it.
///
/// Bytes sent over a wire arrive through the channel's receive interrupt, on
/// the wire's own thread, in the order they were sent.
#[derive(Clone, Debug)]
pub struct Wire {
    tx: mpsc::Sender<Vec<u8>>,
}

impl Wire {
    pub fn send(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.tx.send(bytes.to_vec()).is_err() {
            trace!(len = bytes.len(), "wire closed, dropping bytes");
        }
    }
}

/// A device on the far end of a simulated UART.
pub trait Peer: Send {
    /// Called once, when the port is connected, with the wire into the MCU.
    fn connected(&mut self, wire: Wire);

    /// Called for every byte the MCU transmits.
    fn on_byte(&mut self, byte: u8);
}

/// A [`SerialPort`] whose far end is a [`Peer`].
pub struct SimPort {
    peer: Box<dyn Peer>,
    hung_up: Arc<AtomicBool>,
    busy_every: usize,
    fault_after: Option<usize>,
    attempts: usize,
    sent: usize,
}

impl SimPort {
    /// Connects `peer` to the channel bound to `hw`.
    ///
    /// A thread stands in for the receive interrupt. It hands everything the
    /// peer sends to [`ChannelRegistry::on_rx_complete`], retrying while the
    /// ring is full, so no byte is ever dropped.
    pub fn connect<const N: usize, const CAP: usize>(
        registry: Arc<ChannelRegistry<N, CAP>>,
        hw: HwHandle,
        peer: impl Peer + 'static,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let hung_up = Arc::new(AtomicBool::new(false));
        let stop = hung_up.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("rx-irq-{:#x}", hw.0))
            .spawn(move || {
                for chunk in rx {
                    let mut rest = &chunk[..];
                    while !rest.is_empty() {
                        if stop.load(Ordering::Acquire) {
                            return;
                        }
                        let n = registry.on_rx_complete(hw, rest);
                        rest = &rest[n..];
                        if n == 0 {
                            std::thread::yield_now();
                        }
                    }
                }
                debug!(?hw, "wire closed");
            });
        if let Err(error) = spawned {
            tracing::error!(%error, "failed to spawn receive thread");
        }

        let mut peer = Box::new(peer);
        peer.connected(Wire { tx });
        Self {
            peer,
            hung_up,
            busy_every: 0,
            fault_after: None,
            attempts: 0,
            sent: 0,
        }
    }

    /// Reports [`PortError::Busy`] on every `n`th transmit attempt.
    #[must_use]
    pub fn busy_every(mut self, n: usize) -> Self {
        self.busy_every = n;
        self
    }

    /// Reports [`PortError::Fault`] once `n` bytes have been sent.
    #[must_use]
    pub fn fault_after(mut self, n: usize) -> Self {
        self.fault_after = Some(n);
        self
    }
}

impl SerialPort for SimPort {
    fn transmit(&mut self, byte: u8) -> Result<(), PortError> {
        self.attempts += 1;
        if self.busy_every != 0 && self.attempts % self.busy_every == 0 {
            return Err(PortError::Busy);
        }
        if self.fault_after.is_some_and(|n| self.sent >= n) {
            return Err(PortError::Fault);
        }
        self.sent += 1;
        self.peer.on_byte(byte);
        Ok(())
    }

    /// Simulated ports only receive through the interrupt path.
    fn receive(&mut self) -> Result<u8, PortError> {
        Err(PortError::Fault)
    }
}

impl Drop for SimPort {
    fn drop(&mut self) {
        self.hung_up.store(true, Ordering::Release);
    }
}
