//! Serial channels
//!
//! Each UART the upgrade logic talks to is a *channel*: a small integer
//! [`ChannelId`], the [`HwHandle`] its interrupt handler knows it by, and a
//! dedicated [`RxRing`] that the receive-complete interrupt fills.
//!
//! The [`ChannelRegistry`] is shared between the interrupt path
//! ([`ChannelRegistry::on_rx_complete`]) and the foreground
//! [`SerialTransport`], which owns the blocking [`SerialPort`] drivers.

use crate::isr::Isr;
use core::{fmt, time::Duration};
use rxring::RxRing;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

////////////////////////////////////////////////////////////////////////////////
// Channel and Hardware Types
////////////////////////////////////////////////////////////////////////////////

/// Small integer naming a registered serial channel. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(u8);

impl ChannelId {
    #[must_use]
    pub const fn new(id: u8) -> Option<Self> {
        if id == 0 {
            None
        } else {
            Some(Self(id))
        }
    }

    /// Like [`ChannelId::new`], for constants.
    ///
    /// # Panics
    ///
    /// If `id` is zero.
    #[must_use]
    #[track_caller]
    pub const fn from_const(id: u8) -> Self {
        match Self::new(id) {
            Some(id) => id,
            None => panic!("channel ids start at 1"),
        }
    }

    #[must_use]
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "uart{}", self.0)
    }
}

/// The identity of a serial peripheral as seen from its interrupt handler.
///
/// On hardware this is the peripheral's register block address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HwHandle(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    /// The peripheral is busy with a previous transfer. Retrying is expected
    /// to succeed.
    Busy,
    /// The peripheral reported an error (framing, overrun, noise...).
    Fault,
}

/// Blocking byte primitives of a UART driver.
pub trait SerialPort {
    fn transmit(&mut self, byte: u8) -> Result<(), PortError>;

    /// Blocks in the driver until one byte has been received.
    fn receive(&mut self) -> Result<u8, PortError>;
}

/// A monotonic time source, used to bound receive waits.
pub trait Clock {
    /// Time elapsed since some fixed point.
    fn now(&self) -> Duration;

    /// Called on every iteration of a busy-wait.
    #[inline]
    fn relax(&self) {
        core::hint::spin_loop();
    }
}

/// [`Clock`] backed by [`std::time::Instant`].
#[cfg(any(test, feature = "use-std"))]
#[derive(Debug, Clone, Copy)]
pub struct StdClock(std::time::Instant);

#[cfg(any(test, feature = "use-std"))]
impl StdClock {
    #[must_use]
    pub fn new() -> Self {
        Self(std::time::Instant::now())
    }
}

#[cfg(any(test, feature = "use-std"))]
impl Default for StdClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(any(test, feature = "use-std"))]
impl Clock for StdClock {
    fn now(&self) -> Duration {
        self.0.elapsed()
    }

    fn relax(&self) {
        std::thread::yield_now();
    }
}

/// How long a buffered read may wait for bytes to arrive.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RxTimeout {
    /// Wait until the bytes arrive, however long that takes.
    #[default]
    Forever,
    /// Give up once no progress has been made for this long.
    After(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialError {
    /// No channel with this id was registered, or it has no port attached
    UnknownChannel(ChannelId),
    /// The peripheral reported a hardware fault
    Hardware(ChannelId),
    /// The receive timeout elapsed. `received` bytes had been collected.
    Timeout {
        channel: ChannelId,
        wanted: usize,
        received: usize,
    },
}

impl fmt::Display for SerialError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownChannel(ch) => write!(f, "no serial channel {ch}"),
            Self::Hardware(ch) => write!(f, "hardware fault on {ch}"),
            Self::Timeout {
                channel,
                wanted,
                received,
            } => write!(
                f,
                "timed out on {channel} after receiving {received} of {wanted} bytes"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// The id is larger than the number of channels the registry was sized for
    InvalidId(ChannelId),
    /// The id or the hardware handle is already registered
    DuplicateItem,
    /// Every slot is in use
    RegistryFull,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidId(id) => write!(f, "channel id {} out of range", id.get()),
            Self::DuplicateItem => f.write_str("channel or hardware handle already registered"),
            Self::RegistryFull => f.write_str("channel registry is full"),
        }
    }
}

#[cfg(any(test, feature = "use-std"))]
impl std::error::Error for SerialError {}

#[cfg(any(test, feature = "use-std"))]
impl std::error::Error for RegistryError {}

////////////////////////////////////////////////////////////////////////////////
// Channel Registry
////////////////////////////////////////////////////////////////////////////////

struct Channel<const CAP: usize> {
    id: ChannelId,
    hw: HwHandle,
    ring: RxRing<CAP>,
}

/// Up to `N` channels, each with a `CAP`-byte receive ring.
///
/// Channels are registered once at startup, through `&mut self`, before the
/// registry is shared with interrupt handlers. They are never removed.
pub struct ChannelRegistry<const N: usize, const CAP: usize = { rxring::DEFAULT_CAPACITY }> {
    channels: heapless::Vec<Channel<CAP>, N>,
}

impl<const N: usize, const CAP: usize> ChannelRegistry<N, CAP> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            channels: heapless::Vec::new(),
        }
    }

    /// Binds `hw` to `id`. Ids run from 1 to `N`.
    pub fn register(&mut self, id: ChannelId, hw: HwHandle) -> Result<(), RegistryError> {
        if usize::from(id.get()) > N {
            return Err(RegistryError::InvalidId(id));
        }
        if self.channels.iter().any(|ch| ch.id == id || ch.hw == hw) {
            return Err(RegistryError::DuplicateItem);
        }
        self.channels
            .push(Channel {
                id,
                hw,
                ring: RxRing::new(),
            })
            .map_err(|_| RegistryError::RegistryFull)?;
        debug!(channel = %id, ?hw, "registered serial channel");
        Ok(())
    }

    #[must_use]
    pub fn channel_of(&self, hw: HwHandle) -> Option<ChannelId> {
        self.channels.iter().find(|ch| ch.hw == hw).map(|ch| ch.id)
    }

    #[must_use]
    pub fn handle_of(&self, id: ChannelId) -> Option<HwHandle> {
        self.find(id).map(|ch| ch.hw)
    }

    #[must_use]
    pub fn ring(&self, id: ChannelId) -> Option<&RxRing<CAP>> {
        self.find(id).map(|ch| &ch.ring)
    }

    /// Receive-complete interrupt entry point.
    ///
    /// Stores `bytes` in the ring of the channel bound to `hw` and returns how
    /// many fit. Bytes that did not fit are lost unless the caller retries.
    pub fn on_rx_complete(&self, hw: HwHandle, bytes: &[u8]) -> usize {
        let _isr = Isr::enter();
        let Some(ch) = self.channels.iter().find(|ch| ch.hw == hw) else {
            warn!(?hw, len = bytes.len(), "receive interrupt for unregistered port");
            return 0;
        };
        let stored = ch.ring.put(bytes);
        if stored < bytes.len() {
            trace!(
                channel = %ch.id,
                stored,
                dropped = bytes.len() - stored,
                "receive ring full"
            );
        }
        stored
    }

    fn find(&self, id: ChannelId) -> Option<&Channel<CAP>> {
        self.channels.iter().find(|ch| ch.id == id)
    }
}

impl<const N: usize, const CAP: usize> Default for ChannelRegistry<N, CAP> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize, const CAP: usize> fmt::Debug for ChannelRegistry<N, CAP> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(
                self.channels
                    .iter()
                    .map(|ch| (ch.id, ch.hw, ch.ring.len())),
            )
            .finish()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Transport
////////////////////////////////////////////////////////////////////////////////

/// Foreground serial operations, addressed by channel id.
pub trait Transport {
    /// Transmits every byte of `bytes`, retrying indefinitely while the port
    /// is busy.
    fn blocking_write(&mut self, channel: ChannelId, bytes: &[u8]) -> Result<usize, SerialError>;

    /// Reads exactly `buf.len()` bytes straight from the port. On failure the
    /// contents of `buf` are unspecified.
    fn blocking_read(&mut self, channel: ChannelId, buf: &mut [u8]) -> Result<usize, SerialError>;

    /// Busy-polls the channel's receive ring until `buf` is full.
    fn buffered_read(&mut self, channel: ChannelId, buf: &mut [u8]) -> Result<usize, SerialError>;

    /// Busy-polls until at least `n` bytes are waiting in the receive ring.
    fn wait_buffered(&mut self, channel: ChannelId, n: usize) -> Result<(), SerialError>;

    fn buffered_len(&self, channel: ChannelId) -> Result<usize, SerialError>;

    /// Discards everything waiting in the receive ring.
    fn clear_buffered(&mut self, channel: ChannelId) -> Result<(), SerialError>;

    /// Sets how long buffered reads may wait. Transports that cannot tell
    /// time ignore this and always wait forever.
    fn set_timeout(&mut self, timeout: RxTimeout) {
        let _ = timeout;
    }
}

/// The [`Transport`] used by the firmware: ports owned here, rings borrowed
/// from the registry.
pub struct SerialTransport<'r, P, C, const N: usize, const CAP: usize = { rxring::DEFAULT_CAPACITY }> {
    registry: &'r ChannelRegistry<N, CAP>,
    ports: heapless::Vec<(ChannelId, P), N>,
    clock: C,
    timeout: RxTimeout,
}

impl<'r, P, C, const N: usize, const CAP: usize> SerialTransport<'r, P, C, N, CAP>
where
    P: SerialPort,
    C: Clock,
{
    pub fn new(registry: &'r ChannelRegistry<N, CAP>, clock: C) -> Self {
        Self {
            registry,
            ports: heapless::Vec::new(),
            clock,
            timeout: RxTimeout::Forever,
        }
    }

    #[must_use]
    pub fn with_timeout(self, timeout: RxTimeout) -> Self {
        Self { timeout, ..self }
    }

    #[must_use]
    pub fn registry(&self) -> &'r ChannelRegistry<N, CAP> {
        self.registry
    }

    /// Attaches the driver for an already registered channel.
    pub fn attach(&mut self, channel: ChannelId, port: P) -> Result<(), RegistryError> {
        if self.registry.handle_of(channel).is_none() {
            return Err(RegistryError::InvalidId(channel));
        }
        if self.ports.iter().any(|(id, _)| *id == channel) {
            return Err(RegistryError::DuplicateItem);
        }
        self.ports
            .push((channel, port))
            .map_err(|_| RegistryError::RegistryFull)
    }

    pub fn port_mut(&mut self, channel: ChannelId) -> Option<&mut P> {
        self.ports
            .iter_mut()
            .find(|(id, _)| *id == channel)
            .map(|(_, port)| port)
    }

    fn ring(&self, channel: ChannelId) -> Result<&'r RxRing<CAP>, SerialError> {
        self.registry
            .ring(channel)
            .ok_or(SerialError::UnknownChannel(channel))
    }

    /// Spins until `done` returns true, or the timeout elapses without
    /// `progress` changing.
    fn spin(
        &self,
        channel: ChannelId,
        wanted: usize,
        mut poll: impl FnMut() -> usize,
    ) -> Result<(), SerialError> {
        let mut last = poll();
        let mut since = self.clock.now();
        while last < wanted {
            self.clock.relax();
            let now = poll();
            if now != last {
                last = now;
                since = self.clock.now();
                continue;
            }
            if let RxTimeout::After(limit) = self.timeout {
                if self.clock.now().saturating_sub(since) >= limit {
                    return Err(SerialError::Timeout {
                        channel,
                        wanted,
                        received: last,
                    });
                }
            }
        }
        Ok(())
    }
}

impl<'r, P, C, const N: usize, const CAP: usize> Transport for SerialTransport<'r, P, C, N, CAP>
where
    P: SerialPort,
    C: Clock,
{
    fn set_timeout(&mut self, timeout: RxTimeout) {
        self.timeout = timeout;
    }

    fn blocking_write(&mut self, channel: ChannelId, bytes: &[u8]) -> Result<usize, SerialError> {
        debug_assert!(!Isr::is_in_isr(), "blocking write from interrupt context");
        let port = self
            .port_mut(channel)
            .ok_or(SerialError::UnknownChannel(channel))?;
        for &byte in bytes {
            loop {
                match port.transmit(byte) {
                    Ok(()) => break,
                    Err(PortError::Busy) => core::hint::spin_loop(),
                    Err(PortError::Fault) => {
                        warn!(%channel, "transmit fault");
                        return Err(SerialError::Hardware(channel));
                    }
                }
            }
        }
        trace!(%channel, len = bytes.len(), "sent");
        Ok(bytes.len())
    }

    fn blocking_read(&mut self, channel: ChannelId, buf: &mut [u8]) -> Result<usize, SerialError> {
        debug_assert!(!Isr::is_in_isr(), "blocking read from interrupt context");
        let port = self
            .port_mut(channel)
            .ok_or(SerialError::UnknownChannel(channel))?;
        for slot in buf.iter_mut() {
            *slot = port.receive().map_err(|_| {
                warn!(%channel, "receive fault");
                SerialError::Hardware(channel)
            })?;
        }
        Ok(buf.len())
    }

    fn buffered_read(&mut self, channel: ChannelId, buf: &mut [u8]) -> Result<usize, SerialError> {
        debug_assert!(!Isr::is_in_isr(), "buffered read from interrupt context");
        let ring = self.ring(channel)?;
        let mut filled = 0;
        self.spin(channel, buf.len(), || {
            filled += ring.get(&mut buf[filled..]);
            filled
        })?;
        Ok(filled)
    }

    fn wait_buffered(&mut self, channel: ChannelId, n: usize) -> Result<(), SerialError> {
        debug_assert!(!Isr::is_in_isr(), "buffered wait from interrupt context");
        let ring = self.ring(channel)?;
        self.spin(channel, n, || ring.len())
    }

    fn buffered_len(&self, channel: ChannelId) -> Result<usize, SerialError> {
        Ok(self.ring(channel)?.len())
    }

    fn clear_buffered(&mut self, channel: ChannelId) -> Result<(), SerialError> {
        self.ring(channel)?.clear();
        Ok(())
    }
}
