//! Dual-bank flash
//!
//! Callers address flash by *logical* page: page `p` always means the same
//! range of the CPU's address map, whichever physical bank currently sits
//! there. Only erase needs the physical `(bank, page)` pair, which
//! [`Geometry::resolve`] computes from the current [`BankSwap`] state.
//!
//! Every erase and program goes through the same sequence: unlock the
//! controller, clear stale error flags, do the operation, wait for it to
//! finish, lock the controller. The lock happens on failure too.

use core::{fmt, ptr};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

/// Size of an erasable page.
pub const PAGE_SIZE: usize = 8 * 1024;
/// Smallest programmable unit.
pub const QUAD_WORD: usize = 16;
/// Required alignment of the data handed to a quad-word program.
pub const SOURCE_ALIGN: usize = 4;
/// Value of every byte of an erased page.
pub const ERASED: u8 = 0xFF;

/// `SWAP_BANK` bit of the USER option bytes.
pub const SWAP_BANK_OPTION: u32 = 1 << 20;

////////////////////////////////////////////////////////////////////////////////
// Geometry and Bank Resolution
////////////////////////////////////////////////////////////////////////////////

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Bank {
    Bank1,
    Bank2,
}

impl Bank {
    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::Bank1 => Self::Bank2,
            Self::Bank2 => Self::Bank1,
        }
    }
}

/// Whether the two physical banks have traded places in the address map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BankSwap {
    NotSwapped,
    Swapped,
}

impl BankSwap {
    #[must_use]
    pub const fn from_user_options(options: u32) -> Self {
        if options & SWAP_BANK_OPTION != 0 {
            Self::Swapped
        } else {
            Self::NotSwapped
        }
    }

    /// Returns `options` with the swap bit set to match `self`.
    #[must_use]
    pub const fn apply_to(self, options: u32) -> u32 {
        match self {
            Self::Swapped => options | SWAP_BANK_OPTION,
            Self::NotSwapped => options & !SWAP_BANK_OPTION,
        }
    }

    #[must_use]
    pub const fn toggled(self) -> Self {
        match self {
            Self::Swapped => Self::NotSwapped,
            Self::NotSwapped => Self::Swapped,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PhysicalPage {
    pub bank: Bank,
    pub page: u32,
}

/// Layout of the flash array in the CPU address map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    /// Address of logical page 0.
    pub base: u32,
    /// Pages in each of the two banks.
    pub pages_per_bank: u32,
}

impl Geometry {
    /// 4 MiB part: two banks of 256 pages at `0x0800_0000`.
    pub const STM32U5_4M: Self = Self {
        base: 0x0800_0000,
        pages_per_bank: 256,
    };

    #[must_use]
    pub const fn total_pages(&self) -> u32 {
        self.pages_per_bank * 2
    }

    #[must_use]
    pub const fn bank_size(&self) -> u32 {
        self.pages_per_bank * PAGE_SIZE as u32
    }

    #[must_use]
    pub const fn size(&self) -> u32 {
        self.bank_size() * 2
    }

    /// First logical page of the second half of the address map, which is
    /// the bank that is *not* being executed from.
    #[must_use]
    pub const fn inactive_bank_start(&self) -> u32 {
        self.pages_per_bank
    }

    pub fn page_address(&self, logical: u32) -> Result<u32, FlashError> {
        self.check_page(logical)?;
        Ok(self.base + logical * PAGE_SIZE as u32)
    }

    /// Maps a logical page to the physical bank and page currently holding it.
    pub fn resolve(&self, logical: u32, swap: BankSwap) -> Result<PhysicalPage, FlashError> {
        self.check_page(logical)?;
        let k = self.pages_per_bank;
        let (lower, upper) = match swap {
            BankSwap::NotSwapped => (Bank::Bank1, Bank::Bank2),
            BankSwap::Swapped => (Bank::Bank2, Bank::Bank1),
        };
        Ok(if logical < k {
            PhysicalPage {
                bank: lower,
                page: logical,
            }
        } else {
            PhysicalPage {
                bank: upper,
                page: logical - k,
            }
        })
    }

    /// The inverse of [`Geometry::resolve`].
    pub fn logical(&self, physical: PhysicalPage, swap: BankSwap) -> Result<u32, FlashError> {
        if physical.page >= self.pages_per_bank {
            return Err(FlashError::InvalidPage(physical.page));
        }
        let in_lower_half = match swap {
            BankSwap::NotSwapped => physical.bank == Bank::Bank1,
            BankSwap::Swapped => physical.bank == Bank::Bank2,
        };
        Ok(if in_lower_half {
            physical.page
        } else {
            physical.page + self.pages_per_bank
        })
    }

    /// Checks that `len` bytes starting at `address` lie inside the array.
    pub fn check_range(&self, address: u32, len: usize) -> Result<(), FlashError> {
        let out_of_range = FlashError::OutOfRange { address, len };
        let len32 = u32::try_from(len).map_err(|_| out_of_range)?;
        let end = address.checked_add(len32).ok_or(out_of_range)?;
        if address < self.base || end > self.base + self.size() {
            return Err(out_of_range);
        }
        Ok(())
    }

    fn check_page(&self, logical: u32) -> Result<(), FlashError> {
        if logical >= self.total_pages() {
            return Err(FlashError::InvalidPage(logical));
        }
        Ok(())
    }
}

////////////////////////////////////////////////////////////////////////////////
// Errors
////////////////////////////////////////////////////////////////////////////////

/// Error flags reported by the flash controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashFault {
    Operation,
    Programming,
    WriteProtection,
    ProgrammingAlignment,
    Size,
    ProgrammingSequence,
    OptionWrite,
    /// The controller refused to unlock, or an operation was attempted while
    /// locked.
    Locked,
    /// The operation did not complete in time.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashError {
    /// Target address is not aligned to a quad-word
    UnalignedAddress(u32),
    /// Source data is not aligned to a 32-bit word
    UnalignedSource,
    /// The access would fall outside the flash array
    OutOfRange { address: u32, len: usize },
    /// There is no such page
    InvalidPage(u32),
    /// The buffer does not have the length this operation needs
    LengthMismatch { expected: usize, actual: usize },
    /// The controller reported a failure
    Hardware(FlashFault),
}

impl FlashError {
    /// `true` for errors raised before any hardware was touched.
    #[must_use]
    pub fn is_validation(&self) -> bool {
        !matches!(self, Self::Hardware(_))
    }
}

impl From<FlashFault> for FlashError {
    fn from(fault: FlashFault) -> Self {
        Self::Hardware(fault)
    }
}

impl fmt::Display for FlashError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnalignedAddress(addr) => {
                write!(f, "flash address {addr:#010x} is not {QUAD_WORD}-byte aligned")
            }
            Self::UnalignedSource => write!(f, "source data is not {SOURCE_ALIGN}-byte aligned"),
            Self::OutOfRange { address, len } => {
                write!(f, "{len} bytes at {address:#010x} fall outside flash")
            }
            Self::InvalidPage(page) => write!(f, "no flash page {page}"),
            Self::LengthMismatch { expected, actual } => {
                write!(f, "expected a {expected}-byte buffer, got {actual} bytes")
            }
            Self::Hardware(fault) => write!(f, "flash controller error: {fault:?}"),
        }
    }
}

#[cfg(any(test, feature = "use-std"))]
impl std::error::Error for FlashError {}

////////////////////////////////////////////////////////////////////////////////
// Controller Interface
////////////////////////////////////////////////////////////////////////////////

/// Register-level flash driver.
pub trait FlashController {
    fn unlock(&mut self) -> Result<(), FlashFault>;

    fn lock(&mut self);

    fn clear_error_flags(&mut self);

    fn erase(&mut self, page: PhysicalPage) -> Result<(), FlashFault>;

    /// Starts programming 16 bytes at `address`.
    fn program_quad_word(&mut self, address: u32, data: &[u8; QUAD_WORD]) -> Result<(), FlashFault>;

    fn wait_for_last_operation(&mut self) -> Result<(), FlashFault>;

    /// Copies flash contents starting at `address` into `out`.
    ///
    /// Implementations must not let these reads be elided or reordered
    /// around programming; see [`read_mapped`].
    fn read(&mut self, address: u32, out: &mut [u8]);

    /// Reads the USER option bytes word.
    fn user_options(&mut self) -> u32;

    /// Programs the USER option bytes word, including the option-byte unlock
    /// and launch sequence. The new value takes effect at the next reset.
    fn program_user_options(&mut self, options: u32) -> Result<(), FlashFault>;
}

/// Copies `out.len()` bytes from memory-mapped flash at `src` with volatile
/// reads.
///
/// # Safety
///
/// `src..src + out.len()` must be readable memory for the duration of the
/// call.
pub unsafe fn read_mapped(src: *const u8, out: &mut [u8]) {
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = ptr::read_volatile(src.add(i));
    }
}

#[repr(C, align(16))]
struct QuadWord([u8; QUAD_WORD]);

////////////////////////////////////////////////////////////////////////////////
// Flash Manager
////////////////////////////////////////////////////////////////////////////////

pub struct FlashManager<F> {
    ctrl: F,
    geometry: Geometry,
}

impl<F: FlashController> FlashManager<F> {
    pub fn new(ctrl: F, geometry: Geometry) -> Self {
        Self { ctrl, geometry }
    }

    #[must_use]
    pub fn geometry(&self) -> Geometry {
        self.geometry
    }

    pub fn controller(&self) -> &F {
        &self.ctrl
    }

    pub fn controller_mut(&mut self) -> &mut F {
        &mut self.ctrl
    }

    pub fn into_controller(self) -> F {
        self.ctrl
    }

    /// Reads the swap state from the option bytes.
    pub fn banks_swapped(&mut self) -> BankSwap {
        BankSwap::from_user_options(self.ctrl.user_options())
    }

    pub fn resolve(&mut self, logical: u32) -> Result<PhysicalPage, FlashError> {
        let swap = self.banks_swapped();
        self.geometry.resolve(logical, swap)
    }

    pub fn erase_page(&mut self, logical: u32) -> Result<(), FlashError> {
        let physical = self.resolve(logical)?;
        trace!(logical, ?physical, "erase");
        self.unlocked(|ctrl| ctrl.erase(physical))
            .map_err(|error| {
                warn!(logical, ?physical, %error, "page erase failed");
                error
            })
    }

    /// Programs one quad-word. `address` must be 16-byte aligned and `data`
    /// must sit at a 4-byte aligned address.
    pub fn write_quad(&mut self, address: u32, data: &[u8; QUAD_WORD]) -> Result<(), FlashError> {
        if address as usize % QUAD_WORD != 0 {
            return Err(FlashError::UnalignedAddress(address));
        }
        if data.as_ptr() as usize % SOURCE_ALIGN != 0 {
            return Err(FlashError::UnalignedSource);
        }
        self.geometry.check_range(address, QUAD_WORD)?;
        self.unlocked(|ctrl| ctrl.program_quad_word(address, data))
    }

    /// Programs a whole, previously erased, page.
    ///
    /// Stops at the first quad-word that fails; the page is then left
    /// partially written.
    pub fn write_page(&mut self, logical: u32, buf: &[u8]) -> Result<(), FlashError> {
        if buf.len() != PAGE_SIZE {
            return Err(FlashError::LengthMismatch {
                expected: PAGE_SIZE,
                actual: buf.len(),
            });
        }
        let address = self.geometry.page_address(logical)?;
        self.write_quads(address, buf)
    }

    /// Programs `data` starting at `address`. `data.len()` must be a
    /// multiple of [`QUAD_WORD`]; the target must already be erased.
    pub fn write_large(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        if data.len() % QUAD_WORD != 0 {
            return Err(FlashError::LengthMismatch {
                expected: data.len().next_multiple_of(QUAD_WORD),
                actual: data.len(),
            });
        }
        if address as usize % QUAD_WORD != 0 {
            return Err(FlashError::UnalignedAddress(address));
        }
        self.geometry.check_range(address, data.len())?;
        self.write_quads(address, data)
    }

    pub fn read_page(&mut self, logical: u32, out: &mut [u8]) -> Result<(), FlashError> {
        if out.len() != PAGE_SIZE {
            return Err(FlashError::LengthMismatch {
                expected: PAGE_SIZE,
                actual: out.len(),
            });
        }
        let address = self.geometry.page_address(logical)?;
        self.ctrl.read(address, out);
        Ok(())
    }

    pub fn read(&mut self, address: u32, out: &mut [u8]) -> Result<(), FlashError> {
        self.geometry.check_range(address, out.len())?;
        self.ctrl.read(address, out);
        Ok(())
    }

    /// Flips the bank swap option bit, returning the state that will be
    /// active after the next reset.
    ///
    /// This is how a new image written to the inactive bank is activated.
    pub fn swap_banks(&mut self) -> Result<BankSwap, FlashError> {
        let options = self.ctrl.user_options();
        let next = BankSwap::from_user_options(options).toggled();
        self.unlocked(|ctrl| ctrl.program_user_options(next.apply_to(options)))?;
        info!(?next, "bank swap option programmed");
        Ok(next)
    }

    fn write_quads(&mut self, address: u32, data: &[u8]) -> Result<(), FlashError> {
        let mut quad = QuadWord([0; QUAD_WORD]);
        for (i, chunk) in data.chunks_exact(QUAD_WORD).enumerate() {
            quad.0.copy_from_slice(chunk);
            let at = address + (i * QUAD_WORD) as u32;
            self.write_quad(at, &quad.0).map_err(|error| {
                warn!(address = at, %error, "quad-word program failed");
                error
            })?;
        }
        debug!(address, len = data.len(), "programmed");
        Ok(())
    }

    /// Runs `op` with the controller unlocked and its error flags cleared,
    /// then waits for completion and locks it again.
    fn unlocked<T>(
        &mut self,
        op: impl FnOnce(&mut F) -> Result<T, FlashFault>,
    ) -> Result<T, FlashError> {
        if let Err(fault) = self.ctrl.unlock() {
            self.ctrl.lock();
            return Err(fault.into());
        }
        self.ctrl.clear_error_flags();
        let res = op(&mut self.ctrl);
        let done = self.ctrl.wait_for_last_operation();
        self.ctrl.lock();
        let out = res?;
        done?;
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::{FlashOp, SimFlash};
    use proptest::prelude::*;

    const GEOM: Geometry = Geometry {
        base: 0x0800_0000,
        pages_per_bank: 4,
    };

    fn manager() -> FlashManager<SimFlash> {
        FlashManager::new(SimFlash::new(GEOM), GEOM)
    }

    fn pattern(seed: u8) -> Vec<u8> {
        (0..PAGE_SIZE).map(|i| (i as u8).wrapping_mul(31) ^ seed).collect()
    }

    #[test]
    fn resolve_follows_swap() {
        let g = Geometry::STM32U5_4M;
        assert_eq!(
            g.resolve(10, BankSwap::NotSwapped),
            Ok(PhysicalPage {
                bank: Bank::Bank1,
                page: 10
            })
        );
        assert_eq!(
            g.resolve(300, BankSwap::NotSwapped),
            Ok(PhysicalPage {
                bank: Bank::Bank2,
                page: 44
            })
        );
        assert_eq!(
            g.resolve(10, BankSwap::Swapped),
            Ok(PhysicalPage {
                bank: Bank::Bank2,
                page: 10
            })
        );
        assert_eq!(g.resolve(512, BankSwap::Swapped), Err(FlashError::InvalidPage(512)));
        assert_eq!(g.page_address(128), Ok(0x0810_0000));
    }

    proptest! {
        #[test]
        fn resolution_is_a_bijection(k in 1u32..300, swapped in any::<bool>()) {
            let g = Geometry { base: 0x0800_0000, pages_per_bank: k };
            let swap = if swapped { BankSwap::Swapped } else { BankSwap::NotSwapped };
            let mut seen = std::collections::HashSet::new();
            for p in 0..2 * k {
                let phys = g.resolve(p, swap).unwrap();
                prop_assert!(phys.page < k);
                prop_assert!(seen.insert(phys));
                prop_assert_eq!(g.logical(phys, swap), Ok(p));

                // Toggling the swap moves the page to the other bank, same slot.
                let flipped = g.resolve(p, swap.toggled()).unwrap();
                prop_assert_eq!(flipped.bank, phys.bank.other());
                prop_assert_eq!(flipped.page, phys.page);
            }
            prop_assert_eq!(seen.len() as u32, 2 * k);
        }
    }

    #[test]
    fn validation_never_touches_hardware() {
        let mut fm = manager();
        let aligned = QuadWord([0xA5; QUAD_WORD]);

        assert_eq!(
            fm.write_quad(0x0800_0008, &aligned.0),
            Err(FlashError::UnalignedAddress(0x0800_0008))
        );
        assert_eq!(
            fm.write_quad(0x0700_0000, &aligned.0),
            Err(FlashError::OutOfRange {
                address: 0x0700_0000,
                len: QUAD_WORD
            })
        );
        let end = GEOM.base + GEOM.size();
        assert!(matches!(
            fm.write_quad(end, &aligned.0),
            Err(FlashError::OutOfRange { .. })
        ));

        let backing = [QuadWord([0; QUAD_WORD]), QuadWord([0; QUAD_WORD])];
        let bytes: &[u8; 2 * QUAD_WORD] = unsafe { &*backing.as_ptr().cast() };
        let unaligned: &[u8; QUAD_WORD] = bytes[1..=QUAD_WORD].try_into().unwrap();
        assert_eq!(
            fm.write_quad(GEOM.base, unaligned),
            Err(FlashError::UnalignedSource)
        );

        assert_eq!(
            fm.write_page(0, &[0u8; 100]),
            Err(FlashError::LengthMismatch {
                expected: PAGE_SIZE,
                actual: 100
            })
        );
        assert_eq!(fm.erase_page(8), Err(FlashError::InvalidPage(8)));
        assert!(fm.write_page(0, &[0u8; 100]).unwrap_err().is_validation());

        assert!(fm.controller().ops().is_empty());
    }

    #[test]
    fn every_mutation_is_bracketed() {
        let mut fm = manager();
        fm.erase_page(1).unwrap();
        fm.write_quad(GEOM.base + PAGE_SIZE as u32, &QuadWord([1; QUAD_WORD]).0)
            .unwrap();

        let ops = fm.controller().ops();
        assert_eq!(
            ops,
            &[
                FlashOp::Unlock,
                FlashOp::ClearFlags,
                FlashOp::Erase(PhysicalPage {
                    bank: Bank::Bank1,
                    page: 1
                }),
                FlashOp::Wait,
                FlashOp::Lock,
                FlashOp::Unlock,
                FlashOp::ClearFlags,
                FlashOp::Program(GEOM.base + PAGE_SIZE as u32),
                FlashOp::Wait,
                FlashOp::Lock,
            ]
        );
        assert!(fm.controller().is_locked());
    }

    #[test]
    fn failed_program_still_locks_and_aborts_page() {
        let mut fm = manager();
        fm.erase_page(0).unwrap();
        let fail_at = GEOM.base + 3 * QUAD_WORD as u32;
        fm.controller_mut().fail_program_at(fail_at);
        fm.controller_mut().clear_ops();

        assert_eq!(
            fm.write_page(0, &pattern(1)),
            Err(FlashError::Hardware(FlashFault::Programming))
        );
        assert!(fm.controller().is_locked());

        let programs: Vec<_> = fm
            .controller()
            .ops()
            .iter()
            .filter(|op| matches!(op, FlashOp::Program(_)))
            .collect();
        assert_eq!(programs.len(), 4, "nothing after the failing quad-word");
        assert_eq!(fm.controller().ops().last(), Some(&FlashOp::Lock));
    }

    #[test]
    fn write_then_read_round_trips() {
        let mut fm = manager();
        let data = pattern(7);
        fm.erase_page(5).unwrap();
        fm.write_page(5, &data).unwrap();

        let mut out = vec![0u8; PAGE_SIZE];
        fm.read_page(5, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn round_trip_with_swapped_banks() {
        let mut fm = manager();
        fm.swap_banks().unwrap();
        fm.controller_mut().reset();
        assert_eq!(fm.banks_swapped(), BankSwap::Swapped);

        let data = pattern(3);
        fm.erase_page(2).unwrap();
        fm.write_page(2, &data).unwrap();

        let mut out = vec![0u8; PAGE_SIZE];
        fm.read_page(2, &mut out).unwrap();
        assert_eq!(out, data);
        assert_eq!(fm.controller().physical_page(Bank::Bank2, 2), &data[..]);
    }

    #[test]
    fn erase_is_idempotent() {
        let mut fm = manager();
        fm.erase_page(3).unwrap();
        fm.write_page(3, &pattern(9)).unwrap();

        let mut out = vec![0u8; PAGE_SIZE];
        for _ in 0..2 {
            fm.erase_page(3).unwrap();
            fm.read_page(3, &mut out).unwrap();
            assert!(out.iter().all(|&b| b == ERASED));
        }
    }

    #[test]
    fn write_large_needs_whole_quads() {
        let mut fm = manager();
        fm.erase_page(0).unwrap();
        assert_eq!(
            fm.write_large(GEOM.base, &[0u8; 20]),
            Err(FlashError::LengthMismatch {
                expected: 32,
                actual: 20
            })
        );
        fm.write_large(GEOM.base, &[0x42; 48]).unwrap();
        let mut out = [0u8; 64];
        fm.read(GEOM.base, &mut out).unwrap();
        assert!(out[..48].iter().all(|&b| b == 0x42));
        assert!(out[48..].iter().all(|&b| b == ERASED));
    }
}
