use crate::flash::{
    read_mapped, Bank, BankSwap, FlashController, FlashFault, Geometry, PhysicalPage, ERASED,
    PAGE_SIZE, QUAD_WORD,
};
use tracing::trace;

/// Controller operations, in the order [`SimFlash`] saw them. Reads are not
/// recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashOp {
    Unlock,
    Lock,
    ClearFlags,
    Erase(PhysicalPage),
    Program(u32),
    Wait,
    ProgramOptions(u32),
}

/// Two banks of flash in memory, behaving like the real controller: pages
/// must be erased before they are programmed, programming needs the
/// controller unlocked, and the bank swap option only takes effect after
/// [`SimFlash::reset`].
pub struct SimFlash {
    geometry: Geometry,
    banks: [Vec<u8>; 2],
    options: u32,
    pending_options: Option<u32>,
    locked: bool,
    ops: Vec<FlashOp>,
    fail_program_at: Option<u32>,
    fail_erase: Option<PhysicalPage>,
}

impl SimFlash {
    #[must_use]
    pub fn new(geometry: Geometry) -> Self {
        let bank = vec![ERASED; geometry.bank_size() as usize];
        Self {
            geometry,
            banks: [bank.clone(), bank],
            options: 0,
            pending_options: None,
            locked: true,
            ops: Vec::new(),
            fail_program_at: None,
            fail_erase: None,
        }
    }

    /// Makes programming the quad-word at `address` fail.
    pub fn fail_program_at(&mut self, address: u32) {
        self.fail_program_at = Some(address);
    }

    /// Makes erasing `page` fail.
    pub fn fail_erase_of(&mut self, page: PhysicalPage) {
        self.fail_erase = Some(page);
    }

    pub fn ops(&self) -> &[FlashOp] {
        &self.ops
    }

    pub fn clear_ops(&mut self) {
        self.ops.clear();
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Simulates a system reset, loading any newly programmed option bytes.
    pub fn reset(&mut self) {
        if let Some(options) = self.pending_options.take() {
            self.options = options;
        }
        self.locked = true;
    }

    /// Option bytes that will be loaded at the next reset.
    #[must_use]
    pub fn pending_options(&self) -> Option<u32> {
        self.pending_options
    }

    #[must_use]
    pub fn physical_page(&self, bank: Bank, page: u32) -> &[u8] {
        let start = page as usize * PAGE_SIZE;
        &self.banks[bank_index(bank)][start..start + PAGE_SIZE]
    }

    /// Bank and byte offset currently mapped at `address`.
    fn locate(&self, address: u32) -> Option<(usize, usize)> {
        let offset = address.checked_sub(self.geometry.base)?;
        let logical = offset / PAGE_SIZE as u32;
        let swap = BankSwap::from_user_options(self.options);
        let phys = self.geometry.resolve(logical, swap).ok()?;
        let at = phys.page as usize * PAGE_SIZE + (offset as usize % PAGE_SIZE);
        Some((bank_index(phys.bank), at))
    }

    fn check_unlocked(&self) -> Result<(), FlashFault> {
        if self.locked {
            Err(FlashFault::Locked)
        } else {
            Ok(())
        }
    }
}

fn bank_index(bank: Bank) -> usize {
    match bank {
        Bank::Bank1 => 0,
        Bank::Bank2 => 1,
    }
}

impl FlashController for SimFlash {
    fn unlock(&mut self) -> Result<(), FlashFault> {
        self.ops.push(FlashOp::Unlock);
        self.locked = false;
        Ok(())
    }

    fn lock(&mut self) {
        self.ops.push(FlashOp::Lock);
        self.locked = true;
    }

    fn clear_error_flags(&mut self) {
        self.ops.push(FlashOp::ClearFlags);
    }

    fn erase(&mut self, page: PhysicalPage) -> Result<(), FlashFault> {
        self.ops.push(FlashOp::Erase(page));
        self.check_unlocked()?;
        if page.page >= self.geometry.pages_per_bank {
            return Err(FlashFault::Operation);
        }
        if self.fail_erase == Some(page) {
            return Err(FlashFault::Operation);
        }
        let start = page.page as usize * PAGE_SIZE;
        self.banks[bank_index(page.bank)][start..start + PAGE_SIZE].fill(ERASED);
        trace!(?page, "sim erase");
        Ok(())
    }

    fn program_quad_word(&mut self, address: u32, data: &[u8; QUAD_WORD]) -> Result<(), FlashFault> {
        self.ops.push(FlashOp::Program(address));
        self.check_unlocked()?;
        if address as usize % QUAD_WORD != 0 {
            return Err(FlashFault::ProgrammingAlignment);
        }
        if self.fail_program_at == Some(address) {
            return Err(FlashFault::Programming);
        }
        let (bank, at) = self.locate(address).ok_or(FlashFault::Size)?;
        let target = &mut self.banks[bank][at..at + QUAD_WORD];
        if target.iter().any(|&b| b != ERASED) {
            return Err(FlashFault::Programming);
        }
        target.copy_from_slice(data);
        Ok(())
    }

    fn wait_for_last_operation(&mut self) -> Result<(), FlashFault> {
        self.ops.push(FlashOp::Wait);
        Ok(())
    }

    fn read(&mut self, address: u32, out: &mut [u8]) {
        let mut done = 0;
        while done < out.len() {
            let Some((bank, at)) = self.locate(address + done as u32) else {
                out[done..].fill(0);
                return;
            };
            let n = (PAGE_SIZE - at % PAGE_SIZE).min(out.len() - done);
            let src = self.banks[bank][at..at + n].as_ptr();
            // Safety: `src..src + n` lies within the bank's backing vector.
            unsafe { read_mapped(src, &mut out[done..done + n]) };
            done += n;
        }
    }

    fn user_options(&mut self) -> u32 {
        self.options
    }

    fn program_user_options(&mut self, options: u32) -> Result<(), FlashFault> {
        self.ops.push(FlashOp::ProgramOptions(options));
        self.check_unlocked()?;
        self.pending_options = Some(options);
        Ok(())
    }
}

impl core::fmt::Debug for SimFlash {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SimFlash")
            .field("geometry", &self.geometry)
            .field("options", &self.options)
            .field("pending_options", &self.pending_options)
            .field("locked", &self.locked)
            .field("ops", &self.ops.len())
            .finish()
    }
}
