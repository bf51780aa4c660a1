//! Remote pages: allocation, transfer and protection.

use scopeguard::{guard, ScopeGuard};

use crate::platform::{ProcessMemory, Protection, PAGE_SIZE};
use crate::staging::{RemoteTargets, StagingBuffer};
use crate::{invariant, Error};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProtectionState {
    /// Everything is read/write; nothing has been transferred yet.
    Writable,
    /// Code is execute/read and the data page read only.
    Narrowed,
}

/// Pages allocated in the target process.
///
/// Dropping this does not free anything, the pages belong to the target once
/// code runs in them. Use `free` once the remote thread has exited.
#[derive(Debug, Eq, PartialEq)]
pub struct RemoteAllocation {
    code_base: u64,
    data_base: u64,
    page_count: usize,
    state: ProtectionState,
}

impl RemoteAllocation {
    pub fn code_base(&self) -> u64 {
        self.code_base
    }

    pub fn data_base(&self) -> u64 {
        self.data_base
    }

    pub fn page_count(&self) -> usize {
        self.page_count
    }

    pub fn state(&self) -> ProtectionState {
        self.state
    }

    pub fn size(&self) -> usize {
        self.page_count * PAGE_SIZE
    }

    pub fn targets(&self) -> RemoteTargets {
        RemoteTargets {
            code_base: self.code_base,
            data_base: self.data_base,
        }
    }

    /// Frees the pages.
    pub fn free<P: ProcessMemory + ?Sized>(self, process: &P) -> Result<(), Error> {
        debug!("Freeing {} pages at {:#x}", self.page_count, self.code_base);
        process.free_pages(self.code_base)
    }

    /// Frees the pages while rolling back a failed injection, where a second
    /// error can only be logged.
    pub(crate) fn release<P: ProcessMemory + ?Sized>(self, process: &P) {
        let base = self.code_base;
        if let Err(e) = self.free(process) {
            error!("Could not free remote pages at {:#x}: {}", base, e);
        }
    }
}

/// Allocates `page_count` read/write pages in the target.
pub fn reserve<P: ProcessMemory + ?Sized>(
    process: &P,
    page_count: usize,
) -> Result<RemoteAllocation, Error> {
    if page_count < 2 {
        return Err(Error::InvalidParameter("page count"));
    }
    let size = page_count * PAGE_SIZE;
    let code_base = process.allocate_pages(size, Protection::ReadWrite)?;
    let allocation = RemoteAllocation {
        code_base,
        data_base: code_base + PAGE_SIZE as u64,
        page_count,
        state: ProtectionState::Writable,
    };
    if code_base as usize & (PAGE_SIZE - 1) != 0 {
        allocation.release(process);
        return invariant(format!("Remote allocation {:#x} is not page aligned", code_base));
    }
    debug!("Reserved {} pages at {:#x}", page_count, code_base);
    Ok(allocation)
}

/// Writes the relocated `staging` buffer to `allocation` and narrows its
/// protections: the code page becomes execute/read, the data page read only.
///
/// On failure the allocation is freed.
pub fn materialize<P: ProcessMemory + ?Sized>(
    process: &P,
    allocation: RemoteAllocation,
    staging: &StagingBuffer,
) -> Result<RemoteAllocation, Error> {
    let mut allocation = guard(allocation, |a| a.release(process));
    if allocation.state != ProtectionState::Writable {
        return invariant("Remote pages were already materialized");
    }
    if !staging.is_relocated() {
        return invariant("Staging buffer has not been relocated");
    }
    if staging.len() != allocation.size() {
        return invariant(format!(
            "Staging buffer is {:#x} bytes, remote allocation {:#x}",
            staging.len(), allocation.size(),
        ));
    }
    process.write_bytes(allocation.code_base, staging.as_bytes())?;
    process.set_protection(allocation.code_base, PAGE_SIZE, Protection::ExecuteRead)?;
    if let Err(e) = process.flush_instruction_cache(allocation.code_base, PAGE_SIZE) {
        warn!("Could not flush instruction cache at {:#x}: {}", allocation.code_base, e);
    }
    process.set_protection(allocation.data_base, PAGE_SIZE, Protection::ReadOnly)?;
    allocation.state = ProtectionState::Narrowed;
    debug!(
        "Wrote {:#x} bytes to {:#x}, protections narrowed",
        staging.len(), allocation.code_base,
    );
    Ok(ScopeGuard::into_inner(allocation))
}
