//! Capabilities the engine needs from the injecting and the target process.
//!
//! Nothing in the engine calls the operating system directly; every platform
//! primitive is reached through one of these traits. The Windows implementations
//! live in `win`, and tests substitute in-memory fakes.

use std::time::Duration;

use byteorder::{ByteOrder, LittleEndian};

use crate::unwind::RuntimeFunction;
use crate::Error;

/// Page size of the targeted platform (x64 Windows).
pub const PAGE_SIZE: usize = 0x1000;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Protection {
    ReadWrite,
    ExecuteRead,
    ReadOnly,
}

/// A function table entry covering some address, along with the base address of
/// the image the entry's offsets are relative to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct FunctionEntry {
    pub image_base: u64,
    pub function: RuntimeFunction,
}

/// Read access to code of the injecting process, and its function table index.
pub trait CodeSource {
    /// Fills `out` with the bytes at `address`.
    fn read(&self, address: u64, out: &mut [u8]) -> Result<(), Error>;

    /// Finds the function table entry covering `address`.
    fn lookup_function_entry(&self, address: u64) -> Option<FunctionEntry>;

    fn read_u32(&self, address: u64) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.read(address, &mut buf)?;
        Ok(LittleEndian::read_u32(&buf))
    }

    fn read_u64(&self, address: u64) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read(address, &mut buf)?;
        Ok(LittleEndian::read_u64(&buf))
    }
}

/// Memory primitives of the target process.
pub trait ProcessMemory {
    /// Allocates `size` bytes of page-aligned memory.
    fn allocate_pages(&self, size: usize, protection: Protection) -> Result<u64, Error>;
    /// Writes all of `data`; partial writes are errors.
    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<(), Error>;
    fn set_protection(&self, address: u64, size: usize, protection: Protection)
        -> Result<(), Error>;
    fn flush_instruction_cache(&self, address: u64, size: usize) -> Result<(), Error>;
    /// Releases an allocation made by `allocate_pages`.
    fn free_pages(&self, address: u64) -> Result<(), Error>;
}

/// Handle and id of a thread in the target process.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RawThread {
    pub handle: u64,
    pub id: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WaitStatus {
    Signaled,
    TimedOut,
}

/// Thread primitives of the target process.
pub trait RemoteThreads {
    /// Starts a thread at `entry` with `argument` as its only parameter.
    fn create_remote_thread(&self, entry: u64, argument: u64) -> Result<RawThread, Error>;
    /// Waits for the thread to exit; `None` waits forever.
    fn wait_thread(&self, thread: RawThread, timeout: Option<Duration>)
        -> Result<WaitStatus, Error>;
    fn thread_exit_code(&self, thread: RawThread) -> Result<u32, Error>;
    fn terminate_thread(&self, thread: RawThread, exit_code: u32) -> Result<(), Error>;
    fn close_thread(&self, thread: RawThread) -> Result<(), Error>;
}

/// A process that can be injected into.
pub trait TargetProcess: ProcessMemory + RemoteThreads {}

impl<T: ProcessMemory + RemoteThreads> TargetProcess for T {}
