#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::time::Duration;

use tracer_inject::platform::{
    CodeSource, FunctionEntry, ProcessMemory, Protection, RawThread, RemoteThreads, WaitStatus,
};
use tracer_inject::thunk::{BootstrapPrimitives, ThunkTemplate};
use tracer_inject::unwind::RuntimeFunction;
use tracer_inject::Error;

pub const IMAGE_BASE: u64 = 0x1_8000_0000;
pub const REMOTE_BASE: u64 = 0x2_5000_0000;

/// Unwind info with version 1, a 4 byte prolog and `sub rsp, 0x28`.
pub const SIMPLE_UNWIND: [u8; 8] = [0x01, 0x04, 0x01, 0x00, 0x04, 0x42, 0x00, 0x00];

/// A loaded image in the injecting process.
pub struct FakeImage {
    pub bytes: Vec<u8>,
    pub functions: Vec<RuntimeFunction>,
}

impl FakeImage {
    pub fn new() -> FakeImage {
        FakeImage {
            bytes: vec![0; 0x8000],
            functions: Vec::new(),
        }
    }

    pub fn put(&mut self, rva: u32, data: &[u8]) {
        let rva = rva as usize;
        self.bytes[rva..rva + data.len()].copy_from_slice(data);
    }

    /// Adds a function of `code` at `rva`, with `unwind` stored at `unwind_rva`.
    pub fn add_function(&mut self, rva: u32, code: &[u8], unwind_rva: u32, unwind: &[u8]) -> u64 {
        self.put(rva, code);
        self.put(unwind_rva, unwind);
        self.functions.push(RuntimeFunction {
            begin: rva,
            end: rva + code.len() as u32,
            unwind_info: unwind_rva,
        });
        IMAGE_BASE + rva as u64
    }
}

impl CodeSource for FakeImage {
    fn read(&self, address: u64, out: &mut [u8]) -> Result<(), Error> {
        let start = address.checked_sub(IMAGE_BASE)
            .ok_or_else(|| Error::Other(format!("Read outside image {:#x}", address)))?
            as usize;
        let slice = self.bytes.get(start..start + out.len())
            .ok_or_else(|| Error::Other(format!("Read outside image {:#x}", address)))?;
        out.copy_from_slice(slice);
        Ok(())
    }

    fn lookup_function_entry(&self, address: u64) -> Option<FunctionEntry> {
        let rva = address.checked_sub(IMAGE_BASE)? as u32;
        self.functions.iter()
            .find(|f| rva >= f.begin && rva < f.end)
            .map(|&function| FunctionEntry {
                image_base: IMAGE_BASE,
                function,
            })
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Call {
    Allocate(usize, Protection),
    Write(u64, usize),
    Protect(u64, usize, Protection),
    Flush(u64, usize),
    Free(u64),
    CreateThread(u64, u64),
    Wait(Option<Duration>),
    ExitCode,
    Terminate(u32),
    Close,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FailAt {
    Allocate,
    Write,
    Protect,
    Flush,
    Free,
    CreateThread,
    Wait,
}

const THREAD_HANDLE: u64 = 0x1234;
const THREAD_ID: u32 = 77;
const ACCESS_VIOLATION: u32 = 0xc000_0005;

/// A target process recording every call made to it.
///
/// Threads are not run; their exit code is either `exit_code`, or decoded from
/// the protocol marker stub the thread's context points to.
pub struct FakeProcess {
    pub calls: RefCell<Vec<Call>>,
    pub fail: Cell<Option<FailAt>>,
    pub memory: RefCell<Vec<u8>>,
    pub exit_code: Cell<Option<u32>>,
    pub hang: Cell<bool>,
    thread: Cell<Option<(u64, u64)>>,
}

impl FakeProcess {
    pub fn new() -> FakeProcess {
        FakeProcess {
            calls: RefCell::new(Vec::new()),
            fail: Cell::new(None),
            memory: RefCell::new(Vec::new()),
            exit_code: Cell::new(None),
            hang: Cell::new(false),
            thread: Cell::new(None),
        }
    }

    pub fn failing(at: FailAt) -> FakeProcess {
        let process = FakeProcess::new();
        process.fail.set(Some(at));
        process
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.borrow().clone()
    }

    pub fn created_thread(&self) -> bool {
        self.calls.borrow().iter().any(|x| match x {
            Call::CreateThread(..) => true,
            _ => false,
        })
    }

    /// Bytes written at remote address `address`.
    pub fn read(&self, address: u64, len: usize) -> Vec<u8> {
        let start = (address - REMOTE_BASE) as usize;
        self.memory.borrow()[start..start + len].to_vec()
    }

    pub fn read_u32(&self, address: u64) -> u32 {
        let bytes = self.read(address, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    pub fn read_u64(&self, address: u64) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.read(address, 8));
        u64::from_le_bytes(bytes)
    }

    fn record(&self, call: Call, at: FailAt) -> Result<(), Error> {
        self.calls.borrow_mut().push(call);
        if self.fail.get() == Some(at) {
            return Err(Error::Other(format!("{:?} failed", at)));
        }
        Ok(())
    }

    fn remote(&self, address: u64, len: usize) -> Option<Vec<u8>> {
        let start = address.checked_sub(REMOTE_BASE)? as usize;
        self.memory.borrow().get(start..start + len).map(|x| x.to_vec())
    }

    /// What the marker stub would make the thread exit with.
    fn run_thread(&self) -> u32 {
        let (_, argument) = match self.thread.get() {
            Some(s) => s,
            None => return ACCESS_VIOLATION,
        };
        let marker = match self.remote(argument, 8) {
            Some(x) => {
                let mut bytes = [0u8; 8];
                bytes.copy_from_slice(&x);
                u64::from_le_bytes(bytes)
            }
            None => return ACCESS_VIOLATION,
        };
        match self.remote(marker, 12) {
            Some(ref x) if x[..2] == [0xc7, 0x02] && x[6..] == [0xb8, 1, 0, 0, 0, 0xc3] => {
                u32::from_le_bytes([x[2], x[3], x[4], x[5]])
            }
            Some(ref x) if x[..3] == [0x31, 0xc0, 0xc3] => 0,
            _ => ACCESS_VIOLATION,
        }
    }
}

impl ProcessMemory for FakeProcess {
    fn allocate_pages(&self, size: usize, protection: Protection) -> Result<u64, Error> {
        self.record(Call::Allocate(size, protection), FailAt::Allocate)?;
        *self.memory.borrow_mut() = vec![0xee; size];
        Ok(REMOTE_BASE)
    }

    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<(), Error> {
        self.record(Call::Write(address, data.len()), FailAt::Write)?;
        let start = (address - REMOTE_BASE) as usize;
        self.memory.borrow_mut()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn set_protection(&self, address: u64, size: usize, protection: Protection)
        -> Result<(), Error>
    {
        self.record(Call::Protect(address, size, protection), FailAt::Protect)
    }

    fn flush_instruction_cache(&self, address: u64, size: usize) -> Result<(), Error> {
        self.record(Call::Flush(address, size), FailAt::Flush)
    }

    fn free_pages(&self, address: u64) -> Result<(), Error> {
        self.record(Call::Free(address), FailAt::Free)
    }
}

impl RemoteThreads for FakeProcess {
    fn create_remote_thread(&self, entry: u64, argument: u64) -> Result<RawThread, Error> {
        self.record(Call::CreateThread(entry, argument), FailAt::CreateThread)?;
        self.thread.set(Some((entry, argument)));
        Ok(RawThread {
            handle: THREAD_HANDLE,
            id: THREAD_ID,
        })
    }

    fn wait_thread(&self, _: RawThread, timeout: Option<Duration>) -> Result<WaitStatus, Error> {
        self.record(Call::Wait(timeout), FailAt::Wait)?;
        if self.hang.get() {
            Ok(WaitStatus::TimedOut)
        } else {
            Ok(WaitStatus::Signaled)
        }
    }

    fn thread_exit_code(&self, _: RawThread) -> Result<u32, Error> {
        self.calls.borrow_mut().push(Call::ExitCode);
        Ok(self.exit_code.get().unwrap_or_else(|| self.run_thread()))
    }

    fn terminate_thread(&self, _: RawThread, exit_code: u32) -> Result<(), Error> {
        self.calls.borrow_mut().push(Call::Terminate(exit_code));
        self.hang.set(false);
        self.exit_code.set(Some(exit_code));
        Ok(())
    }

    fn close_thread(&self, thread: RawThread) -> Result<(), Error> {
        assert_eq!(thread.handle, THREAD_HANDLE);
        self.calls.borrow_mut().push(Call::Close);
        Ok(())
    }
}

pub fn primitives() -> BootstrapPrimitives {
    BootstrapPrimitives {
        rtl_add_function_table: 0x7ff8_1000_1000,
        load_library_w: 0x7ff8_2000_1000,
        get_proc_address: 0x7ff8_2000_2000,
    }
}

pub fn bootstrap_template() -> ThunkTemplate {
    ThunkTemplate::bootstrap("C:\\tracer\\tracer.dll", "InjectionEntry", primitives())
        .unwrap()
}

/// An image with a 40 byte function at rva 0x1000.
pub fn simple_image() -> (FakeImage, u64) {
    let mut image = FakeImage::new();
    let mut code = vec![0x48, 0x83, 0xec, 0x28];
    code.resize(36, 0x90);
    code.extend_from_slice(&[0x48, 0x83, 0xc4, 0x28]);
    let address = image.add_function(0x1000, &code, 0x6000, &SIMPLE_UNWIND);
    (image, address)
}
