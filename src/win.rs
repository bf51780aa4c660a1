//! Windows implementations of the platform traits.

use std::ffi::OsStr;
use std::io;
use std::mem;
use std::os::windows::ffi::OsStrExt;
use std::ptr::{null, null_mut};
use std::time::Duration;

use libc::c_void;
use winapi::shared::minwindef::{DWORD, FALSE, FARPROC};
use winapi::shared::winerror::WAIT_TIMEOUT;
use winapi::um::handleapi::CloseHandle;
use winapi::um::libloaderapi::{GetModuleHandleW, GetProcAddress};
use winapi::um::memoryapi::{
    ReadProcessMemory, VirtualAllocEx, VirtualFreeEx, VirtualProtectEx, WriteProcessMemory,
};
use winapi::um::minwinbase::LPTHREAD_START_ROUTINE;
use winapi::um::processthreadsapi::{
    CreateRemoteThread, FlushInstructionCache, GetCurrentProcess, GetExitCodeThread, OpenProcess,
    TerminateThread,
};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::winbase::{INFINITE, WAIT_OBJECT_0};
use winapi::um::winnt::{
    HANDLE, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_EXECUTE_READ, PAGE_READONLY,
    PAGE_READWRITE, PROCESS_CREATE_THREAD, PROCESS_QUERY_INFORMATION, PROCESS_VM_OPERATION,
    PROCESS_VM_READ, PROCESS_VM_WRITE,
};

use crate::nt_api;
use crate::platform::{
    CodeSource, FunctionEntry, ProcessMemory, Protection, RawThread, RemoteThreads, WaitStatus,
};
use crate::thunk::BootstrapPrimitives;
use crate::unwind::{RuntimeFunction, RUNTIME_FUNCTION_SIZE};
use crate::{Error, WinErr};

pub(crate) fn win_err<T, S: Into<String>>(desc: S) -> Result<T, Error> {
    Err(Error::Win(WinErr {
        err: io::Error::last_os_error(),
        desc: desc.into(),
    }))
}

fn make_winapi_str<T: AsRef<OsStr>>(input: T) -> Vec<u16> {
    input.as_ref().encode_wide().chain(Some(0)).collect::<Vec<u16>>()
}

fn page_protection(protection: Protection) -> DWORD {
    match protection {
        Protection::ReadWrite => PAGE_READWRITE,
        Protection::ExecuteRead => PAGE_EXECUTE_READ,
        Protection::ReadOnly => PAGE_READONLY,
    }
}

fn thread_handle(thread: RawThread) -> HANDLE {
    thread.handle as usize as HANDLE
}

/// A process opened for injection.
pub struct WinProcess {
    handle: HANDLE,
    owned: bool,
}

impl WinProcess {
    /// Opens the process `pid` with the rights injection needs.
    pub fn open(pid: u32) -> Result<WinProcess, Error> {
        let access = PROCESS_CREATE_THREAD | PROCESS_QUERY_INFORMATION | PROCESS_VM_OPERATION |
            PROCESS_VM_READ | PROCESS_VM_WRITE;
        let handle = unsafe { OpenProcess(access, FALSE, pid) };
        if handle == null_mut() {
            return win_err(format!("Could not open process {}", pid));
        }
        Ok(WinProcess {
            handle,
            owned: true,
        })
    }

    /// Uses an existing process handle, which is not closed on drop.
    ///
    /// # Safety
    ///
    /// `handle` must be a valid process handle with at least the rights `open`
    /// asks for, and outlive the returned value.
    pub unsafe fn from_handle(handle: HANDLE) -> WinProcess {
        WinProcess {
            handle,
            owned: false,
        }
    }

    pub fn handle(&self) -> HANDLE {
        self.handle
    }

    /// Resolves the functions the injection thunk bootstraps with, at their
    /// addresses in this process.
    pub fn bootstrap_primitives(&self) -> Result<BootstrapPrimitives, Error> {
        Ok(BootstrapPrimitives {
            rtl_add_function_table:
                nt_api::remote_proc_address(self.handle, "ntdll.dll", b"RtlAddFunctionTable")?,
            load_library_w:
                nt_api::remote_proc_address(self.handle, "kernel32.dll", b"LoadLibraryW")?,
            get_proc_address:
                nt_api::remote_proc_address(self.handle, "kernel32.dll", b"GetProcAddress")?,
        })
    }
}

impl Drop for WinProcess {
    fn drop(&mut self) {
        if self.owned {
            unsafe {
                CloseHandle(self.handle);
            }
        }
    }
}

impl ProcessMemory for WinProcess {
    fn allocate_pages(&self, size: usize, protection: Protection) -> Result<u64, Error> {
        let address = unsafe {
            VirtualAllocEx(
                self.handle,
                null_mut(),
                size,
                MEM_RESERVE | MEM_COMMIT,
                page_protection(protection),
            )
        };
        if address == null_mut() {
            return win_err(format!("Could not allocate {:#x} bytes in target", size));
        }
        Ok(address as usize as u64)
    }

    fn write_bytes(&self, address: u64, data: &[u8]) -> Result<(), Error> {
        let mut written = 0usize;
        let ok = unsafe {
            WriteProcessMemory(
                self.handle,
                address as usize as *mut _,
                data.as_ptr() as *const _,
                data.len(),
                &mut written,
            )
        };
        if ok == 0 || written != data.len() {
            win_err(format!("Error writing {} bytes to target", data.len()))
        } else {
            Ok(())
        }
    }

    fn set_protection(&self, address: u64, size: usize, protection: Protection)
        -> Result<(), Error>
    {
        let mut old = 0;
        let ok = unsafe {
            VirtualProtectEx(
                self.handle,
                address as usize as *mut _,
                size,
                page_protection(protection),
                &mut old,
            )
        };
        if ok == 0 {
            return win_err(format!("Could not protect {:#x} as {:?}", address, protection));
        }
        Ok(())
    }

    fn flush_instruction_cache(&self, address: u64, size: usize) -> Result<(), Error> {
        let ok = unsafe { FlushInstructionCache(self.handle, address as usize as *const _, size) };
        if ok == 0 {
            return win_err("Could not flush instruction cache");
        }
        Ok(())
    }

    fn free_pages(&self, address: u64) -> Result<(), Error> {
        let ok = unsafe { VirtualFreeEx(self.handle, address as usize as *mut _, 0, MEM_RELEASE) };
        if ok == 0 {
            return win_err(format!("Could not free {:#x}", address));
        }
        Ok(())
    }
}

impl RemoteThreads for WinProcess {
    fn create_remote_thread(&self, entry: u64, argument: u64) -> Result<RawThread, Error> {
        let mut id = 0;
        let handle = unsafe {
            let entry: LPTHREAD_START_ROUTINE = mem::transmute(entry as usize);
            CreateRemoteThread(
                self.handle,
                null_mut(),
                0,
                entry,
                argument as usize as *mut _,
                0,
                &mut id,
            )
        };
        if handle == null_mut() {
            return win_err("Could not create remote thread");
        }
        Ok(RawThread {
            handle: handle as usize as u64,
            id,
        })
    }

    fn wait_thread(&self, thread: RawThread, timeout: Option<Duration>)
        -> Result<WaitStatus, Error>
    {
        let millis = match timeout {
            Some(x) => std::cmp::min(x.as_millis(), (INFINITE - 1) as u128) as u32,
            None => INFINITE,
        };
        match unsafe { WaitForSingleObject(thread_handle(thread), millis) } {
            WAIT_OBJECT_0 => Ok(WaitStatus::Signaled),
            WAIT_TIMEOUT => Ok(WaitStatus::TimedOut),
            _ => win_err(format!("Could not wait for thread {}", thread.id)),
        }
    }

    fn thread_exit_code(&self, thread: RawThread) -> Result<u32, Error> {
        let mut code = 0;
        let ok = unsafe { GetExitCodeThread(thread_handle(thread), &mut code) };
        if ok == 0 {
            return win_err(format!("Could not get exit code of thread {}", thread.id));
        }
        Ok(code)
    }

    fn terminate_thread(&self, thread: RawThread, exit_code: u32) -> Result<(), Error> {
        let ok = unsafe { TerminateThread(thread_handle(thread), exit_code) };
        if ok == 0 {
            return win_err(format!("Could not terminate thread {}", thread.id));
        }
        Ok(())
    }

    fn close_thread(&self, thread: RawThread) -> Result<(), Error> {
        let ok = unsafe { CloseHandle(thread_handle(thread)) };
        if ok == 0 {
            return win_err(format!("Could not close thread {}", thread.id));
        }
        Ok(())
    }
}

type RtlLookupFunctionEntryFn =
    unsafe extern "system" fn(u64, *mut u64, *mut c_void) -> *const u8;

/// Address of `name` (NUL terminated) in this process's ntdll.
pub(crate) fn ntdll_function(name: &[u8]) -> Result<FARPROC, Error> {
    let display = String::from_utf8_lossy(&name[..name.len().saturating_sub(1)]);
    unsafe {
        let ntdll = GetModuleHandleW(make_winapi_str("ntdll").as_ptr());
        if ntdll == null_mut() {
            return win_err("Could not get ntdll handle");
        }
        let addr = GetProcAddress(ntdll, name.as_ptr() as *const i8);
        if addr == null_mut() {
            return win_err(format!("Didn't find {}", display));
        }
        Ok(addr)
    }
}

/// Code of the current process.
pub struct LocalCode {
    process: HANDLE,
    lookup: RtlLookupFunctionEntryFn,
}

impl LocalCode {
    pub fn new() -> Result<LocalCode, Error> {
        Ok(LocalCode {
            process: unsafe { GetCurrentProcess() },
            lookup: unsafe { mem::transmute(ntdll_function(b"RtlLookupFunctionEntry\0")?) },
        })
    }
}

impl CodeSource for LocalCode {
    fn read(&self, address: u64, out: &mut [u8]) -> Result<(), Error> {
        let mut read = 0usize;
        let ok = unsafe {
            ReadProcessMemory(
                self.process,
                address as usize as *const _,
                out.as_mut_ptr() as *mut _,
                out.len(),
                &mut read,
            )
        };
        if ok == 0 || read != out.len() {
            win_err(format!("Error reading {} bytes at {:#x}", out.len(), address))
        } else {
            Ok(())
        }
    }

    fn lookup_function_entry(&self, address: u64) -> Option<FunctionEntry> {
        let mut image_base = 0u64;
        let entry = unsafe { (self.lookup)(address, &mut image_base, null_mut()) };
        if entry == null() {
            return None;
        }
        let mut buf = [0u8; RUNTIME_FUNCTION_SIZE];
        self.read(entry as usize as u64, &mut buf).ok()?;
        let function = RuntimeFunction::parse(&buf).ok()?;
        Some(FunctionEntry {
            image_base,
            function,
        })
    }
}
