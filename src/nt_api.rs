//! Finding modules of the target through its PEB loader list.

use std::io;
use std::mem;
use std::ptr::null_mut;
use std::slice;

use libc::c_void;

use winapi::um::memoryapi::ReadProcessMemory;
use winapi::um::winnt::HANDLE;

use crate::pe::{self, find_export, read_u32};
use crate::win::{ntdll_function, win_err};
use crate::{Error, WinErr};

type NtQueryInformationProcessFn =
    unsafe extern "system" fn(HANDLE, u32, *mut c_void, u32, *mut u32) -> i32;

#[repr(C, packed)]
struct Peb64 {
    reserved1: [u8; 2],
    being_debugged: u8,
    reserved2: u8,
    padding: u32,
    reserved3: [u64; 2],
    ldr: u64,
}

#[repr(C)]
struct PebLdrData64 {
    reserved1: [u8; 8],
    reserved2: [u64; 3],
    module_list: [u64; 2],
}

#[repr(C)]
struct LdrDataTableEntry64 {
    reserved1: [u64; 2],
    links: [u64; 2],
    reserved2: [u64; 2],
    dll_base: u64,
    entry: u64,
    reserved3: u64,
    dll_name: UnicodeString64,
}

#[repr(C)]
struct UnicodeString64 {
    size: u16,
    capacity: u16,
    padding: u32,
    pointer: u64,
}

/// Offset of `links` in `LdrDataTableEntry64`, the loader list points there.
const ENTRY_LINKS_OFFSET: u64 = 0x10;
/// Offset of the list head in `PebLdrData64`.
const LDR_LIST_HEAD_OFFSET: u64 = 0x20;

#[repr(C)]
#[derive(Default)]
struct ProcessBasicInformation {
    exit_status: u64,
    peb: u64,
    affinity_mask: u64,
    base_priority: u64,
    process_id: u64,
    parent_process_id: u64,
}

/// Address of the target's PEB.
unsafe fn peb_address(process: HANDLE) -> Result<u64, Error> {
    let query: NtQueryInformationProcessFn =
        mem::transmute(ntdll_function(b"NtQueryInformationProcess\0")?);
    let mut info = ProcessBasicInformation::default();
    let status = query(
        process,
        0,
        &mut info as *mut ProcessBasicInformation as *mut c_void,
        mem::size_of::<ProcessBasicInformation>() as u32,
        null_mut(),
    );
    if status < 0 {
        return Err(Error::Win(WinErr {
            err: io::Error::from_raw_os_error(status),
            desc: "Could not query target's basic information".into(),
        }));
    }
    Ok(info.peb)
}

/// Returns pointer to PEB's Ldr (Loaded DLLs) structure in target's address space
unsafe fn read_peb_ldr(process: HANDLE) -> Result<u64, Error> {
    let peb: Peb64 = read_process_struct(process, peb_address(process)?)
        .or_else(|_| win_err("Could not read PEB"))?;
    Ok(peb.ldr)
}

/// Base and size of `dll` in the target. `dll` should have file extension.
pub(crate) fn module_base_size(process: HANDLE, dll: &str) -> Result<(u64, usize), Error> {
    unsafe {
        let peb_ldr = match read_peb_ldr(process)? {
            0 => return Err(Error::Other("Target has no loader data yet".into())),
            s => s,
        };
        let ldr_data: PebLdrData64 = read_process_struct(process, peb_ldr)
            .or_else(|_| win_err("Could not read PEB loader data"))?;
        let mut entry_pointer = ldr_data.module_list[0];
        let end = peb_ldr + LDR_LIST_HEAD_OFFSET;
        while entry_pointer != 0 && entry_pointer != end {
            let entry: LdrDataTableEntry64 =
                read_process_struct(process, entry_pointer - ENTRY_LINKS_OFFSET)?;
            if entry.dll_base == 0 {
                break;
            }
            entry_pointer = entry.links[0];
            let path = read_process_string(process, &entry.dll_name)?;
            let file_name = path.rsplit(|x: char| x == '/' || x == '\\').next().unwrap_or("");
            if file_name.eq_ignore_ascii_case(dll) {
                let header = read_process_bytes(process, entry.dll_base, pe::HEADER_SIZE)?;
                let size = pe::image_size(&header)?;
                return Ok((entry.dll_base, size as usize));
            }
        }
        Err(Error::Other(format!("{} not loaded", dll)))
    }
}

/// Address of export `func` of `dll` in the target.
pub(crate) fn remote_proc_address(process: HANDLE, dll: &str, func: &[u8]) -> Result<u64, Error> {
    let (base, size) = module_base_size(process, dll)?;
    let image = unsafe { read_process_bytes(process, base, size)? };
    // Sanity check that the copy is the module that was found.
    if read_u32(&image, 0)? & 0xffff != 0x5a4d {
        return Err(Error::Other(format!("{} at {:#x} is not a PE image", dll, base)));
    }
    let address = find_export(base, &image, func)?;
    debug!("{}!{} is at {:#x}", dll, String::from_utf8_lossy(func), address);
    Ok(address)
}

unsafe fn read_process_string(process: HANDLE, string: &UnicodeString64) -> Result<String, Error> {
    let bytes = read_process_bytes(process, string.pointer, string.size as usize)?;
    let units = bytes.chunks_exact(2)
        .map(|x| u16::from_le_bytes([x[0], x[1]]))
        .collect::<Vec<u16>>();
    String::from_utf16(&units)
        .map_err(|e| Error::Other(format!("Module name is not valid UTF-16: {}", e)))
}

unsafe fn read_process_bytes(process: HANDLE, addr: u64, size: usize) -> Result<Vec<u8>, Error> {
    let mut buf = vec![0u8; size];
    read_into(process, addr, &mut buf)?;
    Ok(buf)
}

/// Reads a plain-old-data `T` from the target.
unsafe fn read_process_struct<T>(process: HANDLE, addr: u64) -> Result<T, Error> {
    let mut value = mem::MaybeUninit::<T>::uninit();
    let out = slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, mem::size_of::<T>());
    read_into(process, addr, out)?;
    Ok(value.assume_init())
}

unsafe fn read_into(process: HANDLE, addr: u64, out: &mut [u8]) -> Result<(), Error> {
    let mut done = 0usize;
    let ok = ReadProcessMemory(
        process,
        addr as usize as *const _,
        out.as_mut_ptr() as *mut _,
        out.len(),
        &mut done,
    );
    if ok == 0 || done != out.len() {
        return win_err(format!("Could not read {} bytes at {:#x} in target", out.len(), addr));
    }
    Ok(())
}
