//! The thunk context copied next to injected code, and the code bootstrapping it.
//!
//! The remote thread starts at the copied function with a pointer to the thunk
//! context as its only argument. The context layout is fixed:
//!
//! ```text
//! 0x00  protocol marker function
//! 0x08  flags: u32
//! 0x0c  entry count: u16
//! 0x0e  user data offset: u16    ; payload offset from the context start
//! 0x10  function table
//! 0x18  base code address
//! 0x20  module path              ; utf-16, nul terminated
//! 0x28  function name            ; ascii, nul terminated
//! 0x30  RtlAddFunctionTable
//! 0x38  LoadLibraryW
//! 0x40  GetProcAddress
//! 0x48  writable data            ; extra read/write pages, 0 without them
//! 0x50  writable data size
//! ```
//!
//! The first word is always the protocol marker. Injected code calls it as
//! `marker(context, &mut token)` before anything else; a nonzero result means
//! the call is a probe, and the code must return `token` without doing anything
//! else.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use libc::c_void;

use crate::handoff::{check_exit_code, HandshakeError};
use crate::{align_up, Error};

/// Exit codes of the bootstrap are `EXIT_CODE_BASE + n`. The base sits in the
/// NTSTATUS customer range, so the codes are distinct from small return values
/// and from crash statuses such as `0xc0000005`.
pub const EXIT_CODE_BASE: u32 = 0x2000_0000;
const EXIT_CODE_RANGE: u32 = 0x1000;

pub const EXIT_NULL_CONTEXT: u32 = EXIT_CODE_BASE + 1;
pub const EXIT_MISSING_PRIMITIVE: u32 = EXIT_CODE_BASE + 2;
pub const EXIT_ADD_FUNCTION_TABLE_FAILED: u32 = EXIT_CODE_BASE + 3;
pub const EXIT_LOAD_LIBRARY_FAILED: u32 = EXIT_CODE_BASE + 4;
pub const EXIT_GET_PROC_ADDRESS_FAILED: u32 = EXIT_CODE_BASE + 5;

/// Status severity bits of an NTSTATUS error, which is what a thread killed by
/// an unhandled exception exits with.
const STATUS_SEVERITY_ERROR: u32 = 0xc000_0000;

/// Sentinel used by probes unless the caller picks one.
pub const DEFAULT_PROBE_SENTINEL: u32 = 0x7e57_ab1e;

/// Size of the thunk context.
pub const THUNK_CONTEXT_SIZE: usize = 0x58;

pub const MARKER_OFFSET: usize = 0x0;
pub const FLAGS_OFFSET: usize = 0x8;
pub const ENTRY_COUNT_OFFSET: usize = 0xc;
pub const USER_DATA_OFFSET_OFFSET: usize = 0xe;
pub const FUNCTION_TABLE_OFFSET: usize = 0x10;
pub const BASE_CODE_ADDRESS_OFFSET: usize = 0x18;
pub const MODULE_PATH_OFFSET: usize = 0x20;
pub const FUNCTION_NAME_OFFSET: usize = 0x28;
pub const RTL_ADD_FUNCTION_TABLE_OFFSET: usize = 0x30;
pub const LOAD_LIBRARY_W_OFFSET: usize = 0x38;
pub const GET_PROC_ADDRESS_OFFSET: usize = 0x40;
pub const WRITABLE_DATA_OFFSET: usize = 0x48;
pub const WRITABLE_SIZE_OFFSET: usize = 0x50;

/// Alignment of the strings following the context.
pub const STRING_ALIGN: usize = 8;

pub type ProtocolMarkerFn = unsafe extern "system" fn(*const RawThunkContext, *mut u32) -> i32;
pub type AddFunctionTableFn = unsafe extern "system" fn(*const u8, u32, u64) -> u8;
pub type LoadLibraryWFn = unsafe extern "system" fn(*const u16) -> *mut c_void;
pub type GetProcAddressFn =
    unsafe extern "system" fn(*mut c_void, *const u8) -> Option<EntryFn>;
/// The function the bootstrap finally calls, receiving the payload.
pub type EntryFn = unsafe extern "system" fn(*const u8) -> u32;
/// Signature of injected functions.
pub type ThunkEntryFn = unsafe extern "system" fn(*const RawThunkContext) -> u32;

// c7 02 is followed by the sentinel when placed.
static PROBE_STUB_HEAD: &'static [u8] = &[
    0xc7, 0x02,                     // mov dword [rdx], sentinel
];
static PROBE_STUB_TAIL: &'static [u8] = &[
    0xb8, 0x01, 0x00, 0x00, 0x00,   // mov eax, 1
    0xc3,                           // ret
];
static PROCEED_STUB: &'static [u8] = &[
    0x31, 0xc0,                     // xor eax, eax
    0xc3,                           // ret
];

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RemoteExitCode {
    NullContext,
    MissingPrimitive,
    AddFunctionTableFailed,
    LoadLibraryFailed,
    GetProcAddressFailed,
    /// In the bootstrap range, but not a code this version knows.
    Unknown(u32),
    /// The thread died to an exception nothing handled.
    UnhandledException(u32),
}

impl RemoteExitCode {
    /// Classifies a thread exit code; ordinary return values give `None`.
    pub fn from_code(code: u32) -> Option<RemoteExitCode> {
        let result = match code {
            EXIT_NULL_CONTEXT => RemoteExitCode::NullContext,
            EXIT_MISSING_PRIMITIVE => RemoteExitCode::MissingPrimitive,
            EXIT_ADD_FUNCTION_TABLE_FAILED => RemoteExitCode::AddFunctionTableFailed,
            EXIT_LOAD_LIBRARY_FAILED => RemoteExitCode::LoadLibraryFailed,
            EXIT_GET_PROC_ADDRESS_FAILED => RemoteExitCode::GetProcAddressFailed,
            x if is_error_code(x) => RemoteExitCode::Unknown(x),
            x if x & STATUS_SEVERITY_ERROR == STATUS_SEVERITY_ERROR => {
                RemoteExitCode::UnhandledException(x)
            }
            _ => return None,
        };
        Some(result)
    }

    pub fn code(&self) -> u32 {
        match *self {
            RemoteExitCode::NullContext => EXIT_NULL_CONTEXT,
            RemoteExitCode::MissingPrimitive => EXIT_MISSING_PRIMITIVE,
            RemoteExitCode::AddFunctionTableFailed => EXIT_ADD_FUNCTION_TABLE_FAILED,
            RemoteExitCode::LoadLibraryFailed => EXIT_LOAD_LIBRARY_FAILED,
            RemoteExitCode::GetProcAddressFailed => EXIT_GET_PROC_ADDRESS_FAILED,
            RemoteExitCode::Unknown(x) | RemoteExitCode::UnhandledException(x) => x,
        }
    }
}

impl fmt::Display for RemoteExitCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RemoteExitCode::NullContext => write!(f, "Thunk was called without a context"),
            RemoteExitCode::MissingPrimitive => {
                write!(f, "Thunk context is missing a bootstrap function")
            }
            RemoteExitCode::AddFunctionTableFailed => {
                write!(f, "Could not register the function table")
            }
            RemoteExitCode::LoadLibraryFailed => write!(f, "Could not load the module"),
            RemoteExitCode::GetProcAddressFailed => {
                write!(f, "Could not find the entry function")
            }
            RemoteExitCode::Unknown(x) => write!(f, "Unknown bootstrap error {:#x}", x),
            RemoteExitCode::UnhandledException(x) => {
                write!(f, "Unhandled exception {:#010x}", x)
            }
        }
    }
}

/// Whether `code` is in the range reserved for bootstrap errors.
pub fn is_error_code(code: u32) -> bool {
    code >= EXIT_CODE_BASE && code < EXIT_CODE_BASE + EXIT_CODE_RANGE
}

/// Checks that `sentinel` can be told apart from failures.
pub fn validate_sentinel(sentinel: u32) -> Result<(), Error> {
    if sentinel == 0 {
        return Err(Error::InvalidParameter("probe sentinel is zero"));
    }
    if RemoteExitCode::from_code(sentinel).is_some() {
        return Err(Error::InvalidParameter("probe sentinel collides with an error code"));
    }
    Ok(())
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ThunkFlags(pub u32);

impl ThunkFlags {
    /// Register the copied function table before calling into the module.
    pub const ADD_FUNCTION_TABLE: u32 = 0x1;

    pub fn contains(&self, flag: u32) -> bool {
        self.0 & flag == flag
    }
}

/// Addresses of the functions the bootstrap uses, valid in the target process.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct BootstrapPrimitives {
    pub rtl_add_function_table: u64,
    pub load_library_w: u64,
    pub get_proc_address: u64,
}

/// The first word of the thunk context.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProtocolMarker {
    /// Embedded stub reporting a probe, which makes the thread exit with the
    /// sentinel.
    Probe(u32),
    /// Embedded stub reporting a real invocation.
    Proceed,
    /// A marker function already present in the target, at this address.
    External(u64),
}

impl ProtocolMarker {
    /// Code of the embedded stub, if the marker has one.
    pub fn stub(&self) -> Option<Vec<u8>> {
        match *self {
            ProtocolMarker::Probe(sentinel) => {
                let mut stub = PROBE_STUB_HEAD.to_vec();
                stub.extend_from_slice(&sentinel.to_le_bytes());
                stub.extend_from_slice(PROBE_STUB_TAIL);
                Some(stub)
            }
            ProtocolMarker::Proceed => Some(PROCEED_STUB.to_vec()),
            ProtocolMarker::External(_) => None,
        }
    }

    pub fn stub_size(&self) -> usize {
        match *self {
            ProtocolMarker::Probe(_) => PROBE_STUB_HEAD.len() + 4 + PROBE_STUB_TAIL.len(),
            ProtocolMarker::Proceed => PROCEED_STUB.len(),
            ProtocolMarker::External(_) => 0,
        }
    }
}

/// The thunk context as the injected code sees it.
///
/// Pointers are stored as `u64` so that the layout is the same on every host.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RawThunkContext {
    pub marker: u64,
    pub flags: u32,
    pub entry_count: u16,
    pub user_data_offset: u16,
    pub function_table: u64,
    pub base_code_address: u64,
    pub module_path: u64,
    pub function_name: u64,
    pub rtl_add_function_table: u64,
    pub load_library_w: u64,
    pub get_proc_address: u64,
    pub writable_data: u64,
    pub writable_size: u64,
}

impl RawThunkContext {
    pub fn parse(buf: &[u8]) -> Result<RawThunkContext, Error> {
        if buf.len() < THUNK_CONTEXT_SIZE {
            return Err(Error::OutOfBounds(0, THUNK_CONTEXT_SIZE));
        }
        Ok(RawThunkContext {
            marker: LittleEndian::read_u64(&buf[MARKER_OFFSET..]),
            flags: LittleEndian::read_u32(&buf[FLAGS_OFFSET..]),
            entry_count: LittleEndian::read_u16(&buf[ENTRY_COUNT_OFFSET..]),
            user_data_offset: LittleEndian::read_u16(&buf[USER_DATA_OFFSET_OFFSET..]),
            function_table: LittleEndian::read_u64(&buf[FUNCTION_TABLE_OFFSET..]),
            base_code_address: LittleEndian::read_u64(&buf[BASE_CODE_ADDRESS_OFFSET..]),
            module_path: LittleEndian::read_u64(&buf[MODULE_PATH_OFFSET..]),
            function_name: LittleEndian::read_u64(&buf[FUNCTION_NAME_OFFSET..]),
            rtl_add_function_table: LittleEndian::read_u64(&buf[RTL_ADD_FUNCTION_TABLE_OFFSET..]),
            load_library_w: LittleEndian::read_u64(&buf[LOAD_LIBRARY_W_OFFSET..]),
            get_proc_address: LittleEndian::read_u64(&buf[GET_PROC_ADDRESS_OFFSET..]),
            writable_data: LittleEndian::read_u64(&buf[WRITABLE_DATA_OFFSET..]),
            writable_size: LittleEndian::read_u64(&buf[WRITABLE_SIZE_OFFSET..]),
        })
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, Error> {
        if out.len() < THUNK_CONTEXT_SIZE {
            return Err(Error::OutOfBounds(0, THUNK_CONTEXT_SIZE));
        }
        LittleEndian::write_u64(&mut out[MARKER_OFFSET..], self.marker);
        LittleEndian::write_u32(&mut out[FLAGS_OFFSET..], self.flags);
        LittleEndian::write_u16(&mut out[ENTRY_COUNT_OFFSET..], self.entry_count);
        LittleEndian::write_u16(&mut out[USER_DATA_OFFSET_OFFSET..], self.user_data_offset);
        LittleEndian::write_u64(&mut out[FUNCTION_TABLE_OFFSET..], self.function_table);
        LittleEndian::write_u64(&mut out[BASE_CODE_ADDRESS_OFFSET..], self.base_code_address);
        LittleEndian::write_u64(&mut out[MODULE_PATH_OFFSET..], self.module_path);
        LittleEndian::write_u64(&mut out[FUNCTION_NAME_OFFSET..], self.function_name);
        LittleEndian::write_u64(&mut out[RTL_ADD_FUNCTION_TABLE_OFFSET..], self.rtl_add_function_table);
        LittleEndian::write_u64(&mut out[LOAD_LIBRARY_W_OFFSET..], self.load_library_w);
        LittleEndian::write_u64(&mut out[GET_PROC_ADDRESS_OFFSET..], self.get_proc_address);
        LittleEndian::write_u64(&mut out[WRITABLE_DATA_OFFSET..], self.writable_data);
        LittleEndian::write_u64(&mut out[WRITABLE_SIZE_OFFSET..], self.writable_size);
        Ok(THUNK_CONTEXT_SIZE)
    }
}

/// Per-injection configuration of the thunk context.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ThunkTemplate {
    pub marker: ProtocolMarker,
    pub flags: ThunkFlags,
    /// Module the bootstrap loads, without the terminating nul.
    pub module_path: Vec<u16>,
    /// Export called with the payload, without the terminating nul.
    pub function_name: Vec<u8>,
    pub primitives: BootstrapPrimitives,
}

impl ThunkTemplate {
    /// A template which only makes the remote thread exit with `sentinel`.
    pub fn probe(sentinel: u32) -> Result<ThunkTemplate, Error> {
        validate_sentinel(sentinel)?;
        Ok(ThunkTemplate {
            marker: ProtocolMarker::Probe(sentinel),
            flags: ThunkFlags::default(),
            module_path: Vec::new(),
            function_name: Vec::new(),
            primitives: BootstrapPrimitives::default(),
        })
    }

    /// A template which registers the copied function table, loads `module` and
    /// calls its export `function` with the payload.
    pub fn bootstrap(
        module: &str,
        function: &str,
        primitives: BootstrapPrimitives,
    ) -> Result<ThunkTemplate, Error> {
        let template = ThunkTemplate {
            marker: ProtocolMarker::Proceed,
            flags: ThunkFlags(ThunkFlags::ADD_FUNCTION_TABLE),
            module_path: module.encode_utf16().collect(),
            function_name: function.as_bytes().to_vec(),
            primitives,
        };
        template.validate()?;
        Ok(template)
    }

    pub fn is_probe(&self) -> bool {
        match self.marker {
            ProtocolMarker::Probe(_) => true,
            _ => false,
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        match self.marker {
            ProtocolMarker::Probe(sentinel) => return validate_sentinel(sentinel),
            ProtocolMarker::External(0) => {
                return Err(Error::InvalidParameter("protocol marker address is null"));
            }
            _ => (),
        }
        if self.module_path.is_empty() || self.module_path.contains(&0) {
            return Err(Error::InvalidParameter("module path"));
        }
        if self.function_name.is_empty() || self.function_name.contains(&0) {
            return Err(Error::InvalidParameter("function name"));
        }
        let primitives = &self.primitives;
        if primitives.load_library_w == 0 || primitives.get_proc_address == 0 {
            return Err(Error::InvalidParameter("bootstrap primitives"));
        }
        if self.flags.contains(ThunkFlags::ADD_FUNCTION_TABLE) &&
            primitives.rtl_add_function_table == 0
        {
            return Err(Error::InvalidParameter("RtlAddFunctionTable address"));
        }
        Ok(())
    }

    /// Bytes the module path takes after the context, nul and padding included.
    pub fn module_path_size(&self) -> usize {
        align_up((self.module_path.len() + 1) * 2, STRING_ALIGN)
    }

    pub fn function_name_size(&self) -> usize {
        align_up(self.function_name.len() + 1, STRING_ALIGN)
    }

    /// Bytes of strings the relocator appends to the context.
    pub fn strings_size(&self) -> usize {
        self.module_path_size() + self.function_name_size()
    }

    /// The context before relocation; address fields are left zero.
    pub fn context(&self) -> RawThunkContext {
        RawThunkContext {
            flags: self.flags.0,
            rtl_add_function_table: self.primitives.rtl_add_function_table,
            load_library_w: self.primitives.load_library_w,
            get_proc_address: self.primitives.get_proc_address,
            ..RawThunkContext::default()
        }
    }
}

/// Bootstraps the module named by `context`.
///
/// This is copied into the target, so it may only call through the context and
/// must not call other functions of this crate, not even inlined helpers, which
/// unoptimized builds emit as relative calls.
#[inline(never)]
pub unsafe extern "system" fn injection_thunk(context: *const RawThunkContext) -> u32 {
    if context as usize == 0 {
        return EXIT_NULL_CONTEXT;
    }
    let ctx = &*context;
    if ctx.marker == 0 {
        return EXIT_MISSING_PRIMITIVE;
    }
    let marker: ProtocolMarkerFn = std::mem::transmute(ctx.marker as usize);
    let mut token = 0u32;
    if marker(context, &mut token) != 0 {
        return token;
    }
    if ctx.load_library_w == 0 || ctx.get_proc_address == 0 {
        return EXIT_MISSING_PRIMITIVE;
    }
    if ctx.flags & ThunkFlags::ADD_FUNCTION_TABLE != 0 {
        if ctx.rtl_add_function_table == 0 {
            return EXIT_MISSING_PRIMITIVE;
        }
        let add: AddFunctionTableFn = std::mem::transmute(ctx.rtl_add_function_table as usize);
        let table = ctx.function_table as usize as *const u8;
        if add(table, ctx.entry_count as u32, ctx.base_code_address) == 0 {
            return EXIT_ADD_FUNCTION_TABLE_FAILED;
        }
    }
    let load_library: LoadLibraryWFn = std::mem::transmute(ctx.load_library_w as usize);
    let module = load_library(ctx.module_path as usize as *const u16);
    if module as usize == 0 {
        return EXIT_LOAD_LIBRARY_FAILED;
    }
    let get_proc_address: GetProcAddressFn = std::mem::transmute(ctx.get_proc_address as usize);
    let entry = match get_proc_address(module, ctx.function_name as usize as *const u8) {
        Some(entry) => entry,
        None => return EXIT_GET_PROC_ADDRESS_FAILED,
    };
    let user_data = (context as usize).wrapping_add(ctx.user_data_offset as usize);
    entry(user_data as *const u8)
}

#[repr(C)]
struct LocalProbe {
    context: RawThunkContext,
    sentinel: u32,
}

unsafe extern "system" fn local_probe_marker(
    context: *const RawThunkContext,
    token: *mut u32,
) -> i32 {
    let probe = context as *const LocalProbe;
    *token = (*probe).sentinel;
    1
}

/// Calls `entry` in this process with a probing context, checking that it
/// honors the protocol marker by returning `sentinel` untouched.
///
/// # Safety
///
/// `entry` must be a function following the thunk protocol; any function which
/// does not call the marker first will run for real.
pub unsafe fn probe_local_entry(entry: ThunkEntryFn, sentinel: u32) -> Result<(), HandshakeError> {
    validate_sentinel(sentinel)?;
    let probe = LocalProbe {
        context: RawThunkContext {
            marker: local_probe_marker as usize as u64,
            ..RawThunkContext::default()
        },
        sentinel,
    };
    let result = entry(&probe.context);
    debug!("Local probe returned {:#x}", result);
    check_exit_code(sentinel, result)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::ptr::null_mut;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static LOADS: AtomicUsize = AtomicUsize::new(0);
    static LOOKUPS: AtomicUsize = AtomicUsize::new(0);
    static TABLES: AtomicUsize = AtomicUsize::new(0);
    static ENTRIES: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "system" fn proceed(_: *const RawThunkContext, _: *mut u32) -> i32 {
        0
    }

    unsafe extern "system" fn add_table(_: *const u8, count: u32, _: u64) -> u8 {
        TABLES.fetch_add(count as usize, Ordering::SeqCst);
        1
    }

    unsafe extern "system" fn load_library(_: *const u16) -> *mut c_void {
        LOADS.fetch_add(1, Ordering::SeqCst);
        0x1000 as *mut c_void
    }

    unsafe extern "system" fn load_library_fails(_: *const u16) -> *mut c_void {
        null_mut()
    }

    unsafe extern "system" fn entry(payload: *const u8) -> u32 {
        ENTRIES.fetch_add(1, Ordering::SeqCst);
        *payload as u32
    }

    unsafe extern "system" fn get_proc_address(_: *mut c_void, _: *const u8) -> Option<EntryFn> {
        LOOKUPS.fetch_add(1, Ordering::SeqCst);
        Some(entry)
    }

    fn counts() -> [usize; 4] {
        [
            LOADS.load(Ordering::SeqCst),
            LOOKUPS.load(Ordering::SeqCst),
            TABLES.load(Ordering::SeqCst),
            ENTRIES.load(Ordering::SeqCst),
        ]
    }

    #[repr(C)]
    struct ContextWithPayload {
        context: RawThunkContext,
        payload: [u8; 8],
    }

    fn context() -> RawThunkContext {
        RawThunkContext {
            marker: proceed as usize as u64,
            flags: ThunkFlags::ADD_FUNCTION_TABLE,
            entry_count: 1,
            rtl_add_function_table: add_table as usize as u64,
            load_library_w: load_library as usize as u64,
            get_proc_address: get_proc_address as usize as u64,
            ..RawThunkContext::default()
        }
    }

    // All thunk invocations share the counters, so they run in one test.
    #[test]
    fn thunk_protocol() {
        unsafe {
            let before = counts();
            let mut probe = LocalProbe {
                context: context(),
                sentinel: 0x5151,
            };
            probe.context.marker = local_probe_marker as usize as u64;
            assert_eq!(injection_thunk(&probe.context), 0x5151);
            assert_eq!(counts(), before);
            probe_local_entry(injection_thunk, 0x5151).unwrap();
            assert_eq!(counts(), before);

            let mut full = ContextWithPayload {
                context: context(),
                payload: [0x2a, 0, 0, 0, 0, 0, 0, 0],
            };
            full.context.user_data_offset = THUNK_CONTEXT_SIZE as u16;
            assert_eq!(injection_thunk(&full.context), 0x2a);
            let after = counts();
            assert_eq!(after[0] - before[0], 1);
            assert_eq!(after[1] - before[1], 1);
            assert_eq!(after[2] - before[2], 1);
            assert_eq!(after[3] - before[3], 1);

            full.context.load_library_w = load_library_fails as usize as u64;
            assert_eq!(injection_thunk(&full.context), EXIT_LOAD_LIBRARY_FAILED);
            full.context.rtl_add_function_table = 0;
            assert_eq!(injection_thunk(&full.context), EXIT_MISSING_PRIMITIVE);
            assert_eq!(injection_thunk(std::ptr::null()), EXIT_NULL_CONTEXT);
        }
    }

    #[test]
    fn local_probe_detects_ignored_marker() {
        unsafe extern "system" fn ignores_marker(_: *const RawThunkContext) -> u32 {
            7
        }
        match unsafe { probe_local_entry(ignores_marker, 0x5151) } {
            Err(HandshakeError::Mismatch(0x5151, 7)) => (),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn context_offsets() {
        use std::mem::{offset_of, size_of};
        assert_eq!(size_of::<RawThunkContext>(), THUNK_CONTEXT_SIZE);
        assert_eq!(offset_of!(RawThunkContext, marker), MARKER_OFFSET);
        assert_eq!(offset_of!(RawThunkContext, flags), FLAGS_OFFSET);
        assert_eq!(offset_of!(RawThunkContext, entry_count), ENTRY_COUNT_OFFSET);
        assert_eq!(offset_of!(RawThunkContext, user_data_offset), USER_DATA_OFFSET_OFFSET);
        assert_eq!(offset_of!(RawThunkContext, function_table), FUNCTION_TABLE_OFFSET);
        assert_eq!(offset_of!(RawThunkContext, base_code_address), BASE_CODE_ADDRESS_OFFSET);
        assert_eq!(offset_of!(RawThunkContext, module_path), MODULE_PATH_OFFSET);
        assert_eq!(offset_of!(RawThunkContext, function_name), FUNCTION_NAME_OFFSET);
        assert_eq!(
            offset_of!(RawThunkContext, rtl_add_function_table),
            RTL_ADD_FUNCTION_TABLE_OFFSET,
        );
        assert_eq!(offset_of!(RawThunkContext, load_library_w), LOAD_LIBRARY_W_OFFSET);
        assert_eq!(offset_of!(RawThunkContext, get_proc_address), GET_PROC_ADDRESS_OFFSET);
        assert_eq!(offset_of!(RawThunkContext, writable_data), WRITABLE_DATA_OFFSET);
        assert_eq!(offset_of!(RawThunkContext, writable_size), WRITABLE_SIZE_OFFSET);
    }

    #[test]
    fn context_bytes() {
        let ctx = RawThunkContext {
            marker: 0x1122_3344_5566_7788,
            flags: 1,
            entry_count: 2,
            user_data_offset: 0x60,
            writable_data: 0x2_0000_2000,
            writable_size: 0x3000,
            ..RawThunkContext::default()
        };
        let mut buf = [0u8; THUNK_CONTEXT_SIZE];
        ctx.write(&mut buf).unwrap();
        assert_eq!(&buf[..8], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&buf[12..16], &[2, 0, 0x60, 0]);
        assert_eq!(&buf[0x48..0x50], &0x2_0000_2000u64.to_le_bytes());
        assert_eq!(&buf[0x50..0x58], &0x3000u64.to_le_bytes());
        assert_eq!(RawThunkContext::parse(&buf).unwrap(), ctx);
    }

    #[test]
    fn exit_codes() {
        assert_eq!(RemoteExitCode::from_code(0), None);
        assert_eq!(RemoteExitCode::from_code(DEFAULT_PROBE_SENTINEL), None);
        assert_eq!(
            RemoteExitCode::from_code(EXIT_LOAD_LIBRARY_FAILED),
            Some(RemoteExitCode::LoadLibraryFailed),
        );
        assert_eq!(
            RemoteExitCode::from_code(EXIT_CODE_BASE + 0x80),
            Some(RemoteExitCode::Unknown(EXIT_CODE_BASE + 0x80)),
        );
        assert_eq!(
            RemoteExitCode::from_code(0xc000_0005),
            Some(RemoteExitCode::UnhandledException(0xc000_0005)),
        );
        assert_eq!(RemoteExitCode::GetProcAddressFailed.code(), EXIT_GET_PROC_ADDRESS_FAILED);
        assert!(validate_sentinel(0).is_err());
        assert!(validate_sentinel(EXIT_NULL_CONTEXT).is_err());
        assert!(validate_sentinel(DEFAULT_PROBE_SENTINEL).is_ok());
    }

    #[test]
    fn probe_stub_bytes() {
        let stub = ProtocolMarker::Probe(0x1234_5678).stub().unwrap();
        assert_eq!(stub, vec![
            0xc7, 0x02, 0x78, 0x56, 0x34, 0x12,
            0xb8, 0x01, 0x00, 0x00, 0x00, 0xc3,
        ]);
        assert_eq!(stub.len(), ProtocolMarker::Probe(0).stub_size());
        assert_eq!(ProtocolMarker::External(0x1000).stub(), None);
    }

    #[test]
    fn template_validation() {
        let primitives = BootstrapPrimitives {
            rtl_add_function_table: 0x10,
            load_library_w: 0x20,
            get_proc_address: 0x30,
        };
        let template = ThunkTemplate::bootstrap("a.dll", "Init", primitives).unwrap();
        assert_eq!(template.module_path_size(), 16);
        assert_eq!(template.function_name_size(), 8);
        assert!(!template.is_probe());
        assert!(ThunkTemplate::bootstrap("", "Init", primitives).is_err());
        assert!(ThunkTemplate::bootstrap("a.dll", "In\0it", primitives).is_err());
        let missing = BootstrapPrimitives {
            rtl_add_function_table: 0,
            ..primitives
        };
        assert!(ThunkTemplate::bootstrap("a.dll", "Init", missing).is_err());
        assert!(ThunkTemplate::probe(0).is_err());
        let probe = ThunkTemplate::probe(DEFAULT_PROBE_SENTINEL).unwrap();
        assert!(probe.validate().is_ok());
        assert_eq!(probe.strings_size(), 16);
        assert_eq!(probe.context().marker, 0);
    }
}
