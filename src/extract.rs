//! Function image extraction.
//!
//! Resolves a code pointer of the injecting process to the function's code bytes
//! and unwind descriptor, following jump stubs (incremental linking thunks, import
//! thunks) first. If the descriptor names an exception or termination handler,
//! the handler is extracted as well so that it can be copied next to the function.

use byteorder::{ByteOrder, LittleEndian};

use crate::platform::CodeSource;
use crate::unwind::{RuntimeFunction, UnwindInfo};
use crate::Error;

/// Longest chain of jump stubs followed before giving up.
const MAX_JUMP_HOPS: usize = 32;

/// Code and unwind metadata of one function.
#[derive(Clone, Debug)]
pub struct FunctionImage {
    /// Address of the first instruction in the injecting process.
    pub entry_address: u64,
    /// Base address `function` and `unwind` offsets are relative to.
    pub image_base: u64,
    pub code: Vec<u8>,
    pub function: RuntimeFunction,
    pub unwind: UnwindInfo,
}

impl FunctionImage {
    pub fn code_size(&self) -> usize {
        self.code.len()
    }
}

/// A function, together with its handler if its unwind descriptor has one.
#[derive(Clone, Debug)]
pub enum ExtractedFunction {
    Simple(FunctionImage),
    WithHandler(FunctionImage, FunctionImage),
}

impl ExtractedFunction {
    pub fn primary(&self) -> &FunctionImage {
        match *self {
            ExtractedFunction::Simple(ref f) | ExtractedFunction::WithHandler(ref f, _) => f,
        }
    }

    pub fn handler(&self) -> Option<&FunctionImage> {
        match *self {
            ExtractedFunction::Simple(_) => None,
            ExtractedFunction::WithHandler(_, ref h) => Some(h),
        }
    }

    /// Number of function table entries the copy needs.
    pub fn entry_count(&self) -> u16 {
        match *self {
            ExtractedFunction::Simple(_) => 1,
            ExtractedFunction::WithHandler(..) => 2,
        }
    }
}

/// Follows `jmp rel32`, `jmp rel8` and `jmp [rip + disp32]` (with or without a
/// REX.W prefix) until reaching an address which is not a jump.
pub fn skip_jumps<C: CodeSource + ?Sized>(code: &C, address: u64) -> Result<u64, Error> {
    let mut address = address;
    for _ in 0..MAX_JUMP_HOPS {
        let mut op = [0u8; 2];
        code.read(address, &mut op[..1])?;
        let next = match op[0] {
            0xe9 => {
                let mut disp = [0u8; 4];
                code.read(address + 1, &mut disp)?;
                let disp = LittleEndian::read_i32(&disp) as i64;
                address.wrapping_add(5).wrapping_add(disp as u64)
            }
            0xeb => {
                let mut disp = [0u8; 1];
                code.read(address + 1, &mut disp)?;
                address.wrapping_add(2).wrapping_add(disp[0] as i8 as i64 as u64)
            }
            0xff | 0x48 => {
                code.read(address, &mut op)?;
                let (modrm_at, len) = match op {
                    [0xff, 0x25] => (address + 2, 6),
                    [0x48, 0xff] => (address + 2, 7),
                    _ => return Ok(address),
                };
                if len == 7 {
                    let mut modrm = [0u8; 1];
                    code.read(modrm_at, &mut modrm)?;
                    if modrm[0] != 0x25 {
                        return Ok(address);
                    }
                }
                let mut disp = [0u8; 4];
                code.read(address + len - 4, &mut disp)?;
                let disp = LittleEndian::read_i32(&disp) as i64;
                let slot = address.wrapping_add(len).wrapping_add(disp as u64);
                code.read_u64(slot)?
            }
            _ => return Ok(address),
        };
        trace!("Jump stub at {:#x} -> {:#x}", address, next);
        address = next;
    }
    Err(Error::UnsupportedShape(format!("Jump chain at {:#x} does not end", address)))
}

fn extract_image<C: CodeSource + ?Sized>(code: &C, address: u64) -> Result<FunctionImage, Error> {
    let entry = code.lookup_function_entry(address)
        .ok_or(Error::NoFunctionEntry(address))?;
    let function = entry.function;
    if function.end <= function.begin {
        return Err(Error::UnsupportedShape(
            format!("Function at {:#x} has an empty range", address)
        ));
    }
    let begin = entry.image_base + function.begin as u64;
    if begin != address {
        warn!(
            "{:#x} is not a function start, copying function at {:#x} instead",
            address, begin,
        );
    }
    let unwind_address = entry.image_base + function.unwind_info as u64;
    let unwind = UnwindInfo::read(code, unwind_address, &function)?;
    if unwind.version != 1 {
        return Err(Error::UnsupportedShape(
            format!("Unwind info at {:#x} has version {}", unwind_address, unwind.version)
        ));
    }
    if unwind.is_chained() {
        return Err(Error::UnsupportedShape(
            format!("Unwind info at {:#x} is chained", unwind_address)
        ));
    }
    let mut bytes = vec![0u8; function.code_size()];
    code.read(begin, &mut bytes)?;
    Ok(FunctionImage {
        entry_address: begin,
        image_base: entry.image_base,
        code: bytes,
        function,
        unwind,
    })
}

/// Extracts the function at `address`, and its handler if it has one.
pub fn extract_function<C: CodeSource + ?Sized>(
    code: &C,
    address: u64,
) -> Result<ExtractedFunction, Error> {
    let start = skip_jumps(code, address)?;
    let primary = extract_image(code, start)?;
    debug!(
        "Function {:#x}: {:#x} bytes, unwind flags {:x}, {} codes",
        primary.entry_address, primary.code.len(), primary.unwind.flags,
        primary.unwind.codes.len(),
    );
    let handler_rva = match primary.unwind.handler {
        Some(ref handler) => handler.handler,
        None => return Ok(ExtractedFunction::Simple(primary)),
    };
    let handler_start = skip_jumps(code, primary.image_base + handler_rva as u64)?;
    let handler = extract_image(code, handler_start)?;
    if handler.unwind.flags != 0 {
        return Err(Error::UnsupportedShape(format!(
            "Handler {:#x} of {:#x} has unwind flags {:x}",
            handler.entry_address, primary.entry_address, handler.unwind.flags,
        )));
    }
    debug!("Handler {:#x}: {:#x} bytes", handler.entry_address, handler.code.len());
    Ok(ExtractedFunction::WithHandler(primary, handler))
}
