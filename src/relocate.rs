//! Pointer relocation of the staged data region.
//!
//! A relocator receives the whole staging buffer and the remote addresses it will
//! be written to, and rewrites the thunk context so that every pointer in it is
//! valid in the target. The local buffer mirrors the remote pages one to one, so
//! a local offset `x` inside the data page is `remote_data_base + x - data_offset`
//! in the target; no other state is needed.

use crate::platform::PAGE_SIZE;
use crate::thunk::{RawThunkContext, ThunkTemplate, THUNK_CONTEXT_SIZE};
use crate::{invariant, Error};

/// Inputs of a relocation.
#[derive(Copy, Clone, Debug)]
pub struct RelocationContext<'a> {
    pub template: &'a ThunkTemplate,
    /// Offset of the data page in the staging buffer.
    pub data_offset: usize,
    /// Offset of the thunk context in the staging buffer.
    pub thunk_offset: usize,
    pub remote_data_base: u64,
    pub remote_function_table: u64,
    pub remote_code_base: u64,
    /// Remote address of the protocol marker function.
    pub remote_marker: u64,
    pub entry_count: u16,
    /// Remote address of the extra writable pages, 0 if there are none.
    pub remote_writable: u64,
    pub writable_size: usize,
}

impl<'a> RelocationContext<'a> {
    /// Remote address of the byte at `offset` in the staging buffer's data pages.
    pub fn remote_address(&self, offset: usize) -> Result<u64, Error> {
        match offset.checked_sub(self.data_offset) {
            Some(x) => Ok(self.remote_data_base + x as u64),
            None => invariant(format!("Offset {:#x} is before the data page", offset)),
        }
    }
}

/// Results of a relocation.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Relocated {
    /// Bytes written starting from the thunk context.
    pub bytes_written: usize,
    /// Offset of the payload in the staging buffer.
    pub local_payload: usize,
    /// Address of the payload in the target.
    pub remote_payload: u64,
}

/// Rewrites the thunk context of a staging buffer for its remote location.
///
/// Implementations must be pure functions of `buffer` and `ctx`.
pub trait ThunkRelocator {
    fn relocate(&self, buffer: &mut [u8], ctx: &RelocationContext) -> Result<Relocated, Error>;
}

/// Fixes up pointers inside the caller payload once its remote address is known.
pub trait PayloadRelocator {
    fn relocate(&self, payload: &mut [u8], remote_payload: u64) -> Result<(), Error>;
}

impl<F> PayloadRelocator for F
where F: Fn(&mut [u8], u64) -> Result<(), Error>,
{
    fn relocate(&self, payload: &mut [u8], remote_payload: u64) -> Result<(), Error> {
        self(payload, remote_payload)
    }
}

/// Checks that `local` (a staging buffer offset) and `remote` are at the same
/// offset within their pages.
pub fn check_congruence(local: usize, remote: u64) -> Result<(), Error> {
    let mask = PAGE_SIZE - 1;
    if local & mask != remote as usize & mask {
        return invariant(format!(
            "Local offset {:#x} and remote address {:#x} are not page congruent",
            local, remote,
        ));
    }
    Ok(())
}

/// Appends the module path and function name after the thunk context and points
/// the context at the remote code, function table, marker and strings.
#[derive(Copy, Clone, Debug, Default)]
pub struct DefaultRelocator;

fn put_string(buffer: &mut [u8], offset: usize, size: usize, data: &[u8]) -> Result<(), Error> {
    let out = buffer.get_mut(offset..offset + size)
        .ok_or(Error::OutOfBounds(offset, size))?;
    if data.len() >= size {
        return invariant(format!("String of {} bytes does not fit in {}", data.len(), size));
    }
    out[..data.len()].copy_from_slice(data);
    for byte in &mut out[data.len()..] {
        *byte = 0;
    }
    Ok(())
}

impl ThunkRelocator for DefaultRelocator {
    fn relocate(&self, buffer: &mut [u8], ctx: &RelocationContext) -> Result<Relocated, Error> {
        let template = ctx.template;
        let thunk = ctx.thunk_offset;
        let context_bytes = buffer.get(thunk..thunk + THUNK_CONTEXT_SIZE)
            .ok_or(Error::OutOfBounds(thunk, THUNK_CONTEXT_SIZE))?;
        let mut context = RawThunkContext::parse(context_bytes)?;

        let module_path = thunk + THUNK_CONTEXT_SIZE;
        let path_bytes = template.module_path.iter()
            .flat_map(|x| x.to_le_bytes().to_vec())
            .collect::<Vec<u8>>();
        put_string(buffer, module_path, template.module_path_size(), &path_bytes)?;
        let function_name = module_path + template.module_path_size();
        put_string(buffer, function_name, template.function_name_size(), &template.function_name)?;
        let payload = function_name + template.function_name_size();

        let user_data_offset = payload - thunk;
        if user_data_offset > u16::max_value() as usize {
            return invariant(format!("Payload offset {:#x} does not fit", user_data_offset));
        }
        context.marker = ctx.remote_marker;
        context.entry_count = ctx.entry_count;
        context.user_data_offset = user_data_offset as u16;
        context.function_table = ctx.remote_function_table;
        context.base_code_address = ctx.remote_code_base;
        context.module_path = ctx.remote_address(module_path)?;
        context.function_name = ctx.remote_address(function_name)?;
        context.writable_data = ctx.remote_writable;
        context.writable_size = ctx.writable_size as u64;
        context.write(&mut buffer[thunk..])?;

        let remote_payload = ctx.remote_address(payload)?;
        check_congruence(payload, remote_payload)?;
        Ok(Relocated {
            bytes_written: user_data_offset,
            local_payload: payload,
            remote_payload,
        })
    }
}
