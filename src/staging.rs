//! The local staging buffer, a byte for byte mirror of the remote pages.
//!
//! ```text
//! code page   0x00   breakpoint pad (16 bytes of 0xcc)
//!             0x10   function code
//!                    handler code          ; if the function has a handler
//!                    protocol marker stub  ; unless the marker is external
//!                    (rest filled with 0xcc)
//! data page   0x00   function table        ; 1 or 2 entries
//!                    unwind info
//!                    handler unwind info   ; if the function has a handler
//!                    thunk context
//!                    module path, function name
//!                    payload
//! writable pages                           ; only with the extended layout
//! ```
//!
//! Offsets in the buffer are offsets from the remote code base as well; the
//! function table entries and unwind info are written relative to it.

use crate::extract::{ExtractedFunction, FunctionImage};
use crate::platform::PAGE_SIZE;
use crate::relocate::{check_congruence, PayloadRelocator, RelocationContext, ThunkRelocator};
use crate::thunk::{ProtocolMarker, ThunkTemplate, THUNK_CONTEXT_SIZE};
use crate::unwind::{RuntimeFunction, RUNTIME_FUNCTION_SIZE};
use crate::{align_up, invariant, Error};

/// Offset of the function in the code page.
pub const CODE_OFFSET: usize = 0x10;
/// Filler of the code page.
pub const BREAKPOINT: u8 = 0xcc;
const CODE_ALIGN: usize = 0x10;
const DATA_ALIGN: usize = 0x10;
/// Gap left between copied functions.
const CODE_GAP: usize = 0x10;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct StagingOptions {
    /// Read/write pages reserved after the data page for the injected code's own
    /// use. Zero gives the two page layout.
    pub writable_pages: usize,
}

/// A range of the staging buffer.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    fn new(offset: usize, len: usize) -> Region {
        Region {
            offset,
            len,
        }
    }

    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Where everything goes in the staging buffer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Layout {
    pub page_count: usize,
    pub code: Region,
    pub handler_code: Option<Region>,
    pub marker_stub: Option<Region>,
    pub function_table: Region,
    pub entry_count: u16,
    pub unwind: Region,
    pub handler_unwind: Option<Region>,
    pub thunk: Region,
    pub thunk_strings: Region,
    pub payload: Region,
    pub writable: Option<Region>,
    /// End of everything written to the data page.
    pub data_end: usize,
}

impl Layout {
    /// Computes the layout, rejecting anything that does not fit.
    pub fn compute(
        image: &ExtractedFunction,
        template: &ThunkTemplate,
        payload_size: usize,
        options: StagingOptions,
    ) -> Result<Layout, Error> {
        let primary = image.primary();
        let code = Region::new(CODE_OFFSET, primary.code_size());
        let handler_code = image.handler()
            .map(|h| Region::new(align_up(code.end() + CODE_GAP, CODE_ALIGN), h.code_size()));
        let last_code = handler_code.unwrap_or(code);
        let marker_stub = match template.marker.stub_size() {
            0 => None,
            size => Some(Region::new(align_up(last_code.end() + CODE_GAP, CODE_ALIGN), size)),
        };
        let code_end = marker_stub.unwrap_or(last_code).end();
        if code_end > PAGE_SIZE {
            return Err(Error::CodeTooLarge(code_end, PAGE_SIZE));
        }

        let data_page_end = PAGE_SIZE * 2;
        let entry_count = image.entry_count();
        let function_table =
            Region::new(PAGE_SIZE, entry_count as usize * RUNTIME_FUNCTION_SIZE);
        let unwind = Region::new(
            align_up(function_table.end(), DATA_ALIGN),
            primary.unwind.size(),
        );
        let handler_unwind = image.handler()
            .map(|h| Region::new(align_up(unwind.end(), DATA_ALIGN), h.unwind.size()));
        let thunk = Region::new(
            align_up(handler_unwind.unwrap_or(unwind).end(), DATA_ALIGN),
            THUNK_CONTEXT_SIZE,
        );
        let thunk_strings = Region::new(thunk.end(), template.strings_size());
        if thunk_strings.end() > data_page_end {
            return Err(Error::DataPageOverflow(thunk_strings.end() - PAGE_SIZE, PAGE_SIZE));
        }
        let payload = Region::new(thunk_strings.end(), payload_size);
        if payload.end() > data_page_end {
            return Err(Error::PayloadTooLarge(payload_size, data_page_end - payload.offset));
        }
        let writable_size = options.writable_pages.checked_mul(PAGE_SIZE)
            .filter(|&size| size.checked_add(data_page_end).is_some())
            .ok_or(Error::InvalidParameter("writable pages"))?;
        let writable = match writable_size {
            0 => None,
            size => Some(Region::new(data_page_end, size)),
        };
        Ok(Layout {
            page_count: 2 + options.writable_pages,
            code,
            handler_code,
            marker_stub,
            function_table,
            entry_count,
            unwind,
            handler_unwind,
            thunk,
            thunk_strings,
            payload,
            writable,
            data_end: payload.end(),
        })
    }

    pub fn size(&self) -> usize {
        self.page_count * PAGE_SIZE
    }
}

/// Remote addresses the staging buffer is relocated to.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RemoteTargets {
    pub code_base: u64,
    /// Always `code_base + PAGE_SIZE`.
    pub data_base: u64,
}

/// Remote addresses of the relocated pieces.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Placement {
    /// Where the remote thread starts.
    pub entry: u64,
    /// The thunk context, passed as the thread argument.
    pub thunk: u64,
    pub payload: u64,
    pub function_table: u64,
    pub marker: u64,
    /// The extra read/write pages, if any were requested.
    pub writable: Option<u64>,
}

pub struct StagingBuffer {
    buf: Vec<u8>,
    layout: Layout,
    relocated: bool,
}

fn function_entry(code: Region, unwind: Region) -> RuntimeFunction {
    RuntimeFunction {
        begin: code.offset as u32,
        end: code.end() as u32,
        unwind_info: unwind.offset as u32,
    }
}

impl StagingBuffer {
    /// Lays out and copies `image`, the thunk context of `template` and
    /// `payload`. Pointers in the context are left for `relocate`.
    pub fn build(
        image: &ExtractedFunction,
        template: &ThunkTemplate,
        payload: &[u8],
        options: StagingOptions,
    ) -> Result<StagingBuffer, Error> {
        let layout = Layout::compute(image, template, payload.len(), options)?;
        let size = layout.size();
        let mut buf = Vec::new();
        buf.try_reserve_exact(size).map_err(|_| Error::LocalAllocation(size))?;
        buf.resize(size, 0);
        for byte in &mut buf[..PAGE_SIZE] {
            *byte = BREAKPOINT;
        }
        let mut staging = StagingBuffer {
            buf,
            layout,
            relocated: false,
        };
        let layout = staging.layout.clone();
        debug!("Staging layout {:#x?}", layout);

        let primary = image.primary();
        staging.copy_code(layout.code, primary)?;
        if let (Some(region), Some(handler)) = (layout.handler_code, image.handler()) {
            staging.copy_code(region, handler)?;
        }
        if let (Some(region), Some(stub)) = (layout.marker_stub, template.marker.stub()) {
            staging.region_mut(region)?.copy_from_slice(&stub);
        }

        // The data page cursor is advanced by what actually gets written, and
        // compared against the layout afterwards.
        let mut cursor = layout.function_table.offset;
        let mut entries = vec![(layout.code, layout.unwind)];
        if let (Some(code), Some(unwind)) = (layout.handler_code, layout.handler_unwind) {
            entries.push((code, unwind));
        }
        for &(code, unwind) in &entries {
            let entry = function_entry(code, unwind);
            cursor += entry.write(staging.tail_mut(cursor)?)?;
        }
        if entries.len() != layout.entry_count as usize {
            return invariant(format!(
                "Wrote {} function entries, expected {}", entries.len(), layout.entry_count,
            ));
        }

        let handler_offset = layout.handler_code.map(|x| x.offset as u32);
        let unwind = primary.unwind.rebased(&primary.function, layout.code.offset as u32, handler_offset);
        cursor = align_up(cursor, DATA_ALIGN);
        cursor += unwind.write(staging.tail_mut(cursor)?)?;
        if let (Some(handler), Some(code)) = (image.handler(), layout.handler_code) {
            let unwind = handler.unwind.rebased(&handler.function, code.offset as u32, None);
            cursor = align_up(cursor, DATA_ALIGN);
            cursor += unwind.write(staging.tail_mut(cursor)?)?;
        }

        cursor = align_up(cursor, DATA_ALIGN);
        cursor += template.context().write(staging.tail_mut(cursor)?)?;
        cursor += template.strings_size();
        staging.tail_mut(cursor)?
            .get_mut(..payload.len())
            .ok_or(Error::OutOfBounds(cursor, payload.len()))?
            .copy_from_slice(payload);
        cursor += payload.len();

        if cursor != layout.data_end {
            return invariant(format!(
                "Data ends at {:#x}, layout expected {:#x}", cursor, layout.data_end,
            ));
        }
        if staging.buf[..CODE_OFFSET].iter().any(|&x| x != BREAKPOINT) {
            return invariant("Breakpoint pad before the code was overwritten");
        }
        Ok(staging)
    }

    fn copy_code(&mut self, region: Region, image: &FunctionImage) -> Result<(), Error> {
        if region.len != image.code.len() {
            return invariant(format!(
                "Code region of {:#x} bytes for {:#x} bytes of code", region.len, image.code.len(),
            ));
        }
        self.region_mut(region)?.copy_from_slice(&image.code);
        Ok(())
    }

    fn tail_mut(&mut self, offset: usize) -> Result<&mut [u8], Error> {
        let len = self.buf.len();
        self.buf.get_mut(offset..).ok_or(Error::OutOfBounds(offset, len))
    }

    /// Rewrites pointers for the remote pages at `targets`.
    ///
    /// Runs `relocator` on the thunk context, verifies its results against the
    /// layout, and then lets `payload_relocator` fix up the payload.
    pub fn relocate(
        &mut self,
        template: &ThunkTemplate,
        relocator: &dyn ThunkRelocator,
        payload_relocator: Option<&dyn PayloadRelocator>,
        targets: RemoteTargets,
    ) -> Result<Placement, Error> {
        if self.relocated {
            return invariant("Staging buffer was already relocated");
        }
        if targets.code_base as usize & (PAGE_SIZE - 1) != 0 ||
            targets.data_base != targets.code_base + PAGE_SIZE as u64
        {
            return Err(Error::InvalidParameter("remote pages are not page aligned and contiguous"));
        }
        let layout = self.layout.clone();
        let remote = |offset: usize| targets.code_base + offset as u64;
        let marker = match (template.marker, layout.marker_stub) {
            (ProtocolMarker::External(address), None) => address,
            (ProtocolMarker::External(_), Some(_)) | (_, None) => {
                return invariant("Protocol marker does not match the staged stub");
            }
            (_, Some(stub)) => remote(stub.offset),
        };
        let ctx = RelocationContext {
            template,
            data_offset: PAGE_SIZE,
            thunk_offset: layout.thunk.offset,
            remote_data_base: targets.data_base,
            remote_function_table: remote(layout.function_table.offset),
            remote_code_base: targets.code_base,
            remote_marker: marker,
            entry_count: layout.entry_count,
            remote_writable: layout.writable.map(|w| remote(w.offset)).unwrap_or(0),
            writable_size: layout.writable.map(|w| w.len).unwrap_or(0),
        };
        let result = relocator.relocate(&mut self.buf, &ctx)?;
        debug!("Relocated thunk: {:x?}", result);

        let thunk = remote(layout.thunk.offset);
        if result.local_payload.wrapping_sub(result.bytes_written) != layout.thunk.offset {
            return invariant(format!(
                "Local payload {:#x} is not {:#x} bytes past the thunk at {:#x}",
                result.local_payload, result.bytes_written, layout.thunk.offset,
            ));
        }
        if result.remote_payload.wrapping_sub(result.bytes_written as u64) != thunk {
            return invariant(format!(
                "Remote payload {:#x} is not {:#x} bytes past the thunk at {:#x}",
                result.remote_payload, result.bytes_written, thunk,
            ));
        }
        if result.local_payload != layout.payload.offset {
            return invariant(format!(
                "Relocator placed the payload at {:#x}, layout has it at {:#x}",
                result.local_payload, layout.payload.offset,
            ));
        }
        check_congruence(result.local_payload, result.remote_payload)?;

        if let Some(payload_relocator) = payload_relocator {
            let payload = self.region_mut(layout.payload)?;
            payload_relocator.relocate(payload, result.remote_payload)?;
        }
        self.relocated = true;
        Ok(Placement {
            entry: remote(layout.code.offset),
            thunk,
            payload: result.remote_payload,
            function_table: remote(layout.function_table.offset),
            marker,
            writable: layout.writable.map(|w| remote(w.offset)),
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_relocated(&self) -> bool {
        self.relocated
    }

    pub fn region(&self, region: Region) -> Result<&[u8], Error> {
        self.buf.get(region.offset..region.end())
            .ok_or(Error::OutOfBounds(region.offset, region.len))
    }

    pub fn region_mut(&mut self, region: Region) -> Result<&mut [u8], Error> {
        self.buf.get_mut(region.offset..region.end())
            .ok_or(Error::OutOfBounds(region.offset, region.len))
    }
}
