//! x64 unwind metadata: function table entries and unwind descriptors.
//!
//! Layouts follow the platform ABI exactly, as the copies end up registered with
//! the target's exception dispatcher.
//!
//! ```text
//! RUNTIME_FUNCTION    begin: u32, end: u32, unwind_info: u32 (offsets from image base)
//! UNWIND_INFO         version:3 flags:5, size_of_prolog: u8, count_of_codes: u8,
//!                     frame_register:4 frame_offset:4,
//!                     codes: [u16; count_of_codes rounded up to even],
//!                     (if EHANDLER | UHANDLER) handler: u32, language specific data
//!                     (if CHAININFO) RUNTIME_FUNCTION
//! C scope table       count: u32, [begin: u32, end: u32, handler: u32, jump_target: u32]
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::platform::CodeSource;
use crate::Error;

pub const UNW_FLAG_EHANDLER: u8 = 0x1;
pub const UNW_FLAG_UHANDLER: u8 = 0x2;
pub const UNW_FLAG_CHAININFO: u8 = 0x4;

pub const RUNTIME_FUNCTION_SIZE: usize = 12;
pub const UNWIND_INFO_HEADER_SIZE: usize = 4;
pub const UNWIND_CODE_SIZE: usize = 2;
pub const SCOPE_RECORD_SIZE: usize = 16;

/// Largest scope count that is still interpreted as a C scope table.
pub const MAX_SCOPE_RECORDS: u32 = 32;

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RuntimeFunction {
    pub begin: u32,
    pub end: u32,
    pub unwind_info: u32,
}

impl RuntimeFunction {
    pub fn parse(buf: &[u8]) -> Result<RuntimeFunction, Error> {
        if buf.len() < RUNTIME_FUNCTION_SIZE {
            return Err(Error::Other("Truncated function table entry".into()));
        }
        Ok(RuntimeFunction {
            begin: LittleEndian::read_u32(&buf[0..]),
            end: LittleEndian::read_u32(&buf[4..]),
            unwind_info: LittleEndian::read_u32(&buf[8..]),
        })
    }

    pub fn write(&self, out: &mut [u8]) -> Result<usize, Error> {
        if out.len() < RUNTIME_FUNCTION_SIZE {
            return Err(Error::OutOfBounds(0, RUNTIME_FUNCTION_SIZE));
        }
        LittleEndian::write_u32(&mut out[0..], self.begin);
        LittleEndian::write_u32(&mut out[4..], self.end);
        LittleEndian::write_u32(&mut out[8..], self.unwind_info);
        Ok(RUNTIME_FUNCTION_SIZE)
    }

    pub fn code_size(&self) -> usize {
        self.end.saturating_sub(self.begin) as usize
    }

    pub fn contains(&self, rva: u32) -> bool {
        rva >= self.begin && rva <= self.end
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ScopeRecord {
    pub begin: u32,
    pub end: u32,
    pub handler: u32,
    pub jump_target: u32,
}

/// What follows the handler offset in an unwind descriptor.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LanguageData {
    /// A `__C_specific_handler` style scope table.
    ScopeTable(Vec<ScopeRecord>),
    /// Anything else; only its first word is carried over, verbatim.
    Opaque(u32),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HandlerData {
    /// Offset of the exception/termination handler from the image base.
    pub handler: u32,
    pub language: LanguageData,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UnwindInfo {
    pub version: u8,
    pub flags: u8,
    pub size_of_prolog: u8,
    pub frame_register: u8,
    pub frame_offset: u8,
    pub codes: Vec<u16>,
    pub handler: Option<HandlerData>,
}

fn padded_code_count(count: usize) -> usize {
    (count + 1) & !1
}

impl UnwindInfo {
    pub fn has_handler(&self) -> bool {
        self.flags & (UNW_FLAG_EHANDLER | UNW_FLAG_UHANDLER) != 0
    }

    pub fn is_chained(&self) -> bool {
        self.flags & UNW_FLAG_CHAININFO != 0
    }

    /// Number of bytes `write` produces.
    pub fn size(&self) -> usize {
        let mut size = UNWIND_INFO_HEADER_SIZE +
            padded_code_count(self.codes.len()) * UNWIND_CODE_SIZE;
        if let Some(ref handler) = self.handler {
            size += 4;
            size += match handler.language {
                LanguageData::ScopeTable(ref records) => 4 + records.len() * SCOPE_RECORD_SIZE,
                LanguageData::Opaque(_) => 4,
            };
        }
        size
    }

    /// Reads the descriptor at `address`.
    ///
    /// `function` is the entry owning the descriptor, with `image_base` the base
    /// its offsets are relative to; it is used to tell scope tables apart from
    /// other language specific data. Chained descriptors are read up to their
    /// unwind codes only.
    pub fn read<C: CodeSource + ?Sized>(
        code: &C,
        address: u64,
        function: &RuntimeFunction,
    ) -> Result<UnwindInfo, Error> {
        let mut header = [0u8; UNWIND_INFO_HEADER_SIZE];
        code.read(address, &mut header)?;
        let count = header[2] as usize;
        let mut codes_buf = vec![0u8; count * UNWIND_CODE_SIZE];
        code.read(address + UNWIND_INFO_HEADER_SIZE as u64, &mut codes_buf)?;
        let codes = codes_buf.chunks(UNWIND_CODE_SIZE)
            .map(LittleEndian::read_u16)
            .collect::<Vec<_>>();
        let mut info = UnwindInfo {
            version: header[0] & 0x7,
            flags: header[0] >> 3,
            size_of_prolog: header[1],
            frame_register: header[3] & 0xf,
            frame_offset: header[3] >> 4,
            codes,
            handler: None,
        };
        if info.has_handler() && !info.is_chained() {
            let handler_address = address +
                (UNWIND_INFO_HEADER_SIZE + padded_code_count(count) * UNWIND_CODE_SIZE) as u64;
            let handler = code.read_u32(handler_address)?;
            let language =
                read_language_data(code, handler_address + 4, function)?;
            info.handler = Some(HandlerData {
                handler,
                language,
            });
        }
        Ok(info)
    }

    /// Serializes the descriptor, returning the amount of bytes written.
    pub fn write(&self, out: &mut [u8]) -> Result<usize, Error> {
        let size = self.size();
        let out = out.get_mut(..size).ok_or_else(|| Error::OutOfBounds(0, size))?;
        out[0] = (self.version & 0x7) | (self.flags << 3);
        out[1] = self.size_of_prolog;
        out[2] = self.codes.len() as u8;
        out[3] = (self.frame_register & 0xf) | (self.frame_offset << 4);
        let mut pos = UNWIND_INFO_HEADER_SIZE;
        for i in 0..padded_code_count(self.codes.len()) {
            let code = self.codes.get(i).cloned().unwrap_or(0);
            LittleEndian::write_u16(&mut out[pos..], code);
            pos += UNWIND_CODE_SIZE;
        }
        if let Some(ref handler) = self.handler {
            LittleEndian::write_u32(&mut out[pos..], handler.handler);
            pos += 4;
            match handler.language {
                LanguageData::ScopeTable(ref records) => {
                    LittleEndian::write_u32(&mut out[pos..], records.len() as u32);
                    pos += 4;
                    for record in records {
                        LittleEndian::write_u32(&mut out[pos..], record.begin);
                        LittleEndian::write_u32(&mut out[pos + 4..], record.end);
                        LittleEndian::write_u32(&mut out[pos + 8..], record.handler);
                        LittleEndian::write_u32(&mut out[pos + 12..], record.jump_target);
                        pos += SCOPE_RECORD_SIZE;
                    }
                }
                LanguageData::Opaque(word) => {
                    LittleEndian::write_u32(&mut out[pos..], word);
                    pos += 4;
                }
            }
        }
        Ok(pos)
    }

    /// Returns a copy with image relative offsets moved to the copied code.
    ///
    /// Scope table addresses inside `source` are moved so that `source.begin`
    /// lands at `code_offset`; addresses outside of it (filter functions elsewhere
    /// in the image, `EXCEPTION_EXECUTE_HANDLER`) are kept. The handler offset is
    /// replaced with `handler_offset` when the handler was copied as well.
    pub fn rebased(
        &self,
        source: &RuntimeFunction,
        code_offset: u32,
        handler_offset: Option<u32>,
    ) -> UnwindInfo {
        let rebase = |rva: u32| {
            if source.contains(rva) {
                rva - source.begin + code_offset
            } else {
                rva
            }
        };
        let mut info = self.clone();
        if let Some(ref mut handler) = info.handler {
            if let Some(offset) = handler_offset {
                handler.handler = offset;
            }
            if let LanguageData::ScopeTable(ref mut records) = handler.language {
                for record in records.iter_mut() {
                    record.begin = rebase(record.begin);
                    record.end = rebase(record.end);
                    record.handler = rebase(record.handler);
                    record.jump_target = rebase(record.jump_target);
                }
            }
        }
        info
    }
}

fn read_language_data<C: CodeSource + ?Sized>(
    code: &C,
    address: u64,
    function: &RuntimeFunction,
) -> Result<LanguageData, Error> {
    let word = code.read_u32(address)?;
    if word == 0 || word > MAX_SCOPE_RECORDS {
        return Ok(LanguageData::Opaque(word));
    }
    let mut buf = vec![0u8; word as usize * SCOPE_RECORD_SIZE];
    if code.read(address + 4, &mut buf).is_err() {
        return Ok(LanguageData::Opaque(word));
    }
    let records = buf.chunks(SCOPE_RECORD_SIZE)
        .map(|x| ScopeRecord {
            begin: LittleEndian::read_u32(&x[0..]),
            end: LittleEndian::read_u32(&x[4..]),
            handler: LittleEndian::read_u32(&x[8..]),
            jump_target: LittleEndian::read_u32(&x[12..]),
        })
        .collect::<Vec<_>>();
    let in_function = records.iter()
        .all(|x| function.contains(x.begin) && function.contains(x.end));
    if in_function {
        Ok(LanguageData::ScopeTable(records))
    } else {
        Ok(LanguageData::Opaque(word))
    }
}
