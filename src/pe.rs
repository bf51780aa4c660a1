//! Reading PE64 images mapped in memory.
//!
//! Used to resolve the bootstrap functions in the target without loading
//! anything there: the export directory of the target's copy of a module gives
//! the address directly.

use byteorder::{ByteOrder, LittleEndian};

use crate::Error;

const PE_HEADER_POINTER: u32 = 0x3c;
const SECTION_COUNT: u32 = 0x6;
const EXPORT_DIRECTORY: u32 = 0x88;
const SECTION_TABLE: u32 = 0x108;
const SECTION_HEADER_SIZE: u32 = 0x28;

/// Bytes read from the start of a module to find its size.
pub const HEADER_SIZE: usize = 0x1000;

pub(crate) fn read_u32(buf: &[u8], offset: u32) -> Result<u32, Error> {
    let offset = offset as usize;
    let slice = buf.get(offset..(offset.wrapping_add(4)))
        .ok_or_else(|| Error::Other("Oob".into()))?;
    Ok(LittleEndian::read_u32(slice))
}

pub(crate) fn read_u16(buf: &[u8], offset: u32) -> Result<u16, Error> {
    let offset = offset as usize;
    let slice = buf.get(offset..(offset.wrapping_add(2)))
        .ok_or_else(|| Error::Other("Oob".into()))?;
    Ok(LittleEndian::read_u16(slice))
}

/// Offset of element `index` of an array of `size` byte elements at `array`.
fn element(array: u32, index: u32, size: u32) -> Result<u32, Error> {
    index.checked_mul(size)
        .and_then(|x| x.checked_add(array))
        .ok_or_else(|| Error::Other(format!("Offset {:#x} + {:#x} * {} overflows", array, index, size)))
}

/// Size of the mapped image, computed from the section table in `header`.
pub fn image_size(header: &[u8]) -> Result<u32, Error> {
    let pe_header = read_u32(header, PE_HEADER_POINTER)?;
    if read_u32(header, pe_header)? != 0x4550 {
        return Err(Error::Other("Not a PE image".into()));
    }
    let section_count = read_u16(header, element(pe_header, 1, SECTION_COUNT)?)?;
    let sections = element(pe_header, 1, SECTION_TABLE)?;
    let mut max = HEADER_SIZE as u32;
    for i in 0..section_count as u32 {
        let section = element(sections, i, SECTION_HEADER_SIZE)?;
        let size = read_u32(header, element(section, 1, 0x8)?)?;
        let rva = read_u32(header, element(section, 1, 0xc)?)?;
        max = std::cmp::max(rva.saturating_add(size), max);
    }
    Ok(max)
}

/// Finds export `func` of the image mapped at `base`, `image` being a copy of it.
///
/// Forwarded exports are rejected, as following them would need the loader.
pub fn find_export(base: u64, image: &[u8], func: &[u8]) -> Result<u64, Error> {
    let pe_header = read_u32(image, PE_HEADER_POINTER)?;
    let directory = element(pe_header, 1, EXPORT_DIRECTORY)?;
    let export_rva = read_u32(image, directory)?;
    let export_size = read_u32(image, element(directory, 1, 4)?)?;
    if export_rva == 0 {
        return Err(Error::Other("No exports".into()));
    }
    let export_count = read_u32(image, element(export_rva, 1, 0x14)?)?;
    let name_count = read_u32(image, element(export_rva, 1, 0x18)?)?;
    let export_addresses = read_u32(image, element(export_rva, 1, 0x1c)?)?;
    let export_names = read_u32(image, element(export_rva, 1, 0x20)?)?;
    let export_ordinals = read_u32(image, element(export_rva, 1, 0x24)?)?;
    for i in 0..name_count {
        let name = read_u32(image, element(export_names, i, 4)?)? as usize;
        let matches = image.get(name..name + func.len() + 1)
            .map(|x| x.iter().cloned().eq(func.iter().cloned().chain(Some(0))))
            .unwrap_or(false);
        if !matches {
            continue;
        }
        let ordinal = read_u16(image, element(export_ordinals, i, 2)?)? as u32;
        if ordinal >= export_count {
            return Err(Error::Other(format!("Export ordinal {} out of range", ordinal)));
        }
        let address = read_u32(image, element(export_addresses, ordinal, 4)?)?;
        let forwarders = export_rva as u64..export_rva as u64 + export_size as u64;
        if forwarders.contains(&(address as u64)) {
            return Err(Error::Other(
                format!("{} is forwarded", String::from_utf8_lossy(func))
            ));
        }
        return base.checked_add(address as u64)
            .ok_or_else(|| Error::Other(format!("Export at {:#x} + {:#x} overflows", base, address)));
    }
    Err(Error::Other(format!("No export {} found", String::from_utf8_lossy(func))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(buf: &mut [u8], offset: usize, data: &[u8]) {
        buf[offset..offset + data.len()].copy_from_slice(data);
    }

    fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
        put(buf, offset, &value.to_le_bytes());
    }

    fn image() -> Vec<u8> {
        let mut buf = vec![0u8; 0x1000];
        let pe = 0x80;
        put_u32(&mut buf, 0x3c, pe as u32);
        put_u32(&mut buf, pe, 0x4550);
        put(&mut buf, pe + 6, &2u16.to_le_bytes());
        put_u32(&mut buf, pe + 0x88, 0x400);
        put_u32(&mut buf, pe + 0x8c, 0x200);
        let sections = pe + 0x108;
        put_u32(&mut buf, sections + 0x8, 0x800);
        put_u32(&mut buf, sections + 0xc, 0x1000);
        put_u32(&mut buf, sections + 0x28 + 0x8, 0x1234);
        put_u32(&mut buf, sections + 0x28 + 0xc, 0x2000);

        put_u32(&mut buf, 0x414, 3);
        put_u32(&mut buf, 0x418, 3);
        put_u32(&mut buf, 0x41c, 0x500);
        put_u32(&mut buf, 0x420, 0x520);
        put_u32(&mut buf, 0x424, 0x540);
        // Names are sorted, ordinals are not in name order
        put_u32(&mut buf, 0x500, 0x1100);
        put_u32(&mut buf, 0x504, 0x1200);
        put_u32(&mut buf, 0x508, 0x450);
        put_u32(&mut buf, 0x520, 0x560);
        put_u32(&mut buf, 0x524, 0x570);
        put_u32(&mut buf, 0x528, 0x580);
        put(&mut buf, 0x540, &[2, 0, 1, 0, 0, 0]);
        put(&mut buf, 0x560, b"Forwarded\0");
        put(&mut buf, 0x570, b"GetProcAddress\0");
        put(&mut buf, 0x580, b"LoadLibraryW\0");
        put(&mut buf, 0x450, b"NTDLL.Forwarded\0");
        buf
    }

    #[test]
    fn finds_exports() {
        let image = image();
        let base = 0x7ff8_1000_0000;
        assert_eq!(find_export(base, &image, b"LoadLibraryW").unwrap(), base + 0x1100);
        assert_eq!(find_export(base, &image, b"GetProcAddress").unwrap(), base + 0x1200);
        assert!(find_export(base, &image, b"LoadLibrary").is_err());
        assert!(find_export(base, &image, b"Missing").is_err());
    }

    #[test]
    fn rejects_forwarders() {
        let image = image();
        match find_export(0x1000_0000, &image, b"Forwarded") {
            Err(Error::Other(desc)) => assert!(desc.contains("forwarded")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn malformed_export_directory_is_an_error() {
        let mut image = image();
        put_u32(&mut image, 0x80 + 0x88, 0xffff_fff0);
        assert!(find_export(0x1000_0000, &image, b"LoadLibraryW").is_err());

        // Forwarder range reaching past the end of the address space
        let mut image = self::image();
        put_u32(&mut image, 0x80 + 0x8c, 0xffff_ff00);
        assert!(find_export(0x1000_0000, &image, b"LoadLibraryW").is_err());
    }

    #[test]
    fn size_from_sections() {
        assert_eq!(image_size(&image()).unwrap(), 0x3234);
        assert!(image_size(&[0u8; 0x100]).is_err());
        let mut header = image();
        put_u32(&mut header, 0x3c, 0xffff_fffc);
        assert!(image_size(&header).is_err());
    }
}
