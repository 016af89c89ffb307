//! Raw little-endian buffer access shared by the index codecs.
//!
//! Header structs are `#[repr(C, packed)]` with `Endian` derives; the
//! helpers below move them in and out of byte buffers without alignment
//! requirements. Length checks are the caller's job.

/// View a packed header struct as raw bytes.
pub(crate) fn struct_bytes<T>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

/// Read a packed header struct from the start of `buf`.
///
/// `buf` must hold at least `size_of::<T>()` bytes.
pub(crate) fn read_struct<T: Copy>(buf: &[u8]) -> T {
    debug_assert!(buf.len() >= std::mem::size_of::<T>());
    unsafe { std::ptr::read_unaligned(buf.as_ptr() as *const T) }
}

pub(crate) fn write_u64_slice(buf: &mut Vec<u8>, values: &[u64]) {
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

pub(crate) fn write_u32_slice(buf: &mut Vec<u8>, values: &[u32]) {
    for value in values {
        buf.extend_from_slice(&value.to_le_bytes());
    }
}

/// `buf` must hold at least `count * 8` bytes.
pub(crate) fn read_u64_slice(buf: &[u8], count: usize) -> Vec<u64> {
    (0..count)
        .map(|i| u64::from_le_bytes(buf[i * 8..i * 8 + 8].try_into().unwrap()))
        .collect()
}

/// `buf` must hold at least `count * 4` bytes.
pub(crate) fn read_u32_slice(buf: &[u8], count: usize) -> Vec<u32> {
    (0..count)
        .map(|i| u32::from_le_bytes(buf[i * 4..i * 4 + 4].try_into().unwrap()))
        .collect()
}
