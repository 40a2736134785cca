//! Variable-length integer packing for log record fields.
//!
//! Unsigned values use the 1-9 byte big-endian varint: the high bit of each of
//! the first eight bytes flags a continuation and a ninth byte, when present,
//! carries a full 8 bits. Signed values are zigzag-mapped first so small
//! negative ids (replicated transactions) stay short.

/// Number of bytes `value` occupies once packed.
pub const fn varint_len(value: u64) -> usize {
    if value <= 0x7F {
        1
    } else if value <= 0x3FFF {
        2
    } else if value <= 0x001F_FFFF {
        3
    } else if value <= 0x0FFF_FFFF {
        4
    } else if value <= 0x07_FFFF_FFFF {
        5
    } else if value <= 0x03FF_FFFF_FFFF {
        6
    } else if value <= 0x01_FFFF_FFFF_FFFF {
        7
    } else if value <= 0xFF_FFFF_FFFF_FFFF {
        8
    } else {
        9
    }
}

/// Append `value` to `out`.
#[allow(clippy::cast_possible_truncation)]
pub fn put_varint(out: &mut Vec<u8>, value: u64) {
    let len = varint_len(value);
    let start = out.len();
    out.resize(start + len, 0);
    let buf = &mut out[start..];
    if len == 9 {
        buf[8] = value as u8;
        let mut rest = value >> 8;
        for byte in buf[..8].iter_mut().rev() {
            *byte = (rest as u8 & 0x7F) | 0x80;
            rest >>= 7;
        }
        return;
    }
    let mut rest = value;
    for (i, byte) in buf.iter_mut().enumerate().rev() {
        let continuation = if i == len - 1 { 0 } else { 0x80 };
        *byte = (rest as u8 & 0x7F) | continuation;
        rest >>= 7;
    }
}

/// Read one varint from `buf` at `*pos`, advancing `*pos` past it.
///
/// Returns `None` (leaving `*pos` untouched) if the buffer ends mid-value.
pub fn get_varint(buf: &[u8], pos: &mut usize) -> Option<u64> {
    let bytes = buf.get(*pos..)?;
    let mut value: u64 = 0;
    for (i, &byte) in bytes.iter().enumerate().take(8) {
        value = (value << 7) | u64::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            *pos += i + 1;
            return Some(value);
        }
    }
    let last = *bytes.get(8)?;
    *pos += 9;
    Some((value << 8) | u64::from(last))
}

/// Zigzag-map a signed value onto the unsigned range.
#[inline]
#[allow(clippy::cast_sign_loss)]
pub const fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag`].
#[inline]
#[allow(clippy::cast_possible_wrap)]
pub const fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Append a signed value.
pub fn put_signed(out: &mut Vec<u8>, value: i64) {
    put_varint(out, zigzag(value));
}

/// Read a signed value.
pub fn get_signed(buf: &[u8], pos: &mut usize) -> Option<i64> {
    get_varint(buf, pos).map(unzigzag)
}
