use std::time::{SystemTime, UNIX_EPOCH};

use crate::stream::{Stream, StreamError};

/// Reads a specific sector from a stream into a buffer.
///
/// # Arguments
///
/// - `stream`: The stream to read from.
/// - `sector`: The sector number to read.
/// - `sector_size`: The size in bytes of a sector.
/// - `buffer`: A mutable reference to a vector where the sector data will be stored.
///
/// The buffer will be resized to match the sector size.
///
/// # Errors
///
/// Returns a `StreamError` if the sector cannot be read completely.
pub fn read_sector(
    stream: &mut dyn Stream,
    sector: u64,
    sector_size: usize,
    buffer: &mut Vec<u8>,
) -> Result<(), StreamError> {
    buffer.resize(sector_size, 0);

    let read = stream.force_read(buffer, sector * sector_size as u64)?;
    if read != sector_size {
        return Err(StreamError::ShortTransfer {
            offset: sector * sector_size as u64,
            expected: sector_size,
            done: read,
        });
    }

    Ok(())
}

/// Writes a complete sector to a stream.
pub fn write_sector(
    stream: &mut dyn Stream,
    sector: u64,
    sector_size: usize,
    buffer: &[u8],
) -> Result<(), StreamError> {
    let written = stream.force_write(&buffer[..sector_size], sector * sector_size as u64)?;
    if written != sector_size {
        return Err(StreamError::ShortTransfer {
            offset: sector * sector_size as u64,
            expected: sector_size,
            done: written,
        });
    }

    Ok(())
}

/// Extracts a 32-bit unsigned integer from a buffer at a given offset.
///
/// # Panics
///
/// Panics if the slice does not contain enough bytes starting from the offset.
pub fn u32_at(buffer: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(
        buffer[offset..offset + 4]
            .try_into()
            .expect("invalid slice"),
    )
}

/// Extracts a 16-bit unsigned integer from a buffer at a given offset.
///
/// # Panics
///
/// Panics if the slice does not contain enough bytes starting from the offset.
pub fn u16_at(buffer: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(
        buffer[offset..offset + 2]
            .try_into()
            .expect("invalid slice"),
    )
}

/// Stores a 32-bit unsigned integer in little-endian order at a given offset.
pub fn set_u32_at(buffer: &mut [u8], offset: usize, value: u32) {
    buffer[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// Stores a 16-bit unsigned integer in little-endian order at a given offset.
pub fn set_u16_at(buffer: &mut [u8], offset: usize, value: u16) {
    buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

/// Parses a size such as `512`, `4K`, `2M`, `1G` or `8s` (sectors of 512 bytes).
///
/// Returns the value and the unparsed remainder of the string.
pub fn parse_size(s: &str) -> Option<(u64, &str)> {
    let digits = s.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return None;
    }
    let value: u64 = s[..digits].parse().ok()?;
    let rest = &s[digits..];

    let (shift, consumed) = match rest.bytes().next() {
        Some(b'K') | Some(b'k') => (10, 1),
        Some(b'M') | Some(b'm') => (20, 1),
        Some(b'G') | Some(b'g') => (30, 1),
        Some(b'S') | Some(b's') => (9, 1),
        _ => (0, 0),
    };

    Some((value.checked_shl(shift)?, &rest[consumed..]))
}

/// Converts a point in time into the DOS `(date, time)` word pair (UTC).
pub fn dos_timestamp(when: SystemTime) -> (u16, u16) {
    let secs = when
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);

    let days = (secs / 86_400) as i64;
    let rem = secs % 86_400;
    let (year, month, day) = civil_from_days(days);

    // DOS dates cannot express anything before 1980.
    if year < 1980 {
        return ((1 << 5) | 1, 0);
    }

    let date = (((year - 1980) as u16) << 9) | ((month as u16) << 5) | day as u16;
    let time = (((rem / 3600) as u16) << 11) | ((((rem / 60) % 60) as u16) << 5) | ((rem % 60) / 2) as u16;
    (date, time)
}

/// Converts a day count since 1970-01-01 into a (year, month, day) triple.
fn civil_from_days(days: i64) -> (i64, u32, u32) {
    let z = days + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let month = (if mp < 10 { mp + 3 } else { mp - 9 }) as u32;
    let year = yoe + era * 400 + if month <= 2 { 1 } else { 0 };
    (year, month, day)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn parse_size_suffixes() {
        assert_eq!(parse_size("512"), Some((512, "")));
        assert_eq!(parse_size("4K,rest"), Some((4096, ",rest")));
        assert_eq!(parse_size("2s"), Some((1024, "")));
        assert_eq!(parse_size("1M"), Some((1 << 20, "")));
        assert_eq!(parse_size("zero"), None);
    }

    #[test]
    fn dos_timestamp_known_date() {
        // 2026-01-29 14:30:00 UTC
        let when = UNIX_EPOCH + Duration::from_secs(1_769_697_000);
        let (date, time) = dos_timestamp(when);
        assert_eq!(date, 29 | (1 << 5) | (46 << 9));
        assert_eq!(time, (30 << 5) | (14 << 11));
    }

    #[test]
    fn little_endian_helpers() {
        let mut buf = [0u8; 8];
        set_u32_at(&mut buf, 2, 0xDEAD_BEEF);
        set_u16_at(&mut buf, 6, 0xAA55);
        assert_eq!(u32_at(&buf, 2), 0xDEAD_BEEF);
        assert_eq!(u16_at(&buf, 6), 0xAA55);
        assert_eq!(buf[6], 0x55);
    }
}
