//! Helpers to move fixed-layout structs over byte streams
//!
//! All on-wire integers are little endian; encode/decode goes through
//! [`endian_trait::Endian`] so the structs below can be written and read as
//! raw bytes on any host.

use std::io::{self, Read, Write};

use endian_trait::Endian;

/// Write `value` to `writer`, converted to little endian.
pub fn write_le_value<T: Endian, W: Write + ?Sized>(writer: &mut W, value: T) -> io::Result<()> {
    let value = value.to_le();
    let data = unsafe {
        std::slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>())
    };
    writer.write_all(data)
}

/// Read a little endian `T` from `reader`.
///
/// # Safety
///
/// `T` must be a `#[repr(C, packed)]` type that is valid for any bit
/// pattern.
pub unsafe fn read_le_value<T: Endian, R: Read + ?Sized>(reader: &mut R) -> io::Result<T> {
    let mut value = std::mem::MaybeUninit::<T>::uninit();
    let buffer =
        std::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, std::mem::size_of::<T>());
    reader.read_exact(buffer)?;
    Ok(value.assume_init().from_le())
}

/// Like [`read_le_value`], but a clean end of stream before the first byte
/// yields `Ok(None)`. A stream ending in the middle of the value is an
/// error.
///
/// # Safety
///
/// Same requirements as [`read_le_value`].
pub unsafe fn read_le_value_or_eof<T: Endian, R: Read + ?Sized>(
    reader: &mut R,
) -> io::Result<Option<T>> {
    let mut value = std::mem::MaybeUninit::<T>::uninit();
    let buffer =
        std::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, std::mem::size_of::<T>());

    let mut done = 0;
    while done < buffer.len() {
        match reader.read(&mut buffer[done..]) {
            Ok(0) => {
                if done == 0 {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "stream ended inside a record header ({} of {} bytes)",
                        done,
                        buffer.len()
                    ),
                ));
            }
            Ok(count) => done += count,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }

    Ok(Some(value.assume_init().from_le()))
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[derive(Endian, Debug, Copy, Clone, PartialEq, Eq)]
    #[repr(C, packed)]
    struct Probe {
        a: u32,
        b: u64,
    }

    #[test]
    fn value_roundtrip() -> Result<(), std::io::Error> {
        let value = Probe {
            a: 0x11223344,
            b: 0x5566778899aabbcc,
        };

        let mut stream = Vec::new();
        write_le_value(&mut stream, value)?;
        assert_eq!(stream.len(), 12);
        assert_eq!(&stream[..4], &[0x44, 0x33, 0x22, 0x11]);

        let decoded: Probe = unsafe { read_le_value(&mut Cursor::new(&stream))? };
        assert_eq!(decoded, value);
        Ok(())
    }

    #[test]
    fn eof_handling() {
        let empty: Option<Probe> =
            unsafe { read_le_value_or_eof(&mut Cursor::new(Vec::new())).unwrap() };
        assert!(empty.is_none());

        let result: std::io::Result<Option<Probe>> =
            unsafe { read_le_value_or_eof(&mut Cursor::new(vec![1u8, 2, 3])) };
        assert_eq!(
            result.unwrap_err().kind(),
            std::io::ErrorKind::UnexpectedEof
        );
    }
}
