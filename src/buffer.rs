//! Fixed-capacity byte store with independent read and write cursors.
//!
//! Every layer above the transport builds on this: a single buffer serves
//! both the outbound path (write, then transmit) and the inbound path
//! (receive, then read), without needing a second allocation for escaping.

use crate::error::{Error, Result};

/// A fixed-capacity byte buffer with a read cursor and a write cursor.
///
/// `read_cursor <= write_cursor <= capacity` is maintained at all times.
#[derive(Debug)]
pub struct ByteBuffer {
    storage: Vec<u8>,
    write_cursor: usize,
    read_cursor: usize,
}

impl ByteBuffer {
    /// Creates a new buffer with the given fixed capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            write_cursor: 0,
            read_cursor: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Number of unread bytes.
    pub fn read_size(&self) -> usize {
        self.write_cursor - self.read_cursor
    }

    /// Remaining writable capacity.
    pub fn write_size(&self) -> usize {
        self.capacity() - self.write_cursor
    }

    /// The unread portion of the buffer.
    pub fn read_slice(&self) -> &[u8] {
        &self.storage[self.read_cursor..self.write_cursor]
    }

    /// The writable portion of the buffer.
    pub fn write_slice(&mut self) -> &mut [u8] {
        &mut self.storage[self.write_cursor..]
    }

    /// Resets both cursors to zero. Does not clear storage contents.
    pub fn reset(&mut self) {
        self.write_cursor = 0;
        self.read_cursor = 0;
    }

    /// Consumes and returns a single byte, or fails with `Underflow`.
    pub fn get_byte(&mut self) -> Result<u8> {
        if self.read_size() < 1 {
            return Err(Error::Underflow);
        }
        let val = self.storage[self.read_cursor];
        self.read_cursor += 1;
        Ok(val)
    }

    /// Advances the read cursor by `n` bytes without copying.
    pub fn get_count(&mut self, n: usize) -> Result<()> {
        if self.read_size() < n {
            return Err(Error::Underflow);
        }
        self.read_cursor += n;
        Ok(())
    }

    /// Advances the write cursor by `n` bytes, leaving the skipped bytes
    /// whatever they were.
    pub fn put_count(&mut self, n: usize) -> Result<()> {
        if self.write_size() < n {
            return Err(Error::BufferTooSmall {
                writable: self.write_size(),
            });
        }
        self.write_cursor += n;
        Ok(())
    }

    /// Copies `n` bytes out of the buffer, advancing the read cursor.
    pub fn get_buf(&mut self, n: usize) -> Result<Vec<u8>> {
        if self.read_size() < n {
            return Err(Error::Underflow);
        }
        let start = self.read_cursor;
        self.read_cursor += n;
        Ok(self.storage[start..start + n].to_vec())
    }

    /// Copies all remaining unread bytes out.
    pub fn get_rest(&mut self) -> Vec<u8> {
        let rest = self.read_slice().to_vec();
        self.read_cursor = self.write_cursor;
        rest
    }

    /// Appends `bytes`, advancing the write cursor. Fails with
    /// `BufferTooSmall` carrying the actual writable size if there isn't room.
    pub fn append_buf(&mut self, bytes: &[u8]) -> Result<()> {
        if self.write_size() < bytes.len() {
            return Err(Error::BufferTooSmall {
                writable: self.write_size(),
            });
        }
        let start = self.write_cursor;
        self.storage[start..start + bytes.len()].copy_from_slice(bytes);
        self.write_cursor += bytes.len();
        Ok(())
    }

    /// Appends a single byte.
    pub fn put_byte(&mut self, byte: u8) -> Result<()> {
        self.append_buf(&[byte])
    }

    /// Copies `value`'s native-endian bytes into the buffer, advancing the
    /// write cursor.
    pub fn write_from<T: RawValue>(&mut self, value: T) -> Result<()> {
        self.append_buf(value.to_ne_bytes().as_ref())
    }

    /// Consumes `size_of::<T>()` bytes and reinterprets them as `T`,
    /// advancing the read cursor.
    pub fn read_into<T: RawValue>(&mut self) -> Result<T> {
        let bytes = self.get_buf(std::mem::size_of::<T>())?;
        Ok(T::from_ne_bytes(&bytes))
    }
}

/// Fixed-width scalars that `write_from`/`read_into` can copy as raw bytes,
/// abstracting over the builtin integer and float types.
pub trait RawValue: Sized + Copy {
    type Bytes: AsRef<[u8]>;

    fn to_ne_bytes(self) -> Self::Bytes;
    fn from_ne_bytes(bytes: &[u8]) -> Self;
}

macro_rules! impl_raw_value {
    ($($t:ty),+ $(,)?) => {
        $(
            impl RawValue for $t {
                type Bytes = [u8; std::mem::size_of::<$t>()];

                fn to_ne_bytes(self) -> Self::Bytes {
                    <$t>::to_ne_bytes(self)
                }

                fn from_ne_bytes(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    <$t>::from_ne_bytes(buf)
                }
            }
        )+
    };
}

impl_raw_value!(u8, u16, u32, u64, u128, i8, i16, i32, i64, i128, f32, f64);
