use crate::error::{ErrorCode, SmallError};

/// Append-only byte buffer used by the undo and redo encoders.
///
/// Integers are written big-endian.
pub struct SmallWriter {
    buf: Vec<u8>,
}

impl SmallWriter {
    /// Create a new `SmallWriter` with an empty buffer.
    pub fn new() -> Self {
        let buf = Vec::new();
        Self { buf }
    }

    /// Create a new `SmallWriter` with a buffer of the given capacity.
    pub fn new_reserved(cap: usize) -> Self {
        Self {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn write<T: Encodeable + ?Sized>(&mut self, obj: &T) {
        obj.encode(self);
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_be_bytes());
    }

    /// Variable length payload: 4 bytes length followed by the bytes.
    pub fn write_var_bytes(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.write_bytes(bytes);
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

pub struct SmallReader<'a> {
    buf: &'a [u8],
    cursor: usize,
}

impl<'a> SmallReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, cursor: 0 }
    }

    pub fn read<T: Decodeable>(&mut self) -> Result<T, SmallError> {
        T::decode_from(self)
    }

    pub fn read_exact(&mut self, bytes_count: usize) -> Result<&'a [u8], SmallError> {
        let start = self.cursor;
        let end = self.cursor + bytes_count;

        // boundary check
        if end > self.buf.len() {
            return Err(SmallError::new(
                ErrorCode::Corruption,
                &format!(
                    "read out of boundary, want {}..{}, len {}",
                    start,
                    end,
                    self.buf.len()
                ),
            ));
        }

        self.cursor = end;
        Ok(&self.buf[start..end])
    }

    pub fn read_u8(&mut self) -> Result<u8, SmallError> {
        Ok(self.read_exact(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, SmallError> {
        let bytes = self.read_exact(2)?;
        Ok(u16::from_be_bytes(bytes.try_into().map_err(corrupted)?))
    }

    pub fn read_u32(&mut self) -> Result<u32, SmallError> {
        let bytes = self.read_exact(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().map_err(corrupted)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, SmallError> {
        let bytes = self.read_exact(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().map_err(corrupted)?))
    }

    pub fn read_var_bytes(&mut self) -> Result<&'a [u8], SmallError> {
        let len = self.read_u32()? as usize;
        self.read_exact(len)
    }

    pub fn is_empty(&self) -> bool {
        self.cursor >= self.buf.len()
    }
}

fn corrupted<E: std::fmt::Debug>(e: E) -> SmallError {
    SmallError::new(ErrorCode::Corruption, &format!("{:?}", e))
}

pub trait Encodeable {
    fn encode(&self, writer: &mut SmallWriter);

    fn to_bytes(&self) -> Vec<u8> {
        let mut writer = SmallWriter::new();
        self.encode(&mut writer);
        writer.into_bytes()
    }
}

pub trait Decodeable: Sized {
    fn decode_from(reader: &mut SmallReader) -> Result<Self, SmallError>;

    fn from_bytes(bytes: &[u8]) -> Result<Self, SmallError> {
        let mut reader = SmallReader::new(bytes);
        Self::decode_from(&mut reader)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_boundary() {
        let mut writer = SmallWriter::new();
        writer.write_u16(7);
        writer.write_var_bytes(b"abc");
        let bytes = writer.into_bytes();

        let mut reader = SmallReader::new(&bytes);
        assert_eq!(reader.read_u16().unwrap(), 7);
        assert_eq!(reader.read_var_bytes().unwrap(), b"abc");
        assert!(reader.is_empty());
        assert!(reader.read_u8().unwrap_err().is(ErrorCode::Corruption));
    }
}
