use std::{cmp::Ordering, fmt};

use bytes::Bytes;

use super::dtype::{DType, MType};
use crate::error::{ErrorCode, SmallError};

/// A typed, possibly-null scalar.
///
/// `data == None` is SQL NULL. When `ext` is set the data is a 20 bytes
/// reference to an off-page chain instead of the value itself.
#[derive(Clone, PartialEq, Eq)]
pub struct DField {
    data: Option<Bytes>,
    dtype: DType,
    ext: bool,
}

impl DField {
    pub fn new(data: Option<Bytes>, dtype: DType) -> Self {
        Self {
            data,
            dtype,
            ext: false,
        }
    }

    pub fn int(v: i64) -> Self {
        Self::new(Some(Bytes::copy_from_slice(&encode_int(v))), DType::int())
    }

    pub fn varchar(s: &str) -> Self {
        Self::new(
            Some(Bytes::copy_from_slice(s.as_bytes())),
            DType::varchar(0),
        )
    }

    pub fn binary(data: Vec<u8>) -> Self {
        Self::new(Some(Bytes::from(data)), DType::binary(0))
    }

    pub fn sys_u64(v: u64, len: usize) -> Self {
        let bytes = v.to_be_bytes();
        Self::new(
            Some(Bytes::copy_from_slice(&bytes[8 - len..])),
            DType::sys(len),
        )
    }

    pub fn null(dtype: DType) -> Self {
        Self::new(None, dtype)
    }

    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            Some(b) => b,
            None => &[],
        }
    }

    pub fn set_data(&mut self, data: Option<Bytes>) {
        self.data = data;
    }

    pub fn is_null(&self) -> bool {
        self.data.is_none()
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn dtype(&self) -> &DType {
        &self.dtype
    }

    pub fn set_dtype(&mut self, dtype: DType) {
        self.dtype = dtype;
    }

    pub fn is_ext(&self) -> bool {
        self.ext
    }

    pub fn set_ext(&mut self, ext: bool) {
        self.ext = ext;
    }

    /// NULL is only allowed for nullable types.
    pub fn check(&self) -> Result<(), SmallError> {
        if self.is_null() && !self.dtype.nullable {
            return Err(SmallError::new(
                ErrorCode::Internal,
                &format!("null value for not-null type {:?}", self.dtype),
            ));
        }
        if self.dtype.len > 0 && !self.ext && self.len() > self.dtype.len {
            return Err(SmallError::new(
                ErrorCode::Internal,
                &format!("value of {} bytes exceeds {:?}", self.len(), self.dtype),
            ));
        }
        Ok(())
    }

    pub fn as_int(&self) -> Option<i64> {
        let bytes = self.data.as_ref()?;
        if self.dtype.mtype != MType::Int || bytes.len() != 8 {
            return None;
        }
        Some(decode_int(bytes.as_ref().try_into().ok()?))
    }

    pub fn as_u64(&self) -> Option<u64> {
        let bytes = self.data.as_ref()?;
        if bytes.len() > 8 {
            return None;
        }
        let mut buf = [0u8; 8];
        buf[8 - bytes.len()..].copy_from_slice(bytes);
        Some(u64::from_be_bytes(buf))
    }

    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.data.as_ref()?).ok()
    }

    /// Binary comparison: NULL sorts before every value, two NULLs are
    /// equal.
    pub fn cmp_data(&self, other: &DField) -> Ordering {
        match (&self.data, &other.data) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.as_ref().cmp(b.as_ref()),
        }
    }

    /// Same value, same external flag.
    pub fn data_eq(&self, other: &DField) -> bool {
        self.data == other.data && self.ext == other.ext
    }
}

pub(crate) fn encode_int(v: i64) -> [u8; 8] {
    ((v as u64) ^ (1u64 << 63)).to_be_bytes()
}

pub(crate) fn decode_int(bytes: [u8; 8]) -> i64 {
    (u64::from_be_bytes(bytes) ^ (1u64 << 63)) as i64
}

impl fmt::Debug for DField {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_null() {
            return write!(f, "NULL");
        }
        if self.ext {
            return write!(f, "ext[{}]", hex::encode(self.bytes()));
        }
        match self.dtype.mtype {
            MType::Int => match self.as_int() {
                Some(v) => write!(f, "{}", v),
                None => write!(f, "{}", hex::encode(self.bytes())),
            },
            MType::Varchar => match self.as_str() {
                Some(s) if s.len() <= 16 => write!(f, "{:?}", s),
                Some(s) => write!(f, "{:?}..({})", &s[..s.char_indices().nth(16).map_or(s.len(), |(i, _)| i)], s.len()),
                None => write!(f, "{}", hex::encode(self.bytes())),
            },
            MType::Sys => write!(f, "0x{}", hex::encode(self.bytes())),
            MType::Binary => {
                if self.len() <= 16 {
                    write!(f, "0x{}", hex::encode(self.bytes()))
                } else {
                    write!(f, "0x{}..({})", hex::encode(&self.bytes()[..16]), self.len())
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_order_is_byte_order() {
        let values = [i64::MIN, -300, -1, 0, 1, 42, i64::MAX];
        for w in values.windows(2) {
            let a = DField::int(w[0]);
            let b = DField::int(w[1]);
            assert_eq!(a.cmp_data(&b), Ordering::Less);
            assert_eq!(a.as_int(), Some(w[0]));
        }
    }

    #[test]
    fn test_null_sorts_first() {
        let null = DField::null(DType::int().nullable());
        assert_eq!(null.cmp_data(&DField::int(i64::MIN)), Ordering::Less);
        assert!(null.check().is_ok());
        assert!(DField::null(DType::int()).check().is_err());
    }
}
