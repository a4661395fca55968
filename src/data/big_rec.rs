use bytes::Bytes;
use log::debug;

use super::{field::DField, tuple::DTuple};
use crate::{
    dict::Index,
    error::{ErrorCode, SmallError},
    io::{Decodeable, Encodeable, SmallReader, SmallWriter},
};

/// Size of the reference left in the record for an off-page field.
pub const BTR_EXTERN_FIELD_REF_SIZE: usize = 20;

/// Set when this record copy does not own the off-page chain.
pub const BTR_EXTERN_OWNER_FLAG: u8 = 0x80;

/// Set when the chain was inherited from a previous version of the row
/// and must survive a rollback of the record that inherited it.
pub const BTR_EXTERN_INHERITED_FLAG: u8 = 0x40;

/// Fields shorter than this are never moved off-page.
const BIG_REC_MIN_FIELD_LEN: usize = 2 * BTR_EXTERN_FIELD_REF_SIZE;

/// Reference to an off-page chain, stored in place of the field value.
///
/// # Format
///
/// - 4 bytes: space id
/// - 4 bytes: first page of the chain
/// - 4 bytes: byte offset inside the first page
/// - 1 byte: flags (owner, inherited)
/// - 7 bytes: length of the value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternRef {
    pub space: u32,
    pub page_no: u32,
    pub offset: u32,
    pub len: u64,
    pub owner: bool,
    pub inherited: bool,
}

impl ExternRef {
    pub fn new(space: u32, page_no: u32, len: u64) -> Self {
        Self {
            space,
            page_no,
            offset: 0,
            len,
            owner: true,
            inherited: false,
        }
    }

    /// A reference which does not point anywhere yet (or any more).
    pub fn is_null(&self) -> bool {
        self.page_no == 0 && self.len == 0
    }

    fn flags(&self) -> u8 {
        let mut flags = 0;
        if !self.owner {
            flags |= BTR_EXTERN_OWNER_FLAG;
        }
        if self.inherited {
            flags |= BTR_EXTERN_INHERITED_FLAG;
        }
        flags
    }

    /// Decode the reference held by an external field.
    pub fn from_field(field: &DField) -> Result<Self, SmallError> {
        if !field.is_ext() {
            return Err(SmallError::internal("field is not stored externally"));
        }
        Self::from_bytes(field.bytes())
    }

    pub fn to_field_data(&self) -> Bytes {
        Bytes::from(self.to_bytes())
    }
}

impl Encodeable for ExternRef {
    fn encode(&self, writer: &mut SmallWriter) {
        writer.write_u32(self.space);
        writer.write_u32(self.page_no);
        writer.write_u32(self.offset);
        let len_word = ((self.flags() as u64) << 56) | (self.len & 0x00ff_ffff_ffff_ffff);
        writer.write_u64(len_word);
    }
}

impl Decodeable for ExternRef {
    fn decode_from(reader: &mut SmallReader) -> Result<Self, SmallError> {
        let space = reader.read_u32()?;
        let page_no = reader.read_u32()?;
        let offset = reader.read_u32()?;
        let len_word = reader.read_u64()?;
        let flags = (len_word >> 56) as u8;
        Ok(Self {
            space,
            page_no,
            offset,
            len: len_word & 0x00ff_ffff_ffff_ffff,
            owner: flags & BTR_EXTERN_OWNER_FLAG == 0,
            inherited: flags & BTR_EXTERN_INHERITED_FLAG != 0,
        })
    }
}

#[derive(Debug, Clone)]
pub struct BigRecField {
    pub field_no: usize,
    pub len: usize,
    pub data: Bytes,
}

/// Fields moved out of an entry which has to be stored off-page.
#[derive(Debug, Clone, Default)]
pub struct BigRec {
    pub fields: Vec<BigRecField>,
}

impl BigRec {
    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Move the longest eligible fields of `entry` off the tuple until its
/// converted size is at most `max_rec_size`.
///
/// Key fields, system fields, columns of other indexes and fields which
/// are already external are never moved. Each moved field is replaced by a zeroed reference with
/// the external flag set.
pub fn dtuple_convert_big_rec(
    index: &Index,
    entry: &mut DTuple,
    max_rec_size: usize,
) -> Result<BigRec, SmallError> {
    let mut big_rec = BigRec::default();

    while entry.get_converted_size() > max_rec_size {
        let mut longest: Option<(usize, usize)> = None;
        for i in index.n_uniq()..entry.n_fields() {
            let field = entry.get_nth_field(i);
            let ifield = index.field(i);
            if field.is_ext() || field.is_null() || ifield.is_sys() || ifield.indexed {
                continue;
            }
            if field.len() < BIG_REC_MIN_FIELD_LEN {
                continue;
            }
            match longest {
                Some((_, len)) if len >= field.len() => {}
                _ => longest = Some((i, field.len())),
            }
        }

        let (field_no, len) = match longest {
            Some(v) => v,
            None => {
                // nothing else can be moved, restore the entry
                dtuple_convert_back_big_rec(entry, big_rec);
                return Err(SmallError::new(
                    ErrorCode::TooBigRecord,
                    &format!(
                        "entry of {} bytes does not fit in {} bytes",
                        entry.get_converted_size(),
                        max_rec_size
                    ),
                ));
            }
        };

        let field = entry.get_nth_field_mut(field_no);
        let data = field
            .data()
            .cloned()
            .ok_or_else(|| SmallError::internal("null field chosen for big rec"))?;
        field.set_data(Some(Bytes::from(vec![0u8; BTR_EXTERN_FIELD_REF_SIZE])));
        field.set_ext(true);
        big_rec.fields.push(BigRecField {
            field_no,
            len,
            data,
        });
    }

    debug!(
        "big rec conversion on index {}: {} fields moved off-page",
        index.name(),
        big_rec.n_fields()
    );
    Ok(big_rec)
}

/// Put the fields of `big_rec` back into `entry`.
pub fn dtuple_convert_back_big_rec(entry: &mut DTuple, big_rec: BigRec) {
    for f in big_rec.fields {
        let field = entry.get_nth_field_mut(f.field_no);
        field.set_data(Some(f.data));
        field.set_ext(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extern_ref_flags() {
        let mut r = ExternRef::new(0, 17, 9000);
        r.owner = false;
        r.inherited = true;
        let decoded = ExternRef::from_bytes(&r.to_bytes()).unwrap();
        assert_eq!(decoded, r);
        assert_eq!(r.to_bytes().len(), BTR_EXTERN_FIELD_REF_SIZE);
    }
}
