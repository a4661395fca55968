use std::{cmp::Ordering, fmt};

use itertools::Itertools;

use super::field::DField;
use crate::io::SmallWriter;

/// The record is delete-marked.
pub const REC_INFO_DELETED_FLAG: u8 = 0x20;

/// The record is the leftmost node pointer of a non-leaf level and
/// compares less than any search tuple.
pub const REC_INFO_MIN_REC_FLAG: u8 = 0x10;

/// Fixed per-record overhead of the physical format.
pub const REC_N_EXTRA_BYTES: usize = 6;

/// Bytes per field of the offsets array.
pub const REC_FIELD_OFFSET_BYTES: usize = 2;

/// Converted size of a record made of the given fields.
pub fn rec_converted_size(fields: &[DField]) -> usize {
    REC_N_EXTRA_BYTES
        + REC_FIELD_OFFSET_BYTES * fields.len()
        + fields.iter().map(|f| f.len()).sum::<usize>()
}

/// An ordered sequence of fields plus info bits.
///
/// Only the first `n_fields_cmp` fields take part in comparisons.
#[derive(Clone, PartialEq, Eq)]
pub struct DTuple {
    fields: Vec<DField>,
    info_bits: u8,
    n_fields_cmp: usize,
}

impl DTuple {
    pub fn new(fields: Vec<DField>) -> Self {
        let n = fields.len();
        Self {
            fields,
            info_bits: 0,
            n_fields_cmp: n,
        }
    }

    pub fn n_fields(&self) -> usize {
        self.fields.len()
    }

    pub fn n_fields_cmp(&self) -> usize {
        self.n_fields_cmp
    }

    pub fn set_n_fields_cmp(&mut self, n: usize) {
        assert!(n <= self.fields.len());
        self.n_fields_cmp = n;
    }

    pub fn info_bits(&self) -> u8 {
        self.info_bits
    }

    pub fn set_info_bits(&mut self, info_bits: u8) {
        self.info_bits = info_bits;
    }

    pub fn is_delete_marked(&self) -> bool {
        self.info_bits & REC_INFO_DELETED_FLAG != 0
    }

    pub fn get_nth_field(&self, n: usize) -> &DField {
        &self.fields[n]
    }

    pub fn get_nth_field_mut(&mut self, n: usize) -> &mut DField {
        &mut self.fields[n]
    }

    pub fn fields(&self) -> &[DField] {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut [DField] {
        &mut self.fields
    }

    pub fn into_fields(self) -> Vec<DField> {
        self.fields
    }

    /// Sum of the field lengths.
    pub fn get_data_size(&self) -> usize {
        self.fields.iter().map(|f| f.len()).sum()
    }

    /// Size the tuple would take once converted into a record.
    pub fn get_converted_size(&self) -> usize {
        rec_converted_size(&self.fields)
    }

    pub fn contains_null(&self) -> bool {
        self.fields.iter().any(|f| f.is_null())
    }

    /// Positions of the externally stored fields.
    pub fn ext_fields(&self) -> Vec<usize> {
        (0..self.fields.len())
            .filter(|i| self.fields[*i].is_ext())
            .collect()
    }

    /// Byte image of the first `n` fields, equal images mean equal
    /// prefixes.
    pub fn encode_prefix(&self, n: usize) -> Vec<u8> {
        let mut writer = SmallWriter::new();
        for field in &self.fields[..n.min(self.fields.len())] {
            match field.data() {
                None => writer.write_u8(0),
                Some(data) => {
                    writer.write_u8(1);
                    writer.write_var_bytes(data);
                }
            }
        }
        writer.into_bytes()
    }

    /// Copy of the first `n` fields, all of them compared.
    pub fn prefix(&self, n: usize) -> DTuple {
        DTuple::new(self.fields[..n].to_vec())
    }
}

/// Compare a tuple with a record, starting the field comparison after
/// the `matched` fields already known to be equal.
///
/// Returns the ordering of the tuple relative to the record and the
/// number of leading fields which compared equal. A record carrying the
/// min-rec flag is smaller than any tuple.
pub fn cmp_dtuple_rec_with_match(
    tuple: &DTuple,
    rec_fields: &[DField],
    rec_info_bits: u8,
    matched: usize,
) -> (Ordering, usize) {
    if rec_info_bits & REC_INFO_MIN_REC_FLAG != 0 {
        return (Ordering::Greater, 0);
    }

    let n_cmp = tuple.n_fields_cmp().min(rec_fields.len());
    let mut cur = matched.min(n_cmp);
    while cur < n_cmp {
        match tuple.get_nth_field(cur).cmp_data(&rec_fields[cur]) {
            Ordering::Equal => cur += 1,
            ord => return (ord, cur),
        }
    }
    (Ordering::Equal, cur)
}

pub fn cmp_dtuple_rec(tuple: &DTuple, rec_fields: &[DField], rec_info_bits: u8) -> Ordering {
    cmp_dtuple_rec_with_match(tuple, rec_fields, rec_info_bits, 0).0
}

impl fmt::Debug for DTuple {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({})", self.fields.iter().map(|x| format!("{:?}", x)).join(", "))?;
        if self.is_delete_marked() {
            write!(f, "[del]")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cmp_with_match() {
        let tuple = DTuple::new(vec![DField::int(1), DField::int(5)]);
        let rec = vec![DField::int(1), DField::int(7), DField::int(0)];
        let (ord, matched) = cmp_dtuple_rec_with_match(&tuple, &rec, 0, 0);
        assert_eq!(ord, Ordering::Less);
        assert_eq!(matched, 1);

        let mut prefix = tuple.clone();
        prefix.set_n_fields_cmp(1);
        assert_eq!(cmp_dtuple_rec(&prefix, &rec, 0), Ordering::Equal);

        assert_eq!(
            cmp_dtuple_rec(&tuple, &rec, REC_INFO_MIN_REC_FLAG),
            Ordering::Greater
        );
    }

    #[test]
    fn test_data_size() {
        let tuple = DTuple::new(vec![
            DField::int(1),
            DField::varchar("abc"),
            DField::null(crate::data::DType::int().nullable()),
        ]);
        assert_eq!(tuple.get_data_size(), 11);
        assert!(tuple.contains_null());
    }
}
