use std::{cmp::Ordering, fmt};

use bytes::Bytes;
use itertools::Itertools;

use crate::{
    data::{
        cmp_dtuple_rec_with_match, rec_converted_size, DField, DTuple, ExternRef,
        REC_INFO_DELETED_FLAG, REC_INFO_MIN_REC_FLAG,
    },
    error::SmallError,
    io::Decodeable,
    types::IndexId,
};

/// Bytes taken by the page header and trailer.
pub const PAGE_DATA: usize = 128;

/// Bytes of a blob page not available to the payload.
pub const BLOB_HDR_SIZE: usize = 64;

/// Slot of the infimum record.
pub const PAGE_INFIMUM_SLOT: usize = 0;

/// Free space available in an empty index page.
pub fn page_capacity(page_size: usize) -> usize {
    page_size - PAGE_DATA
}

/// Largest record which may be stored inline, so that a page split
/// always produces two pages which fit.
pub fn page_max_rec_size(page_size: usize) -> usize {
    page_capacity(page_size) / 2
}

pub fn blob_page_capacity(page_size: usize) -> usize {
    page_size - BLOB_HDR_SIZE
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId {
    pub space: u32,
    pub page_no: u32,
}

impl PageId {
    pub fn new(space: u32, page_no: u32) -> Self {
        Self { space, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "page_{}:{}", self.space, self.page_no)
    }
}

impl fmt::Debug for PageId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self)
    }
}

/// A physical record: info bits plus fields.
#[derive(Clone, PartialEq, Eq)]
pub struct Rec {
    pub info_bits: u8,
    pub fields: Vec<DField>,
}

impl Rec {
    pub fn from_tuple(tuple: &DTuple) -> Self {
        Self {
            info_bits: tuple.info_bits(),
            fields: tuple.fields().to_vec(),
        }
    }

    pub fn to_tuple(&self) -> DTuple {
        let mut tuple = DTuple::new(self.fields.clone());
        tuple.set_info_bits(self.info_bits);
        tuple
    }

    pub fn size(&self) -> usize {
        rec_converted_size(&self.fields)
    }

    pub fn is_delete_marked(&self) -> bool {
        self.info_bits & REC_INFO_DELETED_FLAG != 0
    }

    pub fn set_delete_mark(&mut self, val: bool) {
        if val {
            self.info_bits |= REC_INFO_DELETED_FLAG;
        } else {
            self.info_bits &= !REC_INFO_DELETED_FLAG;
        }
    }

    pub fn is_min_rec(&self) -> bool {
        self.info_bits & REC_INFO_MIN_REC_FLAG != 0
    }

    pub fn set_min_rec(&mut self, val: bool) {
        if val {
            self.info_bits |= REC_INFO_MIN_REC_FLAG;
        } else {
            self.info_bits &= !REC_INFO_MIN_REC_FLAG;
        }
    }

    pub fn has_ext(&self) -> bool {
        self.fields.iter().any(|f| f.is_ext())
    }

    pub fn extern_ref(&self, i: usize) -> Result<ExternRef, SmallError> {
        ExternRef::from_bytes(self.fields[i].bytes())
    }

    pub fn set_extern_ref(&mut self, i: usize, r: &ExternRef) {
        self.fields[i].set_data(Some(r.to_field_data()));
        self.fields[i].set_ext(true);
    }
}

impl fmt::Debug for Rec {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{{}}}", self.fields.iter().map(|x| format!("{:?}", x)).join(", "))?;
        if self.is_delete_marked() {
            write!(f, "[del]")?;
        }
        if self.is_min_rec() {
            write!(f, "[min]")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Index,
    Blob,
    Free,
}

/// Search modes of the page cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageCurMode {
    /// last record strictly less than the tuple
    L,
    /// last record less than or equal to the tuple
    LE,
    /// first record strictly greater than the tuple
    G,
    /// first record greater than or equal to the tuple
    GE,
}

/// An index or blob page.
///
/// Slot 0 is the infimum, slots `1..=n_recs` are the user records and
/// slot `n_recs + 1` is the supremum.
pub struct Page {
    id: PageId,
    kind: PageKind,
    index_id: IndexId,
    level: usize,
    prev: Option<u32>,
    next: Option<u32>,
    recs: Vec<Rec>,
    data_size: usize,

    // bumped whenever a record may have moved, never reset
    modify_clock: u64,

    blob: Bytes,
    blob_next: Option<u32>,
}

impl Page {
    pub fn new_free(id: PageId) -> Self {
        Self {
            id,
            kind: PageKind::Free,
            index_id: 0,
            level: 0,
            prev: None,
            next: None,
            recs: Vec::new(),
            data_size: 0,
            modify_clock: 0,
            blob: Bytes::new(),
            blob_next: None,
        }
    }

    /// (Re)initialize as an empty index page.
    pub fn init_index(&mut self, index_id: IndexId, level: usize) {
        self.kind = PageKind::Index;
        self.index_id = index_id;
        self.level = level;
        self.prev = None;
        self.next = None;
        self.recs.clear();
        self.data_size = 0;
        self.blob = Bytes::new();
        self.blob_next = None;
        self.modify_clock += 1;
    }

    pub fn init_blob(&mut self, data: Bytes, next: Option<u32>) {
        self.kind = PageKind::Blob;
        self.index_id = 0;
        self.level = 0;
        self.prev = None;
        self.next = None;
        self.recs.clear();
        self.data_size = 0;
        self.blob = data;
        self.blob_next = next;
        self.modify_clock += 1;
    }

    pub fn free(&mut self) {
        self.kind = PageKind::Free;
        self.recs.clear();
        self.data_size = 0;
        self.prev = None;
        self.next = None;
        self.blob = Bytes::new();
        self.blob_next = None;
        self.modify_clock += 1;
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn kind(&self) -> PageKind {
        self.kind
    }

    pub fn index_id(&self) -> IndexId {
        self.index_id
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn set_level(&mut self, level: usize) {
        self.level = level;
    }

    pub fn is_leaf(&self) -> bool {
        self.level == 0
    }

    pub fn prev(&self) -> Option<u32> {
        self.prev
    }

    pub fn next(&self) -> Option<u32> {
        self.next
    }

    pub fn set_prev(&mut self, prev: Option<u32>) {
        self.prev = prev;
    }

    pub fn set_next(&mut self, next: Option<u32>) {
        self.next = next;
    }

    pub fn modify_clock(&self) -> u64 {
        self.modify_clock
    }

    pub fn blob_data(&self) -> &Bytes {
        &self.blob
    }

    pub fn blob_next(&self) -> Option<u32> {
        self.blob_next
    }

    pub fn n_recs(&self) -> usize {
        self.recs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recs.is_empty()
    }

    pub fn supremum_slot(&self) -> usize {
        self.recs.len() + 1
    }

    pub fn is_user_slot(&self, slot: usize) -> bool {
        slot >= 1 && slot <= self.recs.len()
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn free_space(&self, page_size: usize) -> usize {
        page_capacity(page_size).saturating_sub(self.data_size)
    }

    /// The user record in `slot`, `None` for the infimum and supremum.
    pub fn rec(&self, slot: usize) -> Option<&Rec> {
        if self.is_user_slot(slot) {
            Some(&self.recs[slot - 1])
        } else {
            None
        }
    }

    pub fn recs(&self) -> &[Rec] {
        &self.recs
    }

    /// Mutable access for in-place changes which keep the record size,
    /// e.g. delete-mark or system field stamping.
    pub fn rec_mut(&mut self, slot: usize) -> Option<&mut Rec> {
        if self.is_user_slot(slot) {
            Some(&mut self.recs[slot - 1])
        } else {
            None
        }
    }

    /// Replace the record in `slot`, its size may change so the record
    /// counts as moved.
    pub fn replace_rec(&mut self, slot: usize, rec: Rec) {
        let old = &self.recs[slot - 1];
        self.data_size = self.data_size - old.size() + rec.size();
        self.recs[slot - 1] = rec;
        self.modify_clock += 1;
    }

    /// Insert `rec` right after `slot`, returning the slot of the new
    /// record.
    pub fn insert_after(&mut self, slot: usize, rec: Rec) -> usize {
        let pos = slot.min(self.recs.len());
        self.data_size += rec.size();
        self.recs.insert(pos, rec);
        self.modify_clock += 1;
        pos + 1
    }

    pub fn delete_rec(&mut self, slot: usize) -> Rec {
        let rec = self.recs.remove(slot - 1);
        self.data_size -= rec.size();
        self.modify_clock += 1;
        rec
    }

    pub fn take_recs(&mut self) -> Vec<Rec> {
        self.data_size = 0;
        self.modify_clock += 1;
        std::mem::take(&mut self.recs)
    }

    pub fn set_recs(&mut self, recs: Vec<Rec>) {
        self.data_size = recs.iter().map(|r| r.size()).sum();
        self.recs = recs;
        self.modify_clock += 1;
    }

    pub fn append_recs(&mut self, recs: Vec<Rec>) {
        self.data_size += recs.iter().map(|r| r.size()).sum::<usize>();
        self.recs.extend(recs);
        self.modify_clock += 1;
    }

    /// Position a cursor on the page.
    ///
    /// Returns `(slot, up_match, low_match)`: the number of leading
    /// fields of the tuple matching the record above and below the
    /// position.
    pub fn search_with_match(&self, tuple: &DTuple, mode: PageCurMode) -> (usize, usize, usize) {
        let cmp = |rec: &Rec| cmp_dtuple_rec_with_match(tuple, &rec.fields, rec.info_bits, 0);

        // number of records strictly less than / less than or equal to the tuple
        let n_less = self
            .recs
            .partition_point(|rec| cmp(rec).0 == Ordering::Greater);
        let n_less_eq = self
            .recs
            .partition_point(|rec| cmp(rec).0 != Ordering::Less);

        let matched = |slot: usize| -> usize {
            match self.rec(slot) {
                Some(rec) => cmp(rec).1,
                None => 0,
            }
        };

        match mode {
            PageCurMode::L | PageCurMode::LE => {
                let slot = if mode == PageCurMode::L {
                    n_less
                } else {
                    n_less_eq
                };
                (slot, matched(slot + 1), matched(slot))
            }
            PageCurMode::G | PageCurMode::GE => {
                let slot = if mode == PageCurMode::G {
                    n_less_eq + 1
                } else {
                    n_less + 1
                };
                (slot, matched(slot), matched(slot - 1))
            }
        }
    }
}

impl fmt::Debug for Page {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}<{:?}, level {}, prev {:?}, next {:?}, recs {}, size {}, clock {}>",
            self.id,
            self.kind,
            self.level,
            self.prev,
            self.next,
            self.recs.len(),
            self.data_size,
            self.modify_clock,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_with(keys: &[i64]) -> Page {
        let mut page = Page::new_free(PageId::new(0, 3));
        page.init_index(1, 0);
        for (i, k) in keys.iter().enumerate() {
            page.insert_after(i, Rec::from_tuple(&DTuple::new(vec![DField::int(*k)])));
        }
        page
    }

    #[test]
    fn test_search_modes() {
        let page = page_with(&[10, 20, 30]);
        let t = DTuple::new(vec![DField::int(20)]);
        assert_eq!(page.search_with_match(&t, PageCurMode::L).0, 1);
        assert_eq!(page.search_with_match(&t, PageCurMode::LE).0, 2);
        assert_eq!(page.search_with_match(&t, PageCurMode::GE).0, 2);
        assert_eq!(page.search_with_match(&t, PageCurMode::G).0, 3);

        let (slot, up, low) = page.search_with_match(&t, PageCurMode::LE);
        assert_eq!((slot, low, up), (2, 1, 0));

        let small = DTuple::new(vec![DField::int(1)]);
        assert_eq!(page.search_with_match(&small, PageCurMode::LE).0, 0);
        let big = DTuple::new(vec![DField::int(100)]);
        assert_eq!(page.search_with_match(&big, PageCurMode::G).0, page.supremum_slot());
    }

    #[test]
    fn test_modify_clock() {
        let mut page = page_with(&[1]);
        let clock = page.modify_clock();
        page.rec_mut(1).unwrap().set_delete_mark(true);
        assert_eq!(page.modify_clock(), clock);
        page.delete_rec(1);
        assert!(page.modify_clock() > clock);
    }
}
