use std::{collections::HashMap, fmt};

use log::debug;
use parking_lot::Mutex;

use crate::{
    data::DField,
    dict::DATA_ROLL_PTR_LEN,
    error::{ErrorCode, SmallError},
    io::{SmallReader, SmallWriter},
    storage::PageId,
    types::{TrxId, TrxNo, UndoNo},
};

/// Space id of the undo pages.
pub const UNDO_SPACE_ID: u32 = 1;

/// Bytes of an undo page not available to records.
const UNDO_PAGE_HDR: usize = 56;

/// Reference from a clustered record to the undo record describing its
/// previous version.
///
/// Packed in 7 bytes: insert flag (bit 55), undo page number (bits
/// 16..48) and offset of the record inside the page (bits 0..16).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RollPtr {
    pub is_insert: bool,
    pub page_no: u32,
    pub offset: u16,
}

impl RollPtr {
    pub fn to_u64(&self) -> u64 {
        ((self.is_insert as u64) << 55) | ((self.page_no as u64) << 16) | self.offset as u64
    }

    pub fn from_u64(v: u64) -> Self {
        Self {
            is_insert: (v >> 55) & 1 == 1,
            page_no: ((v >> 16) & 0xffff_ffff) as u32,
            offset: (v & 0xffff) as u16,
        }
    }

    pub fn to_field(&self) -> DField {
        DField::sys_u64(self.to_u64(), DATA_ROLL_PTR_LEN)
    }

    pub fn from_field(field: &DField) -> Result<Self, SmallError> {
        field
            .as_u64()
            .map(Self::from_u64)
            .ok_or_else(|| SmallError::new(ErrorCode::Corruption, "malformed DB_ROLL_PTR"))
    }

    pub fn page_id(&self) -> PageId {
        PageId::new(UNDO_SPACE_ID, self.page_no)
    }
}

impl fmt::Debug for RollPtr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "roll_ptr<{}{}:{}>",
            if self.is_insert { "ins " } else { "" },
            self.page_no,
            self.offset
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoKind {
    /// Undo of fresh inserts, only needed for rollback.
    Insert,
    /// Undo of updates and delete-marks, also needed by consistent reads
    /// until purged.
    Update,
}

/// Location of one undo record of a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UndoRecRef {
    pub undo_no: UndoNo,
    pub roll_ptr: RollPtr,
}

/// Undo log of one transaction and one kind.
#[derive(Debug, Clone)]
pub struct UndoLog {
    pub kind: UndoKind,
    pub trx_id: TrxId,
    pub pages: Vec<u32>,
    pub recs: Vec<UndoRecRef>,
}

impl UndoLog {
    pub fn new(kind: UndoKind, trx_id: TrxId) -> Self {
        Self {
            kind,
            trx_id,
            pages: Vec::new(),
            recs: Vec::new(),
        }
    }

    pub fn top(&self) -> Option<&UndoRecRef> {
        self.recs.last()
    }

    pub fn is_empty(&self) -> bool {
        self.recs.is_empty()
    }
}

/// A committed update undo log waiting for purge.
#[derive(Debug, Clone)]
pub struct HistoryLog {
    pub trx_no: TrxNo,
    pub log: UndoLog,
}

struct UndoPage {
    kind: UndoKind,
    trx_id: TrxId,
    data: Vec<u8>,
}

struct UndoSpaceState {
    pages: HashMap<u32, UndoPage>,
    next_page_no: u32,
}

/// The rollback segment: pages holding undo records.
///
/// Page numbers are never reused, so a stale roll pointer can only run
/// into a missing page, never into somebody else's record.
pub struct UndoSpace {
    page_size: usize,
    state: Mutex<UndoSpaceState>,
}

impl UndoSpace {
    pub fn new(page_size: usize) -> Self {
        Self {
            page_size,
            state: Mutex::new(UndoSpaceState {
                pages: HashMap::new(),
                next_page_no: 1,
            }),
        }
    }

    fn page_capacity(&self) -> usize {
        self.page_size.saturating_sub(UNDO_PAGE_HDR)
    }

    /// Append an encoded undo record to the log, allocating a new page
    /// when the last one is full.
    pub fn append(
        &self,
        log: &mut UndoLog,
        undo_no: UndoNo,
        payload: &[u8],
    ) -> Result<RollPtr, SmallError> {
        let capacity = self.page_capacity();
        if 4 + payload.len() > capacity {
            return Err(SmallError::new(
                ErrorCode::TooBigRecord,
                &format!(
                    "undo record of {} bytes does not fit an undo page of {} bytes",
                    payload.len(),
                    capacity
                ),
            ));
        }

        let mut state = self.state.lock();
        let fits = |page: &UndoPage| page.data.len() + 4 + payload.len() <= capacity;
        let last = log.pages.last().copied();
        let page_no = match last {
            Some(no) if state.pages.get(&no).map_or(false, |p| fits(p)) => no,
            _ => {
                let no = state.next_page_no;
                state.next_page_no += 1;
                state.pages.insert(
                    no,
                    UndoPage {
                        kind: log.kind,
                        trx_id: log.trx_id,
                        data: Vec::new(),
                    },
                );
                log.pages.push(no);
                debug!("tx_{}: new {:?} undo page {}", log.trx_id, log.kind, no);
                no
            }
        };

        let page = state
            .pages
            .get_mut(&page_no)
            .ok_or_else(|| SmallError::internal("undo page vanished"))?;
        let offset = u16::try_from(page.data.len()).map_err(|_| {
            SmallError::new(
                ErrorCode::Corruption,
                &format!("offset {} in undo page {} exceeds 16 bits", page.data.len(), page_no),
            )
        })?;
        let mut writer = SmallWriter::new_reserved(4 + payload.len());
        writer.write_var_bytes(payload);
        page.data.extend_from_slice(&writer.into_bytes());

        let roll_ptr = RollPtr {
            is_insert: log.kind == UndoKind::Insert,
            page_no,
            offset,
        };
        log.recs.push(UndoRecRef { undo_no, roll_ptr });
        Ok(roll_ptr)
    }

    /// Copy an undo record out of its page.
    ///
    /// A missing page means the record was already purged (or freed at
    /// commit for insert undo).
    pub fn read(&self, roll_ptr: &RollPtr) -> Result<Vec<u8>, SmallError> {
        let state = self.state.lock();
        let page = state.pages.get(&roll_ptr.page_no).ok_or_else(|| {
            SmallError::new(
                ErrorCode::MissingHistory,
                &format!("undo page of {:?} is gone", roll_ptr),
            )
        })?;
        if (page.kind == UndoKind::Insert) != roll_ptr.is_insert {
            return Err(SmallError::new(
                ErrorCode::Corruption,
                &format!("{:?} points to a {:?} undo page of tx_{}", roll_ptr, page.kind, page.trx_id),
            ));
        }
        let start = roll_ptr.offset as usize;
        if start >= page.data.len() {
            return Err(SmallError::new(
                ErrorCode::Corruption,
                &format!("{:?} is out of the page", roll_ptr),
            ));
        }
        let mut reader = SmallReader::new(&page.data[start..]);
        Ok(reader.read_var_bytes()?.to_vec())
    }

    /// Free every page of the log, returns the number of pages freed.
    pub fn free_log(&self, log: &UndoLog) -> usize {
        let mut state = self.state.lock();
        let mut n = 0;
        for page_no in &log.pages {
            if state.pages.remove(page_no).is_some() {
                n += 1;
            }
        }
        debug!("tx_{}: freed {} {:?} undo pages", log.trx_id, n, log.kind);
        n
    }

    pub fn n_pages(&self) -> usize {
        self.state.lock().pages.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roll_ptr_packing() {
        let p = RollPtr {
            is_insert: true,
            page_no: 77,
            offset: 4000,
        };
        assert_eq!(RollPtr::from_u64(p.to_u64()), p);
        assert_eq!(RollPtr::from_field(&p.to_field()).unwrap(), p);
        assert!(p.to_u64() < 1 << 56);
    }

    #[test]
    fn test_append_read_free() {
        let space = UndoSpace::new(256);
        let mut log = UndoLog::new(UndoKind::Update, 3);
        let mut ptrs = Vec::new();
        for i in 0..20u64 {
            ptrs.push(space.append(&mut log, i, &[i as u8; 40]).unwrap());
        }
        assert!(log.pages.len() > 1);
        assert_eq!(space.read(&ptrs[7]).unwrap(), vec![7u8; 40]);

        assert_eq!(space.free_log(&log), log.pages.len());
        assert!(space.read(&ptrs[7]).unwrap_err().is(ErrorCode::MissingHistory));
    }

    #[test]
    fn test_largest_page() {
        let space = UndoSpace::new(crate::config::MAX_PAGE_SIZE);
        let mut log = UndoLog::new(UndoKind::Update, 5);
        let ptrs: Vec<RollPtr> = (0..40u64)
            .map(|i| space.append(&mut log, i, &[i as u8; 4000]).unwrap())
            .collect();
        assert!(log.pages.len() > 1);
        for i in &[0usize, 15, 17, 39] {
            assert_eq!(space.read(&ptrs[*i]).unwrap(), vec![*i as u8; 4000]);
        }
    }

    #[test]
    fn test_record_too_big() {
        let space = UndoSpace::new(256);
        let mut log = UndoLog::new(UndoKind::Insert, 6);
        let err = space.append(&mut log, 0, &[0u8; 256]).unwrap_err();
        assert!(err.is(ErrorCode::TooBigRecord));
        assert!(log.pages.is_empty());
        assert_eq!(space.n_pages(), 0);
    }
}
