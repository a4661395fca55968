use log::debug;
use parking_lot::Mutex;

use super::page::PageId;
use crate::{
    io::{Encodeable, SmallWriter},
    types::Lsn,
};

/// Kind of a redo record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MlogType {
    RecInsert = 1,
    RecDelete = 2,
    RecUpdateInPlace = 3,
    RecDelMark = 4,
    RecMinMark = 5,
    PageCreate = 6,
    PageFree = 7,
    PageSplit = 8,
    PageMerge = 9,
    PageLift = 10,
    BlobWrite = 11,
    ExternRefWrite = 12,
    UndoWrite = 13,
}

#[derive(Debug, Clone)]
pub struct LogRec {
    pub kind: MlogType,
    pub page_id: PageId,
    pub body: Vec<u8>,
}

impl Encodeable for LogRec {
    fn encode(&self, writer: &mut SmallWriter) {
        writer.write_u8(self.kind as u8);
        writer.write_u32(self.page_id.space);
        writer.write_u32(self.page_id.page_no);
        writer.write_var_bytes(&self.body);
    }
}

struct LogState {
    lsn: Lsn,
    buf: Vec<u8>,
    records: Vec<(Lsn, MlogType, PageId)>,
}

/// The redo log. Mini-transactions append their records as one group.
pub struct LogSys {
    state: Mutex<LogState>,
}

impl LogSys {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LogState {
                lsn: 0,
                buf: Vec::new(),
                records: Vec::new(),
            }),
        }
    }

    /// Append a group of records atomically, returning the end lsn.
    pub fn append(&self, recs: &[LogRec]) -> Lsn {
        let mut writer = SmallWriter::new();
        for rec in recs {
            rec.encode(&mut writer);
        }
        let bytes = writer.into_bytes();

        let mut state = self.state.lock();
        let start = state.lsn;
        for rec in recs {
            state.records.push((start, rec.kind, rec.page_id));
        }
        state.buf.extend_from_slice(&bytes);
        state.lsn += bytes.len() as Lsn;
        debug!("mtr commit: {} redo records, lsn {} -> {}", recs.len(), start, state.lsn);
        state.lsn
    }

    pub fn lsn(&self) -> Lsn {
        self.state.lock().lsn
    }

    /// Records of the given kind written at or after `since`.
    pub fn count_since(&self, since: Lsn, kind: MlogType) -> usize {
        self.state
            .lock()
            .records
            .iter()
            .filter(|(lsn, k, _)| *lsn >= since && *k == kind)
            .count()
    }

}
