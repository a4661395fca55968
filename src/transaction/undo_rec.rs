use bytes::Bytes;
use log::debug;

use super::{
    purge::PurgeState,
    trx::Trx,
    undo::{RollPtr, UndoKind},
};
use crate::{
    btree::BTR_NO_UNDO_LOG_FLAG,
    data::{DField, DTuple, DType, MType},
    database::Database,
    dict::{Index, DATA_TRX_ID_LEN},
    error::{ErrorCode, SmallError},
    io::{Decodeable, Encodeable, SmallReader, SmallWriter},
    row::upd::{rec_apply_update, Update},
    storage::Rec,
    types::{TableId, TrxId, UndoNo},
};

/// The update did not change any ordering field of any index.
pub const UPD_NODE_NO_ORD_CHANGE: u8 = 1;

/// No field changed its size.
pub const UPD_NODE_NO_SIZE_CHANGE: u8 = 2;

const TRX_UNDO_CMPL_INFO_MULT: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoRecType {
    /// fresh insert of a clustered index record
    Insert = 11,
    /// update of a non-delete-marked record
    UpdExist = 12,
    /// update of a delete-marked record (insert by modify)
    UpdDel = 13,
    /// delete-mark of a record
    DelMark = 14,
}

impl TryFrom<u8> for UndoRecType {
    type Error = SmallError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            11 => Ok(UndoRecType::Insert),
            12 => Ok(UndoRecType::UpdExist),
            13 => Ok(UndoRecType::UpdDel),
            14 => Ok(UndoRecType::DelMark),
            _ => Err(SmallError::new(
                ErrorCode::Corruption,
                &format!("unknown undo record type {}", v),
            )),
        }
    }
}

/// Decoded undo record.
#[derive(Debug, Clone)]
pub struct TrxUndoRec {
    pub rec_type: UndoRecType,
    pub cmpl_info: u8,
    pub undo_no: UndoNo,
    pub table_id: TableId,

    /// Primary key of the row.
    pub ref_fields: Vec<DField>,

    /// System fields and info bits of the version before the change,
    /// update kinds only.
    pub old_trx_id: TrxId,
    pub old_roll_ptr: Option<RollPtr>,
    pub old_info_bits: u8,

    /// Old values of the updated clustered index fields.
    pub update: Vec<(usize, DField)>,

    /// Old values of every column which is an ordering field of some
    /// index, keyed by column number.
    pub ord_cols: Vec<(usize, DField)>,
}

impl TrxUndoRec {
    pub fn new_insert(undo_no: UndoNo, table_id: TableId, ref_fields: Vec<DField>) -> Self {
        Self {
            rec_type: UndoRecType::Insert,
            cmpl_info: 0,
            undo_no,
            table_id,
            ref_fields,
            old_trx_id: 0,
            old_roll_ptr: None,
            old_info_bits: 0,
            update: Vec::new(),
            ord_cols: Vec::new(),
        }
    }

    pub fn is_insert(&self) -> bool {
        self.rec_type == UndoRecType::Insert
    }

    /// Old value of a column, if it was logged.
    pub fn ord_col(&self, col: usize) -> Option<&DField> {
        self.ord_cols.iter().find(|(c, _)| *c == col).map(|(_, f)| f)
    }
}

fn encode_field(writer: &mut SmallWriter, field: &DField) {
    let mut flags = 0u8;
    if field.is_null() {
        flags |= 1;
    }
    if field.is_ext() {
        flags |= 2;
    }
    writer.write_u8(flags);
    let dtype = field.dtype();
    writer.write_u8(match dtype.mtype {
        MType::Int => 1,
        MType::Varchar => 2,
        MType::Binary => 3,
        MType::Sys => 4,
    });
    writer.write_u32(dtype.len as u32);
    writer.write_u8(dtype.nullable as u8);
    if !field.is_null() {
        writer.write_var_bytes(field.bytes());
    }
}

fn decode_field(reader: &mut SmallReader) -> Result<DField, SmallError> {
    let flags = reader.read_u8()?;
    let mtype = match reader.read_u8()? {
        1 => MType::Int,
        2 => MType::Varchar,
        3 => MType::Binary,
        4 => MType::Sys,
        v => {
            return Err(SmallError::new(
                ErrorCode::Corruption,
                &format!("unknown mtype {}", v),
            ))
        }
    };
    let len = reader.read_u32()? as usize;
    let nullable = reader.read_u8()? == 1;
    let dtype = DType {
        mtype,
        len,
        nullable,
    };
    let data = if flags & 1 != 0 {
        None
    } else {
        Some(Bytes::copy_from_slice(reader.read_var_bytes()?))
    };
    let mut field = DField::new(data, dtype);
    field.set_ext(flags & 2 != 0);
    Ok(field)
}

fn encode_numbered(writer: &mut SmallWriter, fields: &[(usize, DField)]) {
    writer.write_u16(fields.len() as u16);
    for (no, field) in fields {
        writer.write_u16(*no as u16);
        encode_field(writer, field);
    }
}

fn decode_numbered(reader: &mut SmallReader) -> Result<Vec<(usize, DField)>, SmallError> {
    let n = reader.read_u16()?;
    let mut fields = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let no = reader.read_u16()? as usize;
        fields.push((no, decode_field(reader)?));
    }
    Ok(fields)
}

/// # Format
///
/// - 1 byte: type + compiler info * 16
/// - 8 bytes: undo number
/// - 8 bytes: table id
/// - 2 bytes + fields: row reference
/// - update kinds only:
///   - 8 bytes: old DB_TRX_ID
///   - 8 bytes: old DB_ROLL_PTR
///   - 1 byte: old info bits
///   - 2 bytes + (2 bytes field number, field)*: old values
///   - 2 bytes + (2 bytes column number, field)*: ordering columns
impl Encodeable for TrxUndoRec {
    fn encode(&self, writer: &mut SmallWriter) {
        writer.write_u8(self.rec_type as u8 + self.cmpl_info * TRX_UNDO_CMPL_INFO_MULT);
        writer.write_u64(self.undo_no);
        writer.write_u64(self.table_id);
        writer.write_u16(self.ref_fields.len() as u16);
        for f in &self.ref_fields {
            encode_field(writer, f);
        }

        if self.is_insert() {
            return;
        }

        writer.write_u64(self.old_trx_id);
        writer.write_u64(self.old_roll_ptr.map_or(0, |p| p.to_u64()));
        writer.write_u8(self.old_info_bits);
        encode_numbered(writer, &self.update);
        encode_numbered(writer, &self.ord_cols);
    }
}

impl Decodeable for TrxUndoRec {
    fn decode_from(reader: &mut SmallReader) -> Result<Self, SmallError> {
        let type_cmpl = reader.read_u8()?;
        let rec_type = UndoRecType::try_from(type_cmpl % TRX_UNDO_CMPL_INFO_MULT)?;
        let cmpl_info = type_cmpl / TRX_UNDO_CMPL_INFO_MULT;
        let undo_no = reader.read_u64()?;
        let table_id = reader.read_u64()?;
        let n_ref = reader.read_u16()?;
        let mut ref_fields = Vec::with_capacity(n_ref as usize);
        for _ in 0..n_ref {
            ref_fields.push(decode_field(reader)?);
        }

        let mut rec = TrxUndoRec::new_insert(undo_no, table_id, ref_fields);
        rec.rec_type = rec_type;
        rec.cmpl_info = cmpl_info;
        if rec.is_insert() {
            return Ok(rec);
        }

        rec.old_trx_id = reader.read_u64()?;
        rec.old_roll_ptr = Some(RollPtr::from_u64(reader.read_u64()?));
        rec.old_info_bits = reader.read_u8()?;
        rec.update = decode_numbered(reader)?;
        rec.ord_cols = decode_numbered(reader)?;
        Ok(rec)
    }
}

/// The change an undo record is written for.
pub enum UndoOp<'a> {
    /// Fresh insert of a clustered index entry.
    Insert { entry: &'a DTuple },

    /// Update of `rec`, or its delete-marking when `update` is `None`.
    Modify {
        rec: &'a Rec,
        update: Option<&'a Update>,
        cmpl_info: u8,
    },
}

/// Write the undo record of a clustered index change and return the roll
/// pointer the changed record must carry.
///
/// Returns `None` when `BTR_NO_UNDO_LOG_FLAG` is set.
pub fn trx_undo_report_row_operation(
    db: &Database,
    trx: &mut Trx,
    flags: u32,
    index: &Index,
    op: UndoOp,
) -> Result<Option<RollPtr>, SmallError> {
    if flags & BTR_NO_UNDO_LOG_FLAG != 0 {
        return Ok(None);
    }
    if !index.is_clustered() {
        return Err(SmallError::internal(&format!(
            "undo logging on secondary index {}",
            index.name()
        )));
    }

    let undo_no = trx.undo_no;
    let (kind, undo_rec) = match op {
        UndoOp::Insert { entry } => (
            UndoKind::Insert,
            TrxUndoRec::new_insert(
                undo_no,
                index.table_id(),
                entry.fields()[..index.n_uniq()].to_vec(),
            ),
        ),
        UndoOp::Modify {
            rec,
            update,
            cmpl_info,
        } => (
            UndoKind::Update,
            build_modify_rec(db, index, undo_no, rec, update, cmpl_info)?,
        ),
    };

    let payload = undo_rec.to_bytes();
    let trx_id = trx.id();
    let log = trx.undo_log_mut(kind);
    let roll_ptr = db.undo_space().append(log, undo_no, &payload)?;
    trx.undo_no += 1;

    debug!(
        "tx_{}: undo {:?} no {} on {}, {:?}",
        trx_id,
        undo_rec.rec_type,
        undo_no,
        index.name(),
        roll_ptr
    );
    Ok(Some(roll_ptr))
}

fn build_modify_rec(
    db: &Database,
    index: &Index,
    undo_no: UndoNo,
    rec: &Rec,
    update: Option<&Update>,
    cmpl_info: u8,
) -> Result<TrxUndoRec, SmallError> {
    let table = db.dict().get_table(index.table_id()).ok_or_else(|| {
        SmallError::internal(&format!("no table for index {}", index.name()))
    })?;
    let (trx_id_pos, roll_ptr_pos) = match (index.trx_id_pos(), index.roll_ptr_pos()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(SmallError::internal("clustered index without system fields")),
    };

    let rec_type = match update {
        None => UndoRecType::DelMark,
        Some(_) if rec.is_delete_marked() => UndoRecType::UpdDel,
        Some(_) => UndoRecType::UpdExist,
    };

    let mut undo_rec =
        TrxUndoRec::new_insert(undo_no, index.table_id(), rec.fields[..index.n_uniq()].to_vec());
    undo_rec.rec_type = rec_type;
    undo_rec.cmpl_info = cmpl_info;
    undo_rec.old_trx_id = rec.fields[trx_id_pos]
        .as_u64()
        .ok_or_else(|| SmallError::new(ErrorCode::Corruption, "malformed DB_TRX_ID"))?;
    undo_rec.old_roll_ptr = Some(RollPtr::from_field(&rec.fields[roll_ptr_pos])?);
    undo_rec.old_info_bits = rec.info_bits;

    if let Some(update) = update {
        undo_rec.update = update
            .fields
            .iter()
            .map(|uf| (uf.field_no, rec.fields[uf.field_no].clone()))
            .collect();
    }

    // ordering columns of every index, so that purge and rollback can
    // rebuild the old index entries
    let indexes = std::iter::once(table.clust_index()).chain(table.secondary_indexes().iter());
    for idx in indexes {
        for col in idx.ord_cols() {
            if undo_rec.ord_col(col).is_some() {
                continue;
            }
            if let Some(pos) = index.col_pos(col) {
                undo_rec.ord_cols.push((col, rec.fields[pos].clone()));
            }
        }
    }
    Ok(undo_rec)
}

/// Fetch and decode the undo record a roll pointer points to.
pub fn trx_undo_get_undo_rec(db: &Database, roll_ptr: &RollPtr) -> Result<TrxUndoRec, SmallError> {
    let bytes = db.undo_space().read(roll_ptr)?;
    TrxUndoRec::from_bytes(&bytes)
}

/// The update vector which turns a clustered record back into the
/// version before the change logged in `undo_rec`, system fields
/// included.
pub fn trx_undo_update_rec_get_update(
    index: &Index,
    undo_rec: &TrxUndoRec,
) -> Result<Update, SmallError> {
    let (trx_id_pos, roll_ptr_pos) = match (index.trx_id_pos(), index.roll_ptr_pos()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(SmallError::internal("clustered index without system fields")),
    };
    let old_roll_ptr = undo_rec
        .old_roll_ptr
        .ok_or_else(|| SmallError::internal("insert undo record has no previous version"))?;

    let mut update = Update::new(undo_rec.old_info_bits);
    update.push(trx_id_pos, DField::sys_u64(undo_rec.old_trx_id, DATA_TRX_ID_LEN));
    update.push(roll_ptr_pos, old_roll_ptr.to_field());
    for (field_no, old) in &undo_rec.update {
        update.push(*field_no, old.clone());
    }
    Ok(update)
}

/// Build the version of a clustered record preceding `rec`.
///
/// Returns `None` when `rec` is the version created by the insert. The
/// caller holds the purge latch shared, `MissingHistory` is returned if
/// purge may already have freed the undo record.
pub fn trx_undo_prev_version_build(
    db: &Database,
    index: &Index,
    rec: &Rec,
    purge: &PurgeState,
) -> Result<Option<Rec>, SmallError> {
    let (trx_id_pos, roll_ptr_pos) = match (index.trx_id_pos(), index.roll_ptr_pos()) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(SmallError::internal("clustered index without system fields")),
    };
    let roll_ptr = RollPtr::from_field(&rec.fields[roll_ptr_pos])?;
    if roll_ptr.is_insert {
        return Ok(None);
    }

    let trx_id = rec.fields[trx_id_pos]
        .as_u64()
        .ok_or_else(|| SmallError::new(ErrorCode::Corruption, "malformed DB_TRX_ID"))?;
    if !purge.update_undo_must_exist(trx_id) {
        return Err(SmallError::new(
            ErrorCode::MissingHistory,
            &format!("undo of tx_{} at {:?} may be purged", trx_id, roll_ptr),
        ));
    }

    let undo_rec = trx_undo_get_undo_rec(db, &roll_ptr)?;
    let update = trx_undo_update_rec_get_update(index, &undo_rec)?;
    let mut prev = rec.clone();
    rec_apply_update(&mut prev, &update);
    Ok(Some(prev))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_rec_codec() {
        let mut ext = DField::binary(vec![0u8; 20]);
        ext.set_ext(true);
        let rec = TrxUndoRec {
            rec_type: UndoRecType::UpdExist,
            cmpl_info: UPD_NODE_NO_ORD_CHANGE,
            undo_no: 9,
            table_id: 2,
            ref_fields: vec![DField::int(5)],
            old_trx_id: 31,
            old_roll_ptr: Some(RollPtr {
                is_insert: false,
                page_no: 4,
                offset: 120,
            }),
            old_info_bits: 0x20,
            update: vec![(3, ext), (4, DField::null(DType::varchar(10).nullable()))],
            ord_cols: vec![(0, DField::int(5))],
        };

        let decoded = TrxUndoRec::from_bytes(&rec.to_bytes()).unwrap();
        assert_eq!(decoded.rec_type, UndoRecType::UpdExist);
        assert_eq!(decoded.cmpl_info, UPD_NODE_NO_ORD_CHANGE);
        assert_eq!(decoded.old_roll_ptr, rec.old_roll_ptr);
        assert_eq!(decoded.update, rec.update);
        assert!(decoded.update[0].1.is_ext());
        assert_eq!(decoded.ord_col(0), Some(&DField::int(5)));
    }
}
