use bytes::{Bytes, BytesMut};
use log::debug;

use super::{
    cursor::BtrCur,
    tree::{btr_page_free, btr_page_alloc_blob},
};
use crate::{
    data::{BigRec, DTuple, ExternRef},
    database::Database,
    error::{ErrorCode, SmallError},
    io::SmallWriter,
    row::upd::Update,
    storage::{blob_page_capacity, MlogType, Mtr, PageId, PageKind, Rec, RwMode},
    types::SmallResult,
};

fn ref_body(field_no: usize, r: &ExternRef) -> Vec<u8> {
    let mut writer = SmallWriter::new();
    writer.write_u16(field_no as u16);
    writer.write(r);
    writer.into_bytes()
}

fn cur_rec_mut<'a>(cur: &BtrCur, mtr: &'a mut Mtr) -> Result<&'a mut Rec, SmallError> {
    let slot = cur.slot;
    cur.page_mut(mtr)?
        .rec_mut(slot)
        .ok_or_else(|| SmallError::internal("external field access on a page boundary"))
}

/// Write the fields of `big_rec` to chains of blob pages and store the
/// references in the record under the cursor, which must be x-latched.
///
/// The record owns the new chains.
pub fn btr_store_big_rec_extern_fields(
    db: &Database,
    cur: &BtrCur,
    big_rec: &BigRec,
    mtr: &mut Mtr,
) -> SmallResult {
    let space = cur.index.space();
    let capacity = blob_page_capacity(db.config().page_size);

    for field in &big_rec.fields {
        let n_pages = ((field.data.len() + capacity - 1) / capacity).max(1);
        let mut page_nos = Vec::with_capacity(n_pages);
        for _ in 0..n_pages {
            page_nos.push(btr_page_alloc_blob(db, space, mtr)?);
        }

        for (i, page_no) in page_nos.iter().enumerate() {
            let start = i * capacity;
            let end = (start + capacity).min(field.data.len());
            let pid = PageId::new(space, *page_no);
            let next = page_nos.get(i + 1).copied();
            mtr.page_mut(&pid)?.init_blob(field.data.slice(start..end), next);
            mtr.log(MlogType::BlobWrite, pid, field.data[start..end].to_vec());
        }

        let r = ExternRef::new(space, page_nos[0], field.len as u64);
        cur_rec_mut(cur, mtr)?.set_extern_ref(field.field_no, &r);
        mtr.log(MlogType::ExternRefWrite, cur.page_id, ref_body(field.field_no, &r));
        debug!(
            "stored field {} of {} bytes on {} blob pages from page {}",
            field.field_no, field.len, n_pages, page_nos[0]
        );
    }
    Ok(())
}

/// Read an off-page value through its reference.
pub fn btr_copy_externally_stored_field(r: &ExternRef, mtr: &mut Mtr) -> Result<Bytes, SmallError> {
    if r.is_null() {
        return Err(SmallError::new(
            ErrorCode::Corruption,
            "copy of a freed external field",
        ));
    }

    let mut buf = BytesMut::with_capacity(r.len as usize);
    let mut next = Some(r.page_no);
    while let Some(page_no) = next {
        let pid = PageId::new(r.space, page_no);
        let newly = mtr.page_latch_mode(&pid).is_none();
        mtr.latch_page(&pid, RwMode::S)?;
        {
            let page = mtr.page(&pid)?;
            if page.kind() != PageKind::Blob {
                return Err(SmallError::new(
                    ErrorCode::Corruption,
                    &format!("external field chain reaches {:?}", page),
                ));
            }
            buf.extend_from_slice(page.blob_data());
            next = page.blob_next();
        }
        if newly {
            mtr.release_page(&pid);
        }
    }

    if buf.len() as u64 != r.len {
        return Err(SmallError::new(
            ErrorCode::Corruption,
            &format!("external field of {} bytes, chain holds {}", r.len, buf.len()),
        ));
    }
    Ok(buf.freeze())
}

/// Free the chain of an external field.
///
/// Nothing is freed when the record does not own the chain, or when the
/// chain is inherited and `do_not_free_inherited` is set (rollback). On
/// return the reference is nulled when the chain was freed.
pub fn btr_free_externally_stored_field(
    db: &Database,
    r: &mut ExternRef,
    do_not_free_inherited: bool,
    mtr: &mut Mtr,
) -> SmallResult {
    if r.is_null() || !r.owner || (do_not_free_inherited && r.inherited) {
        return Ok(());
    }

    let mut next = Some(r.page_no);
    let mut n_pages = 0;
    while let Some(page_no) = next {
        let pid = PageId::new(r.space, page_no);
        mtr.latch_page(&pid, RwMode::X)?;
        let page = mtr.page(&pid)?;
        if page.kind() != PageKind::Blob {
            return Err(SmallError::new(
                ErrorCode::Corruption,
                &format!("free of external field reaches {:?}", page),
            ));
        }
        next = page.blob_next();
        btr_page_free(db, &pid, mtr)?;
        n_pages += 1;
    }
    debug!("freed external field of {} bytes, {} pages", r.len, n_pages);

    r.page_no = 0;
    r.len = 0;
    Ok(())
}

/// Free every external field owned by the record under the cursor.
pub fn btr_rec_free_externally_stored_fields(
    db: &Database,
    cur: &BtrCur,
    rollback: bool,
    mtr: &mut Mtr,
) -> SmallResult {
    let ext: Vec<usize> = cur_rec_mut(cur, mtr)?
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.is_ext())
        .map(|(i, _)| i)
        .collect();
    for i in ext {
        free_rec_field(db, cur, i, rollback, mtr)?;
    }
    Ok(())
}

/// Free the external fields of the record under the cursor which get a
/// new value from `update`.
pub fn btr_rec_free_updated_extern_fields(
    db: &Database,
    cur: &BtrCur,
    update: &Update,
    rollback: bool,
    mtr: &mut Mtr,
) -> SmallResult {
    for upd_field in &update.fields {
        let is_ext = cur_rec_mut(cur, mtr)?
            .fields
            .get(upd_field.field_no)
            .map_or(false, |f| f.is_ext());
        if is_ext {
            free_rec_field(db, cur, upd_field.field_no, rollback, mtr)?;
        }
    }
    Ok(())
}

fn free_rec_field(
    db: &Database,
    cur: &BtrCur,
    field_no: usize,
    rollback: bool,
    mtr: &mut Mtr,
) -> SmallResult {
    let mut r = cur_rec_mut(cur, mtr)?.extern_ref(field_no)?;
    let before = r;
    btr_free_externally_stored_field(db, &mut r, rollback, mtr)?;
    if r != before {
        cur_rec_mut(cur, mtr)?.set_extern_ref(field_no, &r);
        mtr.log(MlogType::ExternRefWrite, cur.page_id, ref_body(field_no, &r));
    }
    Ok(())
}

fn set_ownership(cur: &BtrCur, field_no: usize, owner: bool, mtr: &mut Mtr) -> SmallResult {
    let rec = cur_rec_mut(cur, mtr)?;
    let mut r = rec.extern_ref(field_no)?;
    r.owner = owner;
    rec.set_extern_ref(field_no, &r);
    mtr.log(MlogType::ExternRefWrite, cur.page_id, ref_body(field_no, &r));
    Ok(())
}

/// The record under the cursor gives up the external fields which
/// `update` does not touch: a new version of the row, inserted
/// elsewhere in the tree, takes them over.
pub fn btr_cur_disown_inherited_fields(cur: &BtrCur, update: &Update, mtr: &mut Mtr) -> SmallResult {
    let ext: Vec<usize> = cur_rec_mut(cur, mtr)?
        .fields
        .iter()
        .enumerate()
        .filter(|(i, f)| f.is_ext() && !update.is_field_updated(*i))
        .map(|(i, _)| i)
        .collect();
    for i in ext {
        set_ownership(cur, i, false, mtr)?;
    }
    Ok(())
}

/// Mark the external fields of a new entry which are not updated as
/// inherited from the previous version of the row. The entry owns them,
/// but a rollback of its insert must leave them alone.
pub fn btr_cur_mark_dtuple_inherited_extern(entry: &mut DTuple, update: &Update) -> SmallResult {
    for i in entry.ext_fields() {
        if update.is_field_updated(i) {
            continue;
        }
        let field = entry.get_nth_field_mut(i);
        let mut r = ExternRef::from_field(field)?;
        r.owner = true;
        r.inherited = true;
        field.set_data(Some(r.to_field_data()));
    }
    Ok(())
}

/// The record under the cursor becomes the owner of all its external
/// fields, inherited marks are kept.
pub fn btr_cur_unmark_extern_fields(cur: &BtrCur, mtr: &mut Mtr) -> SmallResult {
    let ext: Vec<usize> = cur_rec_mut(cur, mtr)?
        .fields
        .iter()
        .enumerate()
        .filter(|(_, f)| f.is_ext())
        .map(|(i, _)| i)
        .collect();
    for i in ext {
        set_ownership(cur, i, true, mtr)?;
    }
    Ok(())
}
