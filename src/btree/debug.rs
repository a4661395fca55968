use std::{cmp::Ordering, sync::Arc};

use log::debug;

use super::tree::btr_node_ptr_get_child;
use crate::{
    data::{cmp_dtuple_rec, DTuple},
    database::Database,
    dict::Index,
    error::{ErrorCode, SmallError},
    storage::{Mtr, PageId, PageKind, Rec, RwMode},
    types::SmallResult,
};

fn corruption(msg: String) -> SmallError {
    SmallError::new(ErrorCode::Corruption, &msg)
}

fn key_of(index: &Index, rec: &Rec) -> DTuple {
    let n = index.n_uniq().min(rec.fields.len());
    DTuple::new(rec.fields[..n].to_vec())
}

/// Number of levels of the tree.
pub fn btr_tree_height(db: &Database, index: &Arc<Index>) -> Result<usize, SmallError> {
    let mut mtr = Mtr::start(db);
    mtr.latch_tree(index, RwMode::S)?;
    mtr.latch_page(&index.root(), RwMode::S)?;
    let height = mtr.page(&index.root())?.level() + 1;
    mtr.commit();
    Ok(height)
}

/// Number of pages on a level, counted along the sibling links.
pub fn btr_n_pages_at_level(
    db: &Database,
    index: &Arc<Index>,
    level: usize,
) -> Result<usize, SmallError> {
    let mut mtr = Mtr::start(db);
    mtr.latch_tree(index, RwMode::S)?;

    // step 1: the leftmost page of the level
    let mut pid = index.root();
    loop {
        mtr.latch_page(&pid, RwMode::S)?;
        let page = mtr.page(&pid)?;
        if page.level() < level {
            return Err(SmallError::internal(&format!(
                "{} has no level {}",
                index.name(),
                level
            )));
        }
        if page.level() == level {
            break;
        }
        let rec = page
            .rec(1)
            .ok_or_else(|| corruption(format!("empty non-leaf {:?}", page)))?;
        pid = PageId::new(index.space(), btr_node_ptr_get_child(rec)?);
    }

    // step 2: walk right
    let mut n_pages = 1;
    while let Some(next) = mtr.page(&pid)?.next() {
        pid = PageId::new(index.space(), next);
        mtr.latch_page(&pid, RwMode::S)?;
        n_pages += 1;
    }
    mtr.commit();
    Ok(n_pages)
}

/// Print the tree structure, down to `max_level` levels below the root
/// (-1 for all of them).
pub fn btr_draw_tree(db: &Database, index: &Arc<Index>, max_level: i64) -> Result<String, SmallError> {
    let mut mtr = Mtr::start(db);
    mtr.latch_tree(index, RwMode::S)?;

    let mut depiction = "".to_string();
    depiction.push_str("\n\n----- PRINT TREE STRUCTURE START -----\n\n");
    depiction.push_str(&format!("index: {} (root {})\n", index.name(), index.root()));
    depiction.push_str(&draw_subtree(&mut mtr, index, &index.root(), 0, max_level)?);
    depiction.push_str("\n\n----- PRINT TREE STRUCTURE END   -----\n\n");

    debug!("tree_structure, level {}: {}", max_level, depiction);
    mtr.commit();
    Ok(depiction)
}

fn draw_subtree(
    mtr: &mut Mtr,
    index: &Index,
    pid: &PageId,
    depth: usize,
    max_level: i64,
) -> Result<String, SmallError> {
    let mut depiction = "".to_string();
    let prefix = "│   ".repeat(depth);

    mtr.latch_page(pid, RwMode::S)?;
    let children: Vec<(Rec, u32)> = {
        let page = mtr.page(pid)?;
        if page.is_leaf() {
            depiction.push_str(&format!(
                "{}├── leaf: {} ({} recs, {} bytes) (left: {:?}, right: {:?})\n",
                prefix,
                pid,
                page.n_recs(),
                page.data_size(),
                page.prev(),
                page.next(),
            ));
            let prefix = "│   ".repeat(depth + 1);
            depiction.push_str(&format!("{}├── first rec: {:?}\n", prefix, page.recs().first()));
            depiction.push_str(&format!("{}└── last rec:  {:?}\n", prefix, page.recs().last()));
            return Ok(depiction);
        }

        depiction.push_str(&format!(
            "{}├── internal: {} (level {}, {} children)\n",
            prefix,
            pid,
            page.level(),
            page.n_recs(),
        ));
        if max_level != -1 && depth as i64 == max_level {
            return Ok(depiction);
        }
        page.recs()
            .iter()
            .map(|r| btr_node_ptr_get_child(r).map(|c| (r.clone(), c)))
            .collect::<Result<_, _>>()?
    };

    for (rec, child) in children {
        let key_prefix = "│   ".repeat(depth + 1);
        depiction.push_str(&format!("{}├── key: {:?}\n", key_prefix, key_of(index, &rec)));
        let child_pid = PageId::new(pid.space, child);
        depiction.push_str(&draw_subtree(mtr, index, &child_pid, depth + 1, max_level)?);
    }
    Ok(depiction)
}

struct IntegrityCheck<'a> {
    index: &'a Index,
    // pages of every level in key order, level 0 first
    levels: Vec<Vec<PageId>>,
}

impl<'a> IntegrityCheck<'a> {
    fn check_sub_tree(
        &mut self,
        mtr: &mut Mtr,
        pid: &PageId,
        level: usize,
        lower_bound: Option<&DTuple>,
        upper_bound: Option<&DTuple>,
        leftmost: bool,
    ) -> SmallResult {
        let index = self.index;
        mtr.latch_page(pid, RwMode::S)?;

        let children = {
            let page = mtr.page(pid)?;
            if page.kind() != PageKind::Index || page.index_id() != index.id() {
                return Err(corruption(format!("{:?} is not a page of {:?}", page, index)));
            }
            if page.level() != level {
                return Err(corruption(format!("{:?} found at level {}", page, level)));
            }
            if page.is_empty() && *pid != index.root() {
                return Err(corruption(format!("empty non-root {:?}", page)));
            }

            // records in ascending order inside the bounds
            let mut previous: Option<DTuple> = lower_bound.cloned();
            for (i, rec) in page.recs().iter().enumerate() {
                if rec.is_min_rec() {
                    if !(i == 0 && leftmost && level > 0) {
                        return Err(corruption(format!(
                            "min rec mark on {:?} slot {}",
                            page,
                            i + 1
                        )));
                    }
                    continue;
                }
                if level > 0 && i == 0 && leftmost {
                    return Err(corruption(format!(
                        "leftmost non-leaf {:?} lacks the min rec mark",
                        page
                    )));
                }
                if let Some(prev) = &previous {
                    let ord = cmp_dtuple_rec(prev, &rec.fields, rec.info_bits);
                    let in_order = match ord {
                        Ordering::Less => true,
                        // a node pointer key equals the first key below it
                        Ordering::Equal => i == 0,
                        Ordering::Greater => false,
                    };
                    if !in_order {
                        return Err(corruption(format!(
                            "{:?} slot {}: {:?} is not above {:?}",
                            page,
                            i + 1,
                            rec,
                            prev
                        )));
                    }
                }
                previous = Some(key_of(index, rec));
            }
            if let (Some(upper), Some(last)) = (upper_bound, page.recs().last()) {
                if !last.is_min_rec()
                    && cmp_dtuple_rec(upper, &last.fields, last.info_bits) != Ordering::Greater
                {
                    return Err(corruption(format!(
                        "{:?}: last rec {:?} is not below {:?}",
                        page, last, upper
                    )));
                }
            }

            if level == 0 {
                None
            } else {
                let mut children = Vec::with_capacity(page.n_recs());
                for rec in page.recs() {
                    children.push((rec.clone(), btr_node_ptr_get_child(rec)?));
                }
                Some(children)
            }
        };

        if self.levels.len() <= level {
            self.levels.resize(level + 1, Vec::new());
        }
        self.levels[level].push(*pid);

        if let Some(children) = children {
            let n = children.len();
            for i in 0..n {
                let (rec, child) = &children[i];
                let lower = if rec.is_min_rec() {
                    lower_bound.cloned()
                } else {
                    Some(key_of(index, rec))
                };
                let upper = if i + 1 < n {
                    Some(key_of(index, &children[i + 1].0))
                } else {
                    upper_bound.cloned()
                };
                let child_pid = PageId::new(pid.space, *child);
                self.check_sub_tree(
                    mtr,
                    &child_pid,
                    level - 1,
                    lower.as_ref(),
                    upper.as_ref(),
                    leftmost && i == 0,
                )?;
            }
        }
        Ok(())
    }

    fn check_sibling_links(&self, mtr: &Mtr) -> SmallResult {
        for (level, pages) in self.levels.iter().enumerate() {
            for (i, pid) in pages.iter().enumerate() {
                let page = mtr.page(pid)?;
                let expected_prev = if i == 0 { None } else { Some(pages[i - 1].page_no) };
                let expected_next = pages.get(i + 1).map(|p| p.page_no);
                if page.prev() != expected_prev || page.next() != expected_next {
                    return Err(corruption(format!(
                        "level {}: {:?} should link to prev {:?} next {:?}",
                        level, page, expected_prev, expected_next
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Validate the whole tree: levels, record order against the node
/// pointer keys, min rec marks and sibling links.
pub fn btr_check_integrity(db: &Database, index: &Arc<Index>) -> SmallResult {
    let mut mtr = Mtr::start(db);
    mtr.latch_tree(index, RwMode::S)?;
    mtr.latch_page(&index.root(), RwMode::S)?;
    let root_level = mtr.page(&index.root())?.level();

    let mut check = IntegrityCheck {
        index: index.as_ref(),
        levels: Vec::new(),
    };
    check.check_sub_tree(&mut mtr, &index.root(), root_level, None, None, true)?;
    check.check_sibling_links(&mtr)?;

    debug!(
        "{} is sound: {} levels, {} leaves",
        index.name(),
        root_level + 1,
        check.levels.first().map_or(0, |l| l.len())
    );
    mtr.commit();
    Ok(())
}
