mod buf;
mod fsp;
mod log_sys;
mod mtr;
mod page;

pub use buf::{BufPool, PageLatch};
pub use fsp::{Fsp, Reservation};
pub use log_sys::{LogRec, LogSys, MlogType};
pub use mtr::{Mtr, RwMode};
pub use page::{
    blob_page_capacity, page_capacity, page_max_rec_size, Page, PageCurMode, PageId, PageKind,
    Rec, BLOB_HDR_SIZE, PAGE_DATA, PAGE_INFIMUM_SLOT,
};
