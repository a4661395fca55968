mod big_rec;
mod dtype;
mod field;
mod tuple;

pub use big_rec::{
    dtuple_convert_back_big_rec, dtuple_convert_big_rec, BigRec, BigRecField, ExternRef,
    BTR_EXTERN_FIELD_REF_SIZE, BTR_EXTERN_INHERITED_FLAG, BTR_EXTERN_OWNER_FLAG,
};
pub use dtype::{DType, MType};
pub use field::DField;
pub use tuple::{
    cmp_dtuple_rec, cmp_dtuple_rec_with_match, rec_converted_size, DTuple, REC_INFO_DELETED_FLAG,
    REC_INFO_MIN_REC_FLAG, REC_N_EXTRA_BYTES,
};
