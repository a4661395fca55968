use crate::error::SmallError;

pub type SmallResult = Result<(), SmallError>;

pub type TrxId = u64;

/// Commit order number of a transaction.
pub type TrxNo = u64;

/// Position of an undo record inside its transaction.
pub type UndoNo = u64;

pub type IndexId = u64;

pub type TableId = u64;

pub type Lsn = u64;
