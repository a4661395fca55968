use std::fmt;

/// Main type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MType {
    /// Signed integer, stored in 8 bytes with the sign bit flipped so that
    /// byte order equals numeric order.
    Int,
    Varchar,
    Binary,
    /// Internal system column (transaction id, roll pointer, child page
    /// number of a node pointer).
    Sys,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct DType {
    pub mtype: MType,

    /// Maximum length in bytes, 0 means unbounded.
    pub len: usize,

    pub nullable: bool,
}

impl DType {
    pub fn int() -> Self {
        Self {
            mtype: MType::Int,
            len: 8,
            nullable: false,
        }
    }

    pub fn varchar(len: usize) -> Self {
        Self {
            mtype: MType::Varchar,
            len,
            nullable: false,
        }
    }

    pub fn binary(len: usize) -> Self {
        Self {
            mtype: MType::Binary,
            len,
            nullable: false,
        }
    }

    pub fn sys(len: usize) -> Self {
        Self {
            mtype: MType::Sys,
            len,
            nullable: false,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

}

impl fmt::Debug for DType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}({})", self.mtype, self.len)?;
        if self.nullable {
            write!(f, "?")?;
        }
        Ok(())
    }
}
