pub mod btree;
pub mod config;
pub mod data;
pub mod database;
pub mod dict;
pub mod io;
pub mod lock;
pub mod que;
pub mod row;
pub mod srv;
pub mod storage;
pub mod sync;
pub mod transaction;
pub mod types;
pub mod utils;

mod error;
mod log;

pub use config::Config;
pub use database::Database;
pub use error::{ErrorCode, SmallError};
