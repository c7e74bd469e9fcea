pub mod cursor;
pub mod sql;

pub use cursor::{ColumnDesc, CursorError, PgExecutor, RawCursor, RawRow, SqlExecutor, SqlParam, SqlValue};
