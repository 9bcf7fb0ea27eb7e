mod cursor;
mod decode;
mod session;
mod types;

pub use cursor::{Cursor, ResultSet, is_result_query};
pub use session::SSql;
pub use types::{ResultColumn, ResultRow, Value};
