pub mod merger;
pub mod query_result;

pub use merger::ResultSet;
pub use query_result::QueryResult;
