// Physical row storage.

pub mod paged_rows;

pub use paged_rows::{PagedRows, PagedRowsBuilder};
