pub mod cache;
pub mod disk;
pub mod error;
pub mod page;
pub mod pager;
pub mod wal;

pub use disk::{DiskManager, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use page::{DataPage, MetaPage, Page};
pub use pager::{PageHandle, Pager};
pub use wal::Wal;
