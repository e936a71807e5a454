//! Page cache and memory-paged list
//!
//! ```text
//! NotLoaded ──load──→ Loaded ──(dirty? save)──→ Unloading ──→ NotLoaded
//!                       │
//!                       └──delete──→ Deleted   (never saved)
//! ```
//!
//! Byte-based capacity sums the serializer-declared sizes of each loaded
//! page's items.

mod cache;
mod list;
mod page;
mod storage;

pub use cache::{CacheStats, PageCache};
pub use list::MemoryPagedList;
pub use page::{Page, PageState};
pub use storage::{MemoryPageStorage, PageStorage, StreamPageStorage};
