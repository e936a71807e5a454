//! Collections backed by an object container
//!
//! - [`StreamMappedList`]: plain list, removal shifts indices
//! - [`RecyclableList`]: removal reaps, `push` reuses reaped slots
//! - [`StreamMappedDictionary`]: key/value entries over a unique key index

mod dictionary;
mod list;
mod recyclable_list;

pub use dictionary::{StreamMappedDictionary, KEY_INDEX_STREAM};
pub use list::StreamMappedList;
pub use recyclable_list::{RecyclableList, RECYCLE_STREAM};
