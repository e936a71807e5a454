//! Container notifications

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of item operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemOperation {
    Read,
    Add,
    Insert,
    Update,
    Remove,
    Reap,
}

impl fmt::Display for ItemOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ItemOperation::Read => "read",
            ItemOperation::Add => "add",
            ItemOperation::Insert => "insert",
            ItemOperation::Update => "update",
            ItemOperation::Remove => "remove",
            ItemOperation::Reap => "reap",
        };
        f.write_str(name)
    }
}

/// One item operation as seen by providers and listeners.
///
/// `item` is `None` for null saves, removals, reaps, and before a read.
#[derive(Debug)]
pub struct ItemEvent<'e, T> {
    pub index: u64,
    pub item: Option<&'e T>,
    pub operation: ItemOperation,
}

impl<T> Clone for ItemEvent<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ItemEvent<'_, T> {}

/// Event delivered to container listeners
#[derive(Debug)]
pub enum ContainerEvent<'e, T> {
    Loading,
    Loaded,
    Clearing,
    Cleared,
    PreItem(ItemEvent<'e, T>),
    PostItem(ItemEvent<'e, T>),
}

pub type Listener<T> = Box<dyn Fn(&ContainerEvent<'_, T>) + Send + Sync>;

/// Subscription handle returned by `ObjectContainer::subscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);
