use std::fmt;

use crate::tree::TreeHandle;

/// Opaque handle to a declared field. It only carries what the layout needs, the byte size of one
/// element; names and bindings live in the `LayoutContext` that declared it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Field {
    ctx: u32,
    id: u32,
    element_size: usize,
}

impl Field {
    pub(crate) fn new(ctx: u32, id: u32, element_size: usize) -> Self {
        Field { ctx, id, element_size }
    }

    /// a field that belongs to no context, for exercising builders on their own
    #[cfg(test)]
    pub(crate) fn detached(element_size: usize) -> Self {
        use std::sync::atomic::{AtomicU32, Ordering};
        static NEXT: AtomicU32 = AtomicU32::new(0);
        Field { ctx: 0, id: NEXT.fetch_add(1, Ordering::Relaxed), element_size }
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub(crate) fn ctx(&self) -> u32 {
        self.ctx
    }

    pub(crate) fn id(&self) -> usize {
        self.id as usize
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "field#{}", self.id)
    }
}

/// Where a committed field lives
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldInfo {
    pub name: String,
    pub element_size: usize,
    pub tree: TreeHandle,
    pub shape: Vec<usize>,
    /// byte offset of element zero inside the tree's region
    pub base_offset: usize,
}
