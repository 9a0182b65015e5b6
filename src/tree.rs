use std::fmt;

use crate::ctx::allocator::ByteRange;
use crate::error::Result;
use crate::field::Field;
use crate::node::{Arena, NodeId, NodeKind};
use crate::resolver::Resolver;

/// Handle to a committed tree. The generation is bumped when the tree is destroyed,
/// so a stale handle is caught even after its slot in the context is reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TreeHandle {
    pub(crate) ctx: u32,
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// Everything about a tree that can be computed before any memory is requested
pub(crate) struct TreePlan {
    pub resolvers: Vec<Resolver>,
    pub total_size: usize,
}

impl TreePlan {
    pub fn new(arena: &Arena, fast_path: bool) -> Result<Self> {
        arena.validate()?;
        let cells = arena.cell_bytes()?;
        let bases = arena.child_bases(&cells);
        let resolvers = (0..arena.slots().len())
            .map(|s| Resolver::derive(arena, s, &cells, &bases, fast_path))
            .collect::<Result<Vec<_>>>()?;
        Ok(TreePlan { resolvers, total_size: cells[arena.root().index()] })
    }
}

/// A frozen layout and its backing region. Only the context that committed it can release it.
pub struct LayoutTree {
    arena: Arena,
    resolvers: Vec<Resolver>,
    total_size: usize,
    region: ByteRange,
    managed: bool,
}

impl LayoutTree {
    pub(crate) fn new(arena: Arena, plan: TreePlan, region: ByteRange, managed: bool) -> Self {
        LayoutTree { arena, resolvers: plan.resolvers, total_size: plan.total_size, region, managed }
    }

    pub(crate) fn into_region(self) -> ByteRange {
        self.region
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn region(&self) -> &ByteRange {
        &self.region
    }

    /// true for trees owned by the default root
    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn node_count(&self) -> usize {
        self.arena.len()
    }

    pub fn slot_count(&self) -> usize {
        self.resolvers.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = Field> + '_ {
        self.arena.slots().iter().map(|s| s.field)
    }

    pub(crate) fn resolver(&self, slot: usize) -> &Resolver {
        &self.resolvers[slot]
    }

    fn fmt_node(&self, f: &mut fmt::Formatter<'_>, id: NodeId, depth: usize) -> fmt::Result {
        let node = match self.arena.get(id) {
            Ok(node) => node,
            Err(_) => return Ok(()),
        };
        let pad = "  ".repeat(depth);
        match node.shape() {
            Some(shape) => write!(f, "{}{}", pad, shape)?,
            None => write!(f, "{}root [{} bytes]", pad, self.total_size)?,
        }
        match node.kind() {
            NodeKind::Structural(children) => {
                writeln!(f)?;
                for &c in children {
                    self.fmt_node(f, c, depth + 1)?;
                }
            }
            NodeKind::Terminal(group) => {
                let slots = group.iter().map(|&s| {
                    let slot = &self.arena.slots()[s];
                    format!("{}: {}B", slot.field, slot.field.element_size())
                });
                writeln!(f, ".place({})", itertools::join(slots, ", "))?;
            }
        }
        Ok(())
    }
}

impl fmt::Display for LayoutTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_node(f, self.arena.root(), 0)
    }
}

impl fmt::Debug for LayoutTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayoutTree")
            .field("nodes", &self.arena.len())
            .field("slots", &self.resolvers.len())
            .field("total_size", &self.total_size)
            .field("managed", &self.managed)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shape::AxisDescriptor;

    #[test]
    fn plan_sizes() {
        let mut arena = Arena::new();
        let root = arena.root();
        let a = arena.push_child(root, AxisDescriptor::dense(0, 3)).unwrap();
        let b = arena.push_child(a, AxisDescriptor::dense(1, 4)).unwrap();
        arena.push_slots(b, &[Field::detached(4), Field::detached(4)]).unwrap();
        let plan = TreePlan::new(&arena, true).unwrap();
        assert_eq!(plan.total_size, 3 * 4 * 8);
        assert_eq!(plan.resolvers.len(), 2);
        assert_eq!(plan.resolvers[1].base(), 4);
    }

    #[test]
    fn plan_rejects_dangling_blocks() {
        let mut arena = Arena::new();
        let root = arena.root();
        let a = arena.push_child(root, AxisDescriptor::dense(0, 3)).unwrap();
        arena.push_slots(a, &[Field::detached(4)]).unwrap();
        arena.push_child(root, AxisDescriptor::dense(0, 2)).unwrap();
        assert!(TreePlan::new(&arena, true).is_err());
    }
}
