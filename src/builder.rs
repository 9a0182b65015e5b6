use std::collections::HashSet;

use smallvec::SmallVec;

use crate::ctx::allocator::RegionAllocator;
use crate::ctx::LayoutContext;
use crate::error::{LayoutError, Result};
use crate::field::Field;
use crate::node::{Arena, NodeId};
use crate::shape::AxisDescriptor;
use crate::tree::TreeHandle;

/// Fields placed by one `place` call, they share the terminal node with any earlier group on it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotGroup {
    node: NodeId,
    fields: SmallVec<[Field; 4]>,
}

impl SlotGroup {
    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }
}

/// Staging area for one layout tree.
///
/// Open until `finalize` succeeds, then inert: the node graph has moved into the committed tree
/// and every mutation fails with `AlreadyFinalized`. A failed `finalize` leaves it open.
/// A builder has a single writer; it is `Send` but not meant to be shared.
#[derive(Debug)]
pub struct LayoutBuilder {
    root: NodeId,
    staged: Option<Arena>,
    placed: HashSet<Field>,
    committed: Option<TreeHandle>,
}

impl Default for LayoutBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutBuilder {
    pub fn new() -> Self {
        let arena = Arena::new();
        LayoutBuilder { root: arena.root(), staged: Some(arena), placed: HashSet::new(), committed: None }
    }

    /// shapeless root every tree hangs off
    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn is_open(&self) -> bool {
        self.staged.is_some()
    }

    /// the tree this builder committed, if any
    pub fn handle(&self) -> Option<TreeHandle> {
        self.committed
    }

    fn arena_mut(&mut self) -> Result<&mut Arena> {
        self.staged.as_mut().ok_or(LayoutError::AlreadyFinalized)
    }

    /// Nests one more level of blocks under `node`
    pub fn extend(&mut self, node: NodeId, shape: AxisDescriptor) -> Result<NodeId> {
        let arena = self.arena_mut()?;
        shape.validate()?;
        arena.push_child(node, shape)
    }

    /// Attaches fields to `node`, interleaved with each other and with anything already placed there
    pub fn place(&mut self, node: NodeId, fields: &[Field]) -> Result<SlotGroup> {
        if self.staged.is_none() {
            return Err(LayoutError::AlreadyFinalized);
        }
        if fields.is_empty() {
            return Err(LayoutError::shape("place needs at least one field"));
        }
        let mut seen = HashSet::new();
        for &field in fields {
            if field.element_size() == 0 {
                return Err(LayoutError::shape(format!("{} has zero sized elements", field)));
            }
            if self.placed.contains(&field) || !seen.insert(field) {
                return Err(LayoutError::FieldAlreadyPlaced { field });
            }
        }
        self.arena_mut()?.push_slots(node, fields)?;
        self.placed.extend(seen);
        Ok(SlotGroup { node, fields: fields.into() })
    }

    /// Freezes the graph into a tree owned by `ctx` and allocates its region
    pub fn finalize<A: RegionAllocator>(&mut self, ctx: &mut LayoutContext<A>) -> Result<TreeHandle> {
        self.commit(ctx, false)
    }

    pub(crate) fn commit<A: RegionAllocator>(&mut self, ctx: &mut LayoutContext<A>, managed: bool) -> Result<TreeHandle> {
        let handle = ctx.commit(&mut self.staged, managed)?;
        self.committed = Some(handle);
        Ok(handle)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ctx::allocator::{BoundedAllocator, HeapAllocator};

    #[test]
    fn builder_goes_inert() {
        let mut ctx = LayoutContext::new();
        let x = ctx.field::<f32>("x").unwrap();
        let mut b = LayoutBuilder::new();
        let n = b.extend(b.root(), AxisDescriptor::dense(0, 3)).unwrap();
        b.place(n, &[x]).unwrap();
        let tree = b.finalize(&mut ctx).unwrap();
        assert!(!b.is_open());
        assert_eq!(b.handle(), Some(tree));

        assert_eq!(b.extend(n, AxisDescriptor::dense(1, 2)), Err(LayoutError::AlreadyFinalized));
        assert_eq!(b.place(n, &[x]), Err(LayoutError::AlreadyFinalized));
        assert_eq!(b.finalize(&mut ctx), Err(LayoutError::AlreadyFinalized));
        assert!(ctx.tree(tree).is_ok());
    }

    #[test]
    fn rejections_keep_builder_open() {
        let mut ctx = LayoutContext::new();
        let x = ctx.field::<u32>("x").unwrap();
        let y = ctx.field::<u32>("y").unwrap();
        let mut b = LayoutBuilder::new();
        let root = b.root();

        assert!(matches!(b.extend(root, AxisDescriptor::dense(0, 0)), Err(LayoutError::InvalidShape(_))));
        assert!(b.is_open());
        // nothing valid was staged, so there is nothing to commit yet
        assert!(matches!(b.finalize(&mut ctx), Err(LayoutError::InvalidShape(_))));
        assert!(b.is_open());

        let n = b.extend(root, AxisDescriptor::dense(0, 3)).unwrap();
        b.place(n, &[x]).unwrap();
        assert_eq!(b.place(root, &[y]), Err(LayoutError::MixedNodeKind { node: root }));
        assert_eq!(b.extend(n, AxisDescriptor::dense(1, 2)), Err(LayoutError::MixedNodeKind { node: n }));
        assert_eq!(b.place(n, &[x]), Err(LayoutError::FieldAlreadyPlaced { field: x }));
        assert_eq!(b.place(n, &[y, y]), Err(LayoutError::FieldAlreadyPlaced { field: y }));
        assert!(matches!(b.place(n, &[]), Err(LayoutError::InvalidShape(_))));

        assert!(b.finalize(&mut ctx).is_ok());
    }

    #[test]
    fn repeated_place_extends_group() {
        let mut ctx = LayoutContext::new();
        let x = ctx.field::<u32>("x").unwrap();
        let y = ctx.field::<u16>("y").unwrap();
        let mut b = LayoutBuilder::new();
        let n = b.extend(b.root(), AxisDescriptor::dense(0, 5)).unwrap();
        let gx = b.place(n, &[x]).unwrap();
        let gy = b.place(n, &[y]).unwrap();
        assert_eq!(gx.node(), gy.node());
        assert_eq!(gy.fields(), &[y]);
        let tree = b.finalize(&mut ctx).unwrap();
        assert_eq!(ctx.tree(tree).unwrap().total_size(), 5 * 6);
        assert_eq!(ctx.offset(y, [2usize]).unwrap(), 2 * 6 + 4);
    }

    #[test]
    fn failed_allocation_is_atomic() {
        let mut ctx = LayoutContext::with_allocator(BoundedAllocator::new(HeapAllocator::new(), 64));
        let x = ctx.field::<f64>("x").unwrap();
        let mut b = LayoutBuilder::new();
        let n = b.extend(b.root(), AxisDescriptor::dense(0, 16)).unwrap();
        b.place(n, &[x]).unwrap();

        assert_eq!(b.finalize(&mut ctx), Err(LayoutError::AllocationFailed { requested: 128 }));
        assert!(b.is_open());
        assert_eq!(ctx.live_trees(), 0);
        assert_eq!(ctx.tree_handle_for(x), Err(LayoutError::UnknownField));

        ctx.allocator_mut().set_budget(128);
        let tree = b.finalize(&mut ctx).unwrap();
        assert_eq!(ctx.tree_handle_for(x), Ok(tree));
    }
}
