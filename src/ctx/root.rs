use std::sync::{Mutex, OnceLock};

use super::allocator::{HeapAllocator, RegionAllocator};
use super::LayoutContext;
use crate::builder::LayoutBuilder;
use crate::error::Result;
use crate::field::Field;
use crate::node::NodeId;
use crate::shape::AxisDescriptor;
use crate::tree::TreeHandle;

/// One declaration against the default root: a single chain of blocks ending in a `place`,
/// which commits it as a managed tree of its own. Managed trees are never destroyed explicitly,
/// they go away with `LayoutContext::teardown` or the context itself.
pub struct RootBuilder<'a, A: RegionAllocator> {
    ctx: &'a mut LayoutContext<A>,
    builder: LayoutBuilder,
    node: NodeId,
}

impl<'a, A: RegionAllocator> RootBuilder<'a, A> {
    pub fn extend(mut self, shape: AxisDescriptor) -> Result<Self> {
        self.node = self.builder.extend(self.node, shape)?;
        Ok(self)
    }

    /// `dense(axis, extent)` shorthand for `extend`
    pub fn dense(self, axis: usize, extent: usize) -> Result<Self> {
        self.extend(AxisDescriptor::dense(axis, extent))
    }

    pub fn place(mut self, fields: &[Field]) -> Result<TreeHandle> {
        self.builder.place(self.node, fields)?;
        self.builder.commit(self.ctx, true)
    }
}

impl<A: RegionAllocator> LayoutContext<A> {
    /// Starts a declaration against the default root
    pub fn root(&mut self) -> RootBuilder<'_, A> {
        let builder = LayoutBuilder::new();
        let node = builder.root();
        RootBuilder { ctx: self, builder, node }
    }

    /// handles of the trees the default root committed so far and that are still alive
    pub fn managed_trees(&self) -> Vec<TreeHandle> {
        self.trees
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.tree.as_ref().map_or(false, |t| t.is_managed()))
            .map(|(index, slot)| TreeHandle { ctx: self.id, index: index as u32, generation: slot.generation })
            .collect()
    }
}

static DEFAULT: OnceLock<Mutex<LayoutContext<HeapAllocator>>> = OnceLock::new();

/// Runs `f` against the process wide context, created on first use. Its trees live until the
/// process exits; code that wants isolation (tests, libraries) should own a `LayoutContext` instead.
pub fn with_default_context<R>(f: impl FnOnce(&mut LayoutContext<HeapAllocator>) -> R) -> R {
    let ctx = DEFAULT.get_or_init(|| Mutex::new(LayoutContext::new()));
    // a panic inside `f` can't leave the context half updated, every mutation commits atomically
    let mut guard = ctx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::error::LayoutError;

    #[test]
    fn declarations_become_managed_trees() {
        let mut ctx = LayoutContext::new();
        let x = ctx.field::<f32>("x").unwrap();
        let y = ctx.field::<f32>("y").unwrap();
        let tx = ctx.root().dense(0, 4).unwrap().dense(1, 4).unwrap().place(&[x]).unwrap();
        let ty = ctx.root().extend(AxisDescriptor::packed([0, 1], [4, 4])).unwrap().place(&[y]).unwrap();

        assert_ne!(tx, ty);
        assert_eq!(ctx.managed_trees(), vec![tx, ty]);
        assert_eq!(ctx.offset(x, (1usize, 2usize)).unwrap(), (4 + 2) * 4);
        assert_eq!(ctx.destroy(tx), Err(LayoutError::ManagedTree));
        assert_eq!(ctx.offset(x, (1usize, 2usize)).unwrap(), (4 + 2) * 4);

        assert!(matches!(ctx.root().dense(0, 0), Err(LayoutError::InvalidShape(_))));
        assert_eq!(ctx.root().dense(2, 2).unwrap().place(&[x]), Err(LayoutError::FieldAlreadyPlaced { field: x }));
        assert_eq!(ctx.live_trees(), 2);

        ctx.teardown();
        assert!(ctx.managed_trees().is_empty());
        assert_eq!(ctx.resolve(y, [0usize, 0]), Err(LayoutError::UseAfterDestroy));
    }

    #[test]
    fn builders_and_root_share_a_context() {
        let mut ctx = LayoutContext::new();
        let x = ctx.field::<u8>("x").unwrap();
        let y = ctx.field::<u8>("y").unwrap();
        ctx.root().dense(0, 8).unwrap().place(&[x]).unwrap();
        let mut b = LayoutBuilder::new();
        let n = b.extend(b.root(), AxisDescriptor::dense(0, 8)).unwrap();
        b.place(n, &[y]).unwrap();
        let ty = b.finalize(&mut ctx).unwrap();
        assert_eq!(ctx.managed_trees().len(), 1);
        ctx.destroy(ty).unwrap();
        assert_eq!(ctx.offset(x, [7usize]), Ok(7));
    }

    #[test]
    fn process_context_persists() {
        let (x, tree) = with_default_context(|ctx| {
            let x = ctx.field::<u64>("counter").unwrap();
            let tree = ctx.root().dense(0, 2).unwrap().place(&[x]).unwrap();
            ctx.write(x, [1usize], 41u64).unwrap();
            (x, tree)
        });
        let read = with_default_context(|ctx| {
            assert_eq!(ctx.tree_handle_for(x), Ok(tree));
            ctx.read::<u64, _>(x, [1usize])
        });
        assert_eq!(read, Ok(41));
    }
}
