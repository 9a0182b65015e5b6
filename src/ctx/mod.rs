pub mod allocator;
pub mod root;

use std::mem;
use std::ptr::NonNull;

use bytemuck::Pod;
use itertools::Itertools;
use ndarray::{Dimension, IntoDimension};
use tracing::{debug, error};

use crate::config::LayoutConfig;
use crate::error::{LayoutError, Result};
use crate::field::{Field, FieldInfo};
use crate::node::{fresh_owner, Arena};
use crate::resolver::Resolver;
use crate::tree::{LayoutTree, TreeHandle, TreePlan};

use allocator::{BoundedAllocator, HeapAllocator, RegionAllocator};

pub use root::{with_default_context, RootBuilder};

struct TreeSlot {
    generation: u32,
    tree: Option<LayoutTree>,
}

#[derive(Copy, Clone, Debug)]
struct Binding {
    tree: TreeHandle,
    slot: usize,
}

struct FieldEntry {
    name: String,
    element_size: usize,
    binding: Option<Binding>,
}

/// Owns every committed tree, the field table and the allocator regions come from.
///
/// Trees live in a slab; destroying one releases its region and bumps the slot's generation,
/// so every handle and field bound to it fails with `UseAfterDestroy` from then on.
/// Resolving and reading take `&self` and may run from any number of threads, writing and
/// destroying take `&mut self`. Dropping the context destroys whatever is still alive.
pub struct LayoutContext<A: RegionAllocator = HeapAllocator> {
    id: u32,
    allocator: A,
    config: LayoutConfig,
    trees: Vec<TreeSlot>,
    free: Vec<u32>,
    fields: Vec<FieldEntry>,
}

impl LayoutContext<HeapAllocator> {
    pub fn new() -> Self {
        Self::with_allocator(HeapAllocator::new())
    }
}

impl Default for LayoutContext<HeapAllocator> {
    fn default() -> Self {
        Self::new()
    }
}

impl LayoutContext<BoundedAllocator<HeapAllocator>> {
    /// heap backed context honoring every knob in `config`
    pub fn from_config(config: LayoutConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let budget = config.max_region_bytes.unwrap_or(usize::MAX);
        let allocator = BoundedAllocator::new(HeapAllocator::from_config(&config), budget);
        Ok(Self::with_config(allocator, config))
    }
}

impl<A: RegionAllocator> LayoutContext<A> {
    pub fn with_allocator(allocator: A) -> Self {
        Self::with_config(allocator, LayoutConfig::default())
    }

    pub fn with_config(allocator: A, config: LayoutConfig) -> Self {
        LayoutContext { id: fresh_owner(), allocator, config, trees: Vec::new(), free: Vec::new(), fields: Vec::new() }
    }

    pub fn config(&self) -> &LayoutConfig {
        &self.config
    }

    pub fn allocator(&self) -> &A {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut A {
        &mut self.allocator
    }

    /// Declares a field of `T` elements. It gets its storage once a builder places it and commits.
    ///
    /// Declarations are never reclaimed: a field is placed once, and after its tree is destroyed the
    /// entry stays behind as a dead binding. Declare fields per layout, not per element or per frame.
    pub fn field<T>(&mut self, name: &str) -> Result<Field> {
        self.field_with_size(name, mem::size_of::<T>())
    }

    pub fn field_with_size(&mut self, name: &str, element_size: usize) -> Result<Field> {
        if element_size == 0 {
            return Err(LayoutError::shape(format!("field `{}` has zero sized elements", name)));
        }
        let id = self.fields.len() as u32;
        self.fields.push(FieldEntry { name: name.to_string(), element_size, binding: None });
        Ok(Field::new(self.id, id, element_size))
    }

    fn entry(&self, field: Field) -> Result<&FieldEntry> {
        if field.ctx() != self.id {
            return Err(LayoutError::UnknownField);
        }
        self.fields.get(field.id()).ok_or(LayoutError::UnknownField)
    }

    fn binding(&self, field: Field) -> Result<Binding> {
        self.entry(field)?.binding.ok_or(LayoutError::UnknownField)
    }

    fn live(&self, handle: TreeHandle) -> Result<&LayoutTree> {
        let slot = if handle.ctx == self.id { self.trees.get(handle.index as usize) } else { None };
        match slot {
            Some(TreeSlot { generation, tree: Some(tree) }) if *generation == handle.generation => Ok(tree),
            _ => {
                error!(?handle, "layout tree used after destroy");
                Err(LayoutError::UseAfterDestroy)
            }
        }
    }

    /// Validates the staged graph, derives every resolver and requests the region. Only once all of
    /// that succeeded is the arena taken out of `staged`, so a failure leaves the builder untouched.
    pub(crate) fn commit(&mut self, staged: &mut Option<Arena>, managed: bool) -> Result<TreeHandle> {
        let arena = staged.as_ref().ok_or(LayoutError::AlreadyFinalized)?;
        for slot in arena.slots() {
            if self.entry(slot.field)?.binding.is_some() {
                return Err(LayoutError::FieldAlreadyPlaced { field: slot.field });
            }
        }
        let plan = TreePlan::new(arena, self.config.pow2_fast_path)?;
        let total_size = plan.total_size;
        let region = self.allocator.allocate(total_size)?;
        let Some(arena) = staged.take() else {
            self.allocator.release(region);
            return Err(LayoutError::AlreadyFinalized);
        };

        let (index, generation) = match self.free.pop() {
            Some(index) => (index, self.trees[index as usize].generation),
            None => {
                self.trees.push(TreeSlot { generation: 0, tree: None });
                (self.trees.len() as u32 - 1, 0)
            }
        };
        let handle = TreeHandle { ctx: self.id, index, generation };
        for (slot, s) in arena.slots().iter().enumerate() {
            self.fields[s.field.id()].binding = Some(Binding { tree: handle, slot });
        }
        let tree = LayoutTree::new(arena, plan, region, managed);
        debug!(
            index,
            generation,
            total_size,
            slots = tree.slot_count(),
            pow2 = (0..tree.slot_count()).filter(|&s| tree.resolver(s).is_pow2()).count(),
            managed,
            "committed layout tree"
        );
        self.trees[index as usize].tree = Some(tree);
        Ok(handle)
    }

    pub fn tree(&self, handle: TreeHandle) -> Result<&LayoutTree> {
        self.live(handle)
    }

    /// Releases the tree's region. No reader of the tree may be in flight, which `&mut self` ensures.
    pub fn destroy(&mut self, handle: TreeHandle) -> Result<()> {
        if self.live(handle)?.is_managed() {
            return Err(LayoutError::ManagedTree);
        }
        self.release(handle.index);
        Ok(())
    }

    fn release(&mut self, index: u32) {
        let slot = &mut self.trees[index as usize];
        if let Some(tree) = slot.tree.take() {
            slot.generation = slot.generation.wrapping_add(1);
            debug!(index, size = tree.total_size(), "destroyed layout tree");
            self.allocator.release(tree.into_region());
            self.free.push(index);
        }
    }

    /// Destroys every live tree, default-root ones included. Fields bound to them stay dead.
    pub fn teardown(&mut self) {
        for index in 0..self.trees.len() as u32 {
            self.release(index);
        }
    }

    pub fn live_trees(&self) -> usize {
        self.trees.iter().filter(|t| t.tree.is_some()).count()
    }

    pub fn tree_handle_for(&self, field: Field) -> Result<TreeHandle> {
        let binding = self.binding(field)?;
        self.live(binding.tree)?;
        Ok(binding.tree)
    }

    /// The cached resolver of a committed field, for callers that resolve in a hot loop. It stays
    /// valid only as long as the field's tree is alive.
    pub fn resolver(&self, field: Field) -> Result<&Resolver> {
        Ok(self.bound(field)?.1)
    }

    fn bound(&self, field: Field) -> Result<(&LayoutTree, &Resolver)> {
        let binding = self.binding(field)?;
        let tree = self.live(binding.tree)?;
        Ok((tree, tree.resolver(binding.slot)))
    }

    /// byte offset of an element inside its tree's region
    pub fn offset<I: IntoDimension>(&self, field: Field, index: I) -> Result<usize> {
        let resolver = self.resolver(field)?;
        resolver.offset(index.into_dimension().slice())
    }

    /// address of an element
    pub fn resolve<I: IntoDimension>(&self, field: Field, index: I) -> Result<NonNull<u8>> {
        let (tree, resolver) = self.bound(field)?;
        let offset = resolver.offset(index.into_dimension().slice())?;
        // in-bounds indices resolve inside the region, see `Resolver::derive`
        debug_assert!(tree.region().within(offset, field.element_size()));
        unsafe { Ok(NonNull::new_unchecked(tree.region().base().as_ptr().add(offset))) }
    }

    fn check_size<T>(&self, field: Field) -> Result<()> {
        let expected = self.entry(field)?.element_size;
        let actual = mem::size_of::<T>();
        if expected != actual {
            return Err(LayoutError::ElementSizeMismatch { expected, actual });
        }
        Ok(())
    }

    /// Reads one element as `T`, which must have the field's element size.
    ///
    /// `T` is `Pod` because the slot may hold bytes written as any other type of that size (or the
    /// zeroes of a fresh region), so only types valid for every bit pattern can be read back:
    ///
    /// ```compile_fail
    /// # use field_layout::LayoutContext;
    /// let mut ctx = LayoutContext::new();
    /// let flag = ctx.field::<bool>("flag").unwrap();
    /// let flag: bool = ctx.read(flag, [0usize]).unwrap();
    /// ```
    pub fn read<T: Pod, I: IntoDimension>(&self, field: Field, index: I) -> Result<T> {
        self.check_size::<T>(field)?;
        let ptr = self.resolve(field, index)?;
        // interleaved groups make no alignment promise
        unsafe { Ok(ptr.as_ptr().cast::<T>().read_unaligned()) }
    }

    pub fn write<T: Pod, I: IntoDimension>(&mut self, field: Field, index: I, value: T) -> Result<()> {
        self.check_size::<T>(field)?;
        let ptr = self.resolve(field, index)?;
        unsafe { ptr.as_ptr().cast::<T>().write_unaligned(value) }
        Ok(())
    }

    /// logical extent along each of the field's axes
    pub fn shape(&self, field: Field) -> Result<Vec<usize>> {
        let resolver = self.resolver(field)?;
        Ok(resolver.shape().to_vec())
    }

    /// every index of the field, last axis fastest. A field placed on the root has the single index `[]`.
    pub fn indices(&self, field: Field) -> Result<impl Iterator<Item = Vec<usize>>> {
        let shape = self.shape(field)?;
        // the product of no ranges is empty, not the one empty tuple
        let scalar = shape.is_empty().then(Vec::new);
        Ok(shape.into_iter().map(|e| 0..e).multi_cartesian_product().chain(scalar))
    }

    pub fn field_info(&self, field: Field) -> Result<FieldInfo> {
        let entry = self.entry(field)?;
        let binding = self.binding(field)?;
        let resolver = self.resolver(field)?;
        Ok(FieldInfo {
            name: entry.name.clone(),
            element_size: entry.element_size,
            tree: binding.tree,
            shape: resolver.shape().to_vec(),
            base_offset: resolver.base(),
        })
    }
}

impl<A: RegionAllocator> Drop for LayoutContext<A> {
    fn drop(&mut self) {
        self.teardown();
    }
}
