//! Hierarchical field layouts.
//!
//! A field is a logical multi-dimensional array; how its elements sit in memory is described
//! separately, as a tree of dense blocks. Each block level spans one or more logical axes, levels
//! may tile the same axis again, fields placed together are interleaved (AoS) and fields in
//! sibling blocks or separate trees are segregated (SoA). Whatever the tree, an element is reached
//! the same way:
//!
//! ```
//! use field_layout::{AxisDescriptor, LayoutBuilder, LayoutContext};
//!
//! let mut ctx = LayoutContext::new();
//! let x = ctx.field::<f32>("x")?;
//! let y = ctx.field::<f32>("y")?;
//!
//! let mut b = LayoutBuilder::new();
//! let cells = b.extend(b.root(), AxisDescriptor::dense(0, 3))?;
//! b.place(cells, &[x, y])?;
//! let tree = b.finalize(&mut ctx)?;
//!
//! assert_eq!(ctx.offset(y, [2usize])?, 2 * 8 + 4);
//! ctx.write(x, [1usize], 0.5f32)?;
//! assert_eq!(ctx.read::<f32, _>(x, [1usize])?, 0.5);
//! ctx.destroy(tree)?;
//! # Ok::<(), field_layout::LayoutError>(())
//! ```

pub mod builder;
pub mod config;
pub mod ctx;
pub mod error;
pub mod field;
pub mod node;
pub mod resolver;
pub mod shape;
pub mod tree;

pub use builder::{LayoutBuilder, SlotGroup};
pub use config::{Config, LayoutConfig};
pub use ctx::allocator::{BoundedAllocator, ByteRange, HeapAllocator, RegionAllocator};
pub use ctx::{with_default_context, LayoutContext, RootBuilder};
pub use error::{LayoutError, Result};
pub use field::{Field, FieldInfo};
pub use node::NodeId;
pub use resolver::{MixedRadix, OffsetFn, Resolver, ShiftMask};
pub use shape::{AxisDescriptor, AxisId};
pub use tree::{LayoutTree, TreeHandle};
