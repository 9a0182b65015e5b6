//! Address resolution for one field slot.
//!
//! Every level on the slot's root-to-leaf path owns one mixed-radix digit of each axis it spans,
//! the deepest level holding the least significant digit. Unrolling the nested-stride flattening
//! `offset = offset * level_size + sub_offset` over the whole path leaves a flat sum
//!
//! ```text
//! byte = base + sum over digits of ((index[axis] / divisor) % extent) * stride
//! ```
//!
//! where `stride` already folds in the byte size of one cell of that level. The sum is derived once
//! at commit time; when every extent on the path is a power of two the divide/modulo become shift/mask.
use smallvec::SmallVec;

use crate::error::{LayoutError, Result};
use crate::node::{Arena, NodeKind};
use crate::shape::AxisId;

pub trait OffsetFn {
    /// byte offset of an in-bounds index, no checks
    fn offset(&self, index: &[usize]) -> usize;
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct Digit {
    /// position of the axis in the field's index tuple
    axis: usize,
    divisor: usize,
    extent: usize,
    stride: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MixedRadix {
    digits: SmallVec<[Digit; 8]>,
    base: usize,
}

impl OffsetFn for MixedRadix {
    #[inline]
    fn offset(&self, index: &[usize]) -> usize {
        self.digits.iter().fold(self.base, |acc, d| {
            acc + (index[d.axis] / d.divisor) % d.extent * d.stride
        })
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Scale {
    Shift(u32),
    Mul(usize),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
struct ShiftDigit {
    axis: usize,
    shift: u32,
    mask: usize,
    scale: Scale,
}

/// Power-of-two specialization of `MixedRadix`. Strides that are not powers of two
/// (odd sized interleaved groups) keep a multiply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShiftMask {
    digits: SmallVec<[ShiftDigit; 8]>,
    base: usize,
}

impl ShiftMask {
    fn from_generic(generic: &MixedRadix) -> Option<Self> {
        let mut digits = SmallVec::new();
        for d in &generic.digits {
            if !d.extent.is_power_of_two() || !d.divisor.is_power_of_two() {
                return None;
            }
            let scale = if d.stride.is_power_of_two() {
                Scale::Shift(d.stride.trailing_zeros())
            } else {
                Scale::Mul(d.stride)
            };
            digits.push(ShiftDigit { axis: d.axis, shift: d.divisor.trailing_zeros(), mask: d.extent - 1, scale });
        }
        Some(ShiftMask { digits, base: generic.base })
    }
}

impl OffsetFn for ShiftMask {
    #[inline]
    fn offset(&self, index: &[usize]) -> usize {
        self.digits.iter().fold(self.base, |acc, d| {
            let digit = (index[d.axis] >> d.shift) & d.mask;
            acc + match d.scale {
                Scale::Shift(s) => digit << s,
                Scale::Mul(m) => digit * m,
            }
        })
    }
}

/// Cached index -> byte offset function of one field slot
#[derive(Clone, Debug)]
pub struct Resolver {
    axes: SmallVec<[AxisId; 4]>,
    shape: SmallVec<[usize; 4]>,
    generic: MixedRadix,
    fast: Option<ShiftMask>,
}

impl Resolver {
    /// Derives the resolver of `slot`. `cell_bytes` and `bases` are the per node cell sizes and block
    /// offsets from `Arena::cell_bytes` / `Arena::child_bases`.
    pub fn derive(arena: &Arena, slot: usize, cell_bytes: &[usize], bases: &[usize], fast_path: bool) -> Result<Resolver> {
        let leaf = arena.slots()[slot].node;
        let path = arena.path(leaf);

        let mut base: usize = match arena.get(leaf)?.kind() {
            NodeKind::Terminal(group) => group
                .iter()
                .take_while(|&&s| s != slot)
                .map(|&s| arena.slots()[s].field.element_size())
                .sum(),
            _ => return Err(LayoutError::shape("slot is not held by a terminal node")),
        };

        let levels = path
            .iter()
            .map(|&id| arena.get(id).map(|n| (id, n.shape())))
            .collect::<Result<SmallVec<[_; 8]>>>()?;

        let mut axes: SmallVec<[AxisId; 4]> = levels
            .iter()
            .filter_map(|(_, s)| *s)
            .flat_map(|s| s.axes().iter().copied())
            .collect();
        axes.sort_unstable();
        axes.dedup();

        let shape = axes
            .iter()
            .map(|&a| levels.iter().filter_map(|(_, s)| s.and_then(|s| s.extent_of(a))).product::<usize>())
            .collect();

        let mut digits = SmallVec::new();
        for (depth, (id, level)) in levels.iter().enumerate() {
            base += bases[id.index()];
            let level = match level {
                Some(level) => level,
                None => continue,
            };
            let cell = cell_bytes[id.index()];
            for (p, (&axis, &extent)) in level.axes().iter().zip(level.extents()).enumerate() {
                if extent == 1 {
                    continue;
                }
                let divisor = levels[depth + 1..]
                    .iter()
                    .filter_map(|(_, s)| s.and_then(|s| s.extent_of(axis)))
                    .product::<usize>();
                let within: usize = level.extents()[p + 1..].iter().product();
                digits.push(Digit {
                    axis: axes.iter().position(|&a| a == axis).unwrap_or_default(),
                    divisor,
                    extent,
                    stride: within * cell,
                });
            }
        }

        let generic = MixedRadix { digits, base };
        let all_pow2 = levels.iter().all(|(_, s)| s.map_or(true, |s| s.is_pow2()));
        let fast = if fast_path && all_pow2 { ShiftMask::from_generic(&generic) } else { None };
        Ok(Resolver { axes, shape, generic, fast })
    }

    /// logical axis ids in index-tuple order
    pub fn axes(&self) -> &[AxisId] {
        &self.axes
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// byte offset of element zero
    pub fn base(&self) -> usize {
        self.generic.base
    }

    pub fn is_pow2(&self) -> bool {
        self.fast.is_some()
    }

    pub fn check(&self, index: &[usize]) -> Result<()> {
        if index.len() != self.rank() {
            return Err(LayoutError::RankMismatch { expected: self.rank(), actual: index.len() });
        }
        for (axis, (&i, &extent)) in index.iter().zip(self.shape.iter()).enumerate() {
            if i >= extent {
                return Err(LayoutError::IndexOutOfBounds { axis, index: i, extent });
            }
        }
        Ok(())
    }

    /// bounds checked byte offset inside the tree's region
    pub fn offset(&self, index: &[usize]) -> Result<usize> {
        self.check(index)?;
        Ok(self.offset_unchecked(index))
    }

    /// Offset without rank or bounds checks. Out of range indices give a meaningless offset
    /// and a short index panics.
    #[inline]
    pub fn offset_unchecked(&self, index: &[usize]) -> usize {
        match &self.fast {
            Some(fast) => fast.offset(index),
            None => self.generic.offset(index),
        }
    }

    /// the kernel picked at commit
    pub fn kernel(&self) -> &dyn OffsetFn {
        match &self.fast {
            Some(fast) => fast as &dyn OffsetFn,
            None => &self.generic,
        }
    }

    /// always the mixed-radix kernel, whatever was selected at commit
    #[inline]
    pub fn offset_generic(&self, index: &[usize]) -> usize {
        self.generic.offset(index)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::field::Field;
    use crate::shape::AxisDescriptor;
    use itertools::Itertools;

    fn single(levels: &[AxisDescriptor], fields: &[usize], fast_path: bool) -> Vec<Resolver> {
        let mut arena = Arena::new();
        let mut node = arena.root();
        for level in levels {
            node = arena.push_child(node, level.clone()).unwrap();
        }
        let fields = fields.iter().map(|&s| Field::detached(s)).collect::<Vec<_>>();
        let slots = arena.push_slots(node, &fields).unwrap();
        arena.validate().unwrap();
        let cells = arena.cell_bytes().unwrap();
        let bases = arena.child_bases(&cells);
        slots.map(|s| Resolver::derive(&arena, s, &cells, &bases, fast_path).unwrap()).collect()
    }

    fn all_indices(shape: &[usize]) -> Vec<Vec<usize>> {
        shape.iter().map(|&e| 0..e).multi_cartesian_product().collect()
    }

    #[test]
    fn packed_level_is_row_major() {
        let r = &single(&[AxisDescriptor::packed([0, 1], [3, 4])], &[4], true)[0];
        assert_eq!(r.shape(), &[3, 4]);
        for i in 0..3usize {
            for j in 0..4usize {
                assert_eq!(r.offset(&[i, j]).unwrap(), (i * 4 + j) * 4);
            }
        }
    }

    #[test]
    fn axis_order_inside_level() {
        // j listed first, so i varies fastest
        let r = &single(&[AxisDescriptor::packed([1, 0], [4, 3])], &[1], true)[0];
        assert_eq!(r.axes(), &[0, 1]);
        assert_eq!(r.shape(), &[3, 4]);
        assert_eq!(r.offset(&[1, 0]).unwrap(), 1);
        assert_eq!(r.offset(&[0, 1]).unwrap(), 3);
    }

    #[test]
    fn interleaved_group() {
        let rs = single(&[AxisDescriptor::dense(0, 3)], &[4, 2, 8], false);
        for i in 0..3usize {
            assert_eq!(rs[0].offset(&[i]).unwrap(), i * 14);
            assert_eq!(rs[1].offset(&[i]).unwrap(), i * 14 + 4);
            assert_eq!(rs[2].offset(&[i]).unwrap(), i * 14 + 6);
        }
    }

    #[test]
    fn kernels_agree() {
        let cases = vec![
            vec![AxisDescriptor::packed([0, 1], [2, 4]), AxisDescriptor::dense(1, 2), AxisDescriptor::packed([1, 0], [4, 8])],
            vec![AxisDescriptor::dense(2, 4), AxisDescriptor::packed([0, 2], [2, 2]), AxisDescriptor::dense(0, 4)],
        ];
        for levels in cases {
            for sizes in [vec![4], vec![4, 8], vec![4, 4, 4]] {
                for r in single(&levels, &sizes, true) {
                    assert!(r.is_pow2());
                    for idx in all_indices(r.shape()) {
                        assert_eq!(r.offset_unchecked(&idx), r.offset_generic(&idx), "{:?}", idx);
                    }
                }
            }
        }
    }

    #[test]
    fn fast_path_selection() {
        let r = &single(&[AxisDescriptor::dense(0, 3)], &[4], true)[0];
        assert!(!r.is_pow2());
        let r = &single(&[AxisDescriptor::dense(0, 4)], &[4], false)[0];
        assert!(!r.is_pow2());
        let r = &single(&[AxisDescriptor::dense(0, 4)], &[4], true)[0];
        assert!(r.is_pow2());
    }

    #[test]
    fn checks() {
        let r = &single(&[AxisDescriptor::dense(0, 3), AxisDescriptor::dense(1, 2)], &[4], true)[0];
        assert_eq!(r.offset(&[0]), Err(LayoutError::RankMismatch { expected: 2, actual: 1 }));
        assert_eq!(r.offset(&[1, 2]), Err(LayoutError::IndexOutOfBounds { axis: 1, index: 2, extent: 2 }));
        assert_eq!(r.offset(&[2, 1]).unwrap(), (2 * 2 + 1) * 4);
    }
}
