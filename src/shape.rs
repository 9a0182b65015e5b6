use std::fmt;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{LayoutError, Result};

/// Logical dimension of a field, `0` is `i`, `1` is `j` and so on
pub type AxisId = usize;

/// The shape contributed by one level of a layout tree: which logical axes the block spans,
/// and how far along each. Axes listed later vary faster inside the block (row-major within the level).
///
/// Construction does not validate, so that a descriptor can be built up freely;
/// `LayoutBuilder::extend` and `LayoutBuilder::finalize` reject malformed ones.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AxisDescriptor {
    axes: SmallVec<[AxisId; 4]>,
    extents: SmallVec<[usize; 4]>,
}

impl AxisDescriptor {
    pub fn new(axes: &[AxisId], extents: &[usize]) -> Self {
        AxisDescriptor { axes: axes.into(), extents: extents.into() }
    }

    /// single axis block, `dense(i, 3)`
    pub fn dense(axis: AxisId, extent: usize) -> Self {
        Self::new(&[axis], &[extent])
    }

    /// several axes packed into one level, `dense(ij, (3, 4))`
    pub fn packed<const N: usize>(axes: [AxisId; N], extents: [usize; N]) -> Self {
        Self::new(&axes, &extents)
    }

    pub fn axes(&self) -> &[AxisId] {
        &self.axes
    }

    pub fn extents(&self) -> &[usize] {
        &self.extents
    }

    pub fn rank(&self) -> usize {
        self.axes.len()
    }

    /// number of cells in this level, the product of its extents
    pub fn level_size(&self) -> usize {
        self.extents.iter().product()
    }

    /// extent of `axis` at this level, if the level spans it
    pub fn extent_of(&self, axis: AxisId) -> Option<usize> {
        self.axes.iter().position(|&a| a == axis).map(|p| self.extents[p])
    }

    pub fn is_pow2(&self) -> bool {
        self.extents.iter().all(|e| e.is_power_of_two())
    }

    pub fn validate(&self) -> Result<()> {
        if self.axes.is_empty() {
            return Err(LayoutError::shape("axis descriptor spans no axes"));
        }
        if self.axes.len() != self.extents.len() {
            return Err(LayoutError::shape(format!(
                "{} axes but {} extents",
                self.axes.len(),
                self.extents.len()
            )));
        }
        if self.axes.iter().unique().count() != self.axes.len() {
            return Err(LayoutError::shape(format!("repeated axis in {}", self)));
        }
        if let Some(p) = self.extents.iter().position(|&e| e == 0) {
            return Err(LayoutError::shape(format!("zero extent on axis {}", self.axes[p])));
        }
        if self.extents.iter().try_fold(1usize, |acc, &e| acc.checked_mul(e)).is_none() {
            return Err(LayoutError::shape(format!("level size of {} overflows", self)));
        }
        Ok(())
    }
}

impl fmt::Display for AxisDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "dense({}, ({}))",
            self.axes.iter().map(|a| axis_name(*a)).join(""),
            self.extents.iter().join(", ")
        )
    }
}

fn axis_name(axis: AxisId) -> String {
    const NAMES: &[u8] = b"ijklmn";
    match NAMES.get(axis) {
        Some(c) => (*c as char).to_string(),
        None => format!("a{}", axis),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn well_formed() {
        let d = AxisDescriptor::packed([0, 1], [3, 4]);
        assert!(d.validate().is_ok());
        assert_eq!(d.level_size(), 12);
        assert_eq!(d.extent_of(1), Some(4));
        assert_eq!(d.extent_of(2), None);
        assert_eq!(d.to_string(), "dense(ij, (3, 4))");
    }

    #[test]
    fn malformed() {
        let zero = AxisDescriptor::dense(0, 0);
        assert!(matches!(zero.validate(), Err(LayoutError::InvalidShape(_))));

        let repeated = AxisDescriptor::packed([1, 1], [2, 2]);
        assert!(matches!(repeated.validate(), Err(LayoutError::InvalidShape(_))));

        let ragged = AxisDescriptor::new(&[0, 1], &[2]);
        assert!(matches!(ragged.validate(), Err(LayoutError::InvalidShape(_))));

        let empty = AxisDescriptor::new(&[], &[]);
        assert!(matches!(empty.validate(), Err(LayoutError::InvalidShape(_))));

        let huge = AxisDescriptor::packed([0, 1], [usize::MAX, 2]);
        assert!(matches!(huge.validate(), Err(LayoutError::InvalidShape(_))));
    }
}
