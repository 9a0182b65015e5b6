use crate::field::Field;
use crate::node::NodeId;

pub type Result<T> = std::result::Result<T, LayoutError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("invalid shape: {0}")]
    InvalidShape(String),

    #[error("node {node:?} cannot hold both blocks and field slots")]
    MixedNodeKind { node: NodeId },

    #[error("builder was already finalized")]
    AlreadyFinalized,

    #[error("could not allocate a backing region of {requested} bytes")]
    AllocationFailed { requested: usize },

    /// The tree behind a handle was destroyed, or never belonged to this context.
    #[error("use of a layout tree after it was destroyed")]
    UseAfterDestroy,

    #[error("node {node:?} does not belong to this builder")]
    UnknownNode { node: NodeId },

    #[error("field is not known to this context or has not been committed")]
    UnknownField,

    #[error("{field} is already placed")]
    FieldAlreadyPlaced { field: Field },

    #[error("index has rank {actual}, field has rank {expected}")]
    RankMismatch { expected: usize, actual: usize },

    #[error("index {index} out of range for axis {axis} of extent {extent}")]
    IndexOutOfBounds { axis: usize, index: usize, extent: usize },

    #[error("element is {actual} bytes, field slot holds {expected} bytes")]
    ElementSizeMismatch { expected: usize, actual: usize },

    /// Trees owned by the default root are only released at teardown.
    #[error("tree is managed by the default root and cannot be destroyed explicitly")]
    ManagedTree,
}

impl LayoutError {
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        LayoutError::InvalidShape(msg.into())
    }
}
