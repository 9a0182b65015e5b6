use std::ops::Range;
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::trace;

use crate::error::{LayoutError, Result};
use crate::field::Field;
use crate::shape::AxisDescriptor;

static NEXT_OWNER: AtomicU32 = AtomicU32::new(1);

/// unique tag for builders and contexts, so handles from one can't be used with another
pub(crate) fn fresh_owner() -> u32 {
    NEXT_OWNER.fetch_add(1, Ordering::Relaxed)
}

/// Index of a block node inside the arena of the builder (and later the tree) that created it
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    owner: u32,
    index: u32,
}

impl NodeId {
    pub fn index(&self) -> usize {
        self.index as usize
    }
}

/// A node either nests further blocks, or holds the field slots of one interleaved group, never both.
/// A freshly extended node is `Structural` with no children until it gets its first child or slot.
#[derive(Clone, Debug)]
pub enum NodeKind {
    Structural(Vec<NodeId>),
    Terminal(Vec<usize>),
}

#[derive(Clone, Debug)]
pub struct BlockNode {
    /// None only for the root
    shape: Option<AxisDescriptor>,
    parent: Option<NodeId>,
    kind: NodeKind,
}

impl BlockNode {
    pub fn shape(&self) -> Option<&AxisDescriptor> {
        self.shape.as_ref()
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    /// cells in this level, the root counts as a single cell
    pub fn level_size(&self) -> usize {
        self.shape.as_ref().map_or(1, |s| s.level_size())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.kind, NodeKind::Terminal(_))
    }
}

/// a placed field, `node` is the terminal node it lives in
#[derive(Copy, Clone, Debug)]
pub struct Slot {
    pub field: Field,
    pub node: NodeId,
}

/// Append-only store of nodes and slots. Children are always pushed after their parent,
/// so walking the nodes backwards visits every child before its parent.
#[derive(Clone, Debug)]
pub struct Arena {
    owner: u32,
    nodes: Vec<BlockNode>,
    slots: Vec<Slot>,
}

impl Arena {
    pub fn new() -> Self {
        let root = BlockNode { shape: None, parent: None, kind: NodeKind::Structural(Vec::new()) };
        Arena { owner: fresh_owner(), nodes: vec![root], slots: Vec::new() }
    }

    pub fn root(&self) -> NodeId {
        NodeId { owner: self.owner, index: 0 }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    pub fn get(&self, id: NodeId) -> Result<&BlockNode> {
        if id.owner != self.owner {
            return Err(LayoutError::UnknownNode { node: id });
        }
        self.nodes.get(id.index()).ok_or(LayoutError::UnknownNode { node: id })
    }

    pub fn push_child(&mut self, parent: NodeId, shape: AxisDescriptor) -> Result<NodeId> {
        let id = NodeId { owner: self.owner, index: self.nodes.len() as u32 };
        self.get(parent)?;
        match &mut self.nodes[parent.index()].kind {
            NodeKind::Structural(children) => children.push(id),
            NodeKind::Terminal(_) => return Err(LayoutError::MixedNodeKind { node: parent }),
        }
        trace!(parent = parent.index(), child = id.index(), %shape, "extend");
        self.nodes.push(BlockNode { shape: Some(shape), parent: Some(parent), kind: NodeKind::Structural(Vec::new()) });
        Ok(id)
    }

    /// appends the fields to the node's interleaved group, returns the range of new slot indices
    pub fn push_slots(&mut self, node: NodeId, fields: &[Field]) -> Result<Range<usize>> {
        let start = self.slots.len();
        let new = start..start + fields.len();
        self.get(node)?;
        let n = &mut self.nodes[node.index()];
        match &mut n.kind {
            NodeKind::Structural(children) if !children.is_empty() => {
                return Err(LayoutError::MixedNodeKind { node });
            }
            NodeKind::Structural(_) => {}
            NodeKind::Terminal(group) => group.extend(new.clone()),
        }
        if !n.is_terminal() {
            n.kind = NodeKind::Terminal(new.clone().collect());
        }
        self.slots.extend(fields.iter().map(|&field| Slot { field, node }));
        trace!(node = node.index(), slots = fields.len(), "place");
        Ok(new)
    }

    /// nodes from the root down to `node`, inclusive
    pub fn path(&self, node: NodeId) -> Vec<NodeId> {
        let mut path = vec![node];
        let mut cur = node;
        while let Some(parent) = self.nodes[cur.index()].parent {
            path.push(parent);
            cur = parent;
        }
        path.reverse();
        path
    }

    pub fn validate(&self) -> Result<()> {
        for (i, node) in self.nodes.iter().enumerate() {
            if let Some(shape) = &node.shape {
                shape.validate()?;
            }
            match &node.kind {
                NodeKind::Structural(children) if children.is_empty() => {
                    let what = if i == 0 { "layout has no blocks".to_string() } else { format!("node {} holds no fields", i) };
                    return Err(LayoutError::shape(what));
                }
                NodeKind::Terminal(group) if group.is_empty() => {
                    return Err(LayoutError::shape(format!("node {} has an empty slot group", i)));
                }
                NodeKind::Terminal(group) if group.iter().any(|&s| self.slots[s].field.element_size() == 0) => {
                    return Err(LayoutError::shape(format!("node {} holds a zero sized field", i)));
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Byte size of one cell of every node, folded bottom-up: a terminal cell is its interleaved group,
    /// a structural cell holds each child's whole block back to back
    pub fn cell_bytes(&self) -> Result<Vec<usize>> {
        let overflow = || LayoutError::shape("layout size overflows usize");
        let mut sizes = vec![0usize; self.nodes.len()];
        for i in (0..self.nodes.len()).rev() {
            sizes[i] = match &self.nodes[i].kind {
                NodeKind::Terminal(group) => group.iter().map(|&s| self.slots[s].field.element_size()).sum(),
                NodeKind::Structural(children) => {
                    let mut total = 0usize;
                    for c in children {
                        let block = self.nodes[c.index()].level_size().checked_mul(sizes[c.index()]).ok_or_else(overflow)?;
                        total = total.checked_add(block).ok_or_else(overflow)?;
                    }
                    total
                }
            };
        }
        Ok(sizes)
    }

    /// Byte offset of every node's block inside one cell of its parent, the root sits at 0
    pub fn child_bases(&self, cell_bytes: &[usize]) -> Vec<usize> {
        let mut bases = vec![0usize; self.nodes.len()];
        for node in &self.nodes {
            if let NodeKind::Structural(children) = &node.kind {
                let mut acc = 0;
                for c in children {
                    bases[c.index()] = acc;
                    acc += self.nodes[c.index()].level_size() * cell_bytes[c.index()];
                }
            }
        }
        bases
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::field::Field;

    #[test]
    fn kinds_do_not_mix() {
        let mut arena = Arena::new();
        let root = arena.root();
        let a = arena.push_child(root, AxisDescriptor::dense(0, 4)).unwrap();
        arena.push_slots(a, &[Field::detached(4)]).unwrap();

        assert!(matches!(arena.push_child(a, AxisDescriptor::dense(1, 2)), Err(LayoutError::MixedNodeKind { .. })));
        assert!(matches!(arena.push_slots(root, &[Field::detached(4)]), Err(LayoutError::MixedNodeKind { .. })));
    }

    #[test]
    fn foreign_node() {
        let mut a = Arena::new();
        let b = Arena::new();
        assert!(matches!(a.push_child(b.root(), AxisDescriptor::dense(0, 2)), Err(LayoutError::UnknownNode { .. })));
    }

    #[test]
    fn sizes_fold_bottom_up() {
        let mut arena = Arena::new();
        let root = arena.root();
        let outer = arena.push_child(root, AxisDescriptor::dense(0, 3)).unwrap();
        let left = arena.push_child(outer, AxisDescriptor::dense(1, 4)).unwrap();
        let right = arena.push_child(outer, AxisDescriptor::dense(1, 2)).unwrap();
        arena.push_slots(left, &[Field::detached(4), Field::detached(8)]).unwrap();
        arena.push_slots(right, &[Field::detached(2)]).unwrap();
        arena.validate().unwrap();

        let cells = arena.cell_bytes().unwrap();
        assert_eq!(cells[left.index()], 12);
        assert_eq!(cells[right.index()], 2);
        assert_eq!(cells[outer.index()], 4 * 12 + 2 * 2);
        assert_eq!(cells[root.index()], 3 * 52);

        let bases = arena.child_bases(&cells);
        assert_eq!(bases[left.index()], 0);
        assert_eq!(bases[right.index()], 48);
        assert_eq!(arena.path(right), vec![root, outer, right]);
    }

    #[test]
    fn empty_nodes_rejected() {
        let mut arena = Arena::new();
        assert!(matches!(arena.validate(), Err(LayoutError::InvalidShape(_))));
        let root = arena.root();
        arena.push_child(root, AxisDescriptor::dense(0, 3)).unwrap();
        assert!(matches!(arena.validate(), Err(LayoutError::InvalidShape(_))));
    }
}
