//! Array and tuple shapes, plus trees of values indexed by shape position

use meridian_device::ElementType;
use std::fmt;

/// Bytes per entry of a tuple's pointer table
pub const TUPLE_ENTRY_BYTES: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    Array { element: ElementType, dims: Vec<usize> },
    Tuple(Vec<Shape>),
}

impl Shape {
    pub fn array(element: ElementType, dims: impl Into<Vec<usize>>) -> Self {
        Shape::Array {
            element,
            dims: dims.into(),
        }
    }

    pub fn scalar(element: ElementType) -> Self {
        Shape::Array { element, dims: Vec::new() }
    }

    pub fn tuple(elements: impl Into<Vec<Shape>>) -> Self {
        Shape::Tuple(elements.into())
    }

    pub fn is_tuple(&self) -> bool {
        matches!(self, Shape::Tuple(_))
    }

    /// Elements of an array; zero for tuples
    pub fn element_count(&self) -> usize {
        match self {
            Shape::Array { dims, .. } => dims.iter().product(),
            Shape::Tuple(_) => 0,
        }
    }

    /// Size of the buffer backing this node (a pointer table for tuples)
    pub fn byte_size(&self) -> usize {
        match self {
            Shape::Array { element, .. } => self.element_count() * element.size_bytes(),
            Shape::Tuple(elements) => elements.len() * TUPLE_ENTRY_BYTES,
        }
    }

    pub fn subshape(&self, index: &ShapeIndex) -> Option<&Shape> {
        let mut current = self;
        for &i in index.as_slice() {
            match current {
                Shape::Tuple(elements) => current = elements.get(i)?,
                Shape::Array { .. } => return None,
            }
        }
        Some(current)
    }

    /// Every node index in preorder
    pub fn indices(&self) -> Vec<ShapeIndex> {
        let mut out = Vec::new();
        self.visit(&mut ShapeIndex::root(), &mut |index, _| out.push(index.clone()));
        out
    }

    fn visit(&self, index: &mut ShapeIndex, f: &mut impl FnMut(&ShapeIndex, &Shape)) {
        f(index, self);
        if let Shape::Tuple(elements) = self {
            for (i, element) in elements.iter().enumerate() {
                index.0.push(i);
                element.visit(index, f);
                index.0.pop();
            }
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Shape::Array { element, dims } => {
                write!(f, "{element}[")?;
                for (i, d) in dims.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, "{d}")?;
                }
                f.write_str("]")
            }
            Shape::Tuple(elements) => {
                f.write_str("(")?;
                for (i, element) in elements.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{element}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Path from the root of a shape to one of its nodes
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShapeIndex(Vec<usize>);

impl ShapeIndex {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(path: impl Into<Vec<usize>>) -> Self {
        Self(path.into())
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn child(&self, i: usize) -> Self {
        let mut path = self.0.clone();
        path.push(i);
        Self(path)
    }
}

impl fmt::Display for ShapeIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{v}")?;
        }
        f.write_str("}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Node<T> {
    index: ShapeIndex,
    is_leaf: bool,
    value: T,
}

/// One value per node of a shape, stored in preorder
///
/// Preorder over shape indices is their lexicographic order, so lookups
/// binary search the node list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeTree<T> {
    nodes: Vec<Node<T>>,
}

impl<T> ShapeTree<T> {
    pub fn from_shape(shape: &Shape, mut f: impl FnMut(&ShapeIndex, &Shape) -> T) -> Self {
        let mut nodes = Vec::new();
        shape.visit(&mut ShapeIndex::root(), &mut |index, node| {
            nodes.push(Node {
                index: index.clone(),
                is_leaf: !node.is_tuple(),
                value: f(index, node),
            })
        });
        Self { nodes }
    }

    pub fn filled(shape: &Shape, value: T) -> Self
    where
        T: Clone,
    {
        Self::from_shape(shape, |_, _| value.clone())
    }

    fn position(&self, index: &ShapeIndex) -> Option<usize> {
        self.nodes
            .binary_search_by(|node| node.index.as_slice().cmp(index.as_slice()))
            .ok()
    }

    pub fn get(&self, index: &ShapeIndex) -> Option<&T> {
        self.position(index).map(|i| &self.nodes[i].value)
    }

    pub fn get_mut(&mut self, index: &ShapeIndex) -> Option<&mut T> {
        self.position(index).map(move |i| &mut self.nodes[i].value)
    }

    pub fn element(&self) -> Option<&T> {
        self.get(&ShapeIndex::root())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ShapeIndex, &T)> {
        self.nodes.iter().map(|node| (&node.index, &node.value))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ShapeIndex, &mut T)> {
        self.nodes.iter_mut().map(|node| (&node.index, &mut node.value))
    }

    /// Non-tuple nodes only
    pub fn leaves(&self) -> impl Iterator<Item = (&ShapeIndex, &T)> {
        self.nodes
            .iter()
            .filter(|node| node.is_leaf)
            .map(|node| (&node.index, &node.value))
    }

    pub fn map<U>(&self, mut f: impl FnMut(&ShapeIndex, &T) -> U) -> ShapeTree<U> {
        ShapeTree {
            nodes: self
                .nodes
                .iter()
                .map(|node| Node {
                    index: node.index.clone(),
                    is_leaf: node.is_leaf,
                    value: f(&node.index, &node.value),
                })
                .collect(),
        }
    }
}
