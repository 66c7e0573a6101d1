//! Parameter blocks and their opaque handles.
//!
//! A parameter block is a contiguous chunk of user state. Blocks live in the
//! [`Problem`](crate::core::problem::Problem) arena and are referred to by
//! [`ParameterBlockId`], a slot index paired with a generation counter so that handles to
//! removed blocks are detected instead of silently aliasing a reused slot.

use std::fmt;
use std::sync::Arc;

use nalgebra::DVector;

use crate::core::manifold::Manifold;

/// Opaque, copyable handle to a parameter block.
///
/// Handles order by slot first, so sorting handles reproduces insertion order for blocks
/// that were never removed. Orderings rely on this to stay deterministic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ParameterBlockId {
    pub(crate) slot: u32,
    pub(crate) generation: u32,
}

impl ParameterBlockId {
    pub(crate) fn new(slot: usize, generation: u32) -> Self {
        Self {
            slot: slot as u32,
            generation,
        }
    }

    /// Arena slot of this handle.
    pub fn slot(&self) -> usize {
        self.slot as usize
    }
}

impl fmt::Display for ParameterBlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}v{}", self.slot, self.generation)
    }
}

/// A block of user parameters plus the bookkeeping the solver attaches to it.
///
/// `index`, `state_offset` and `delta_offset` are only meaningful while a
/// [`Program`](crate::core::program::Program) that contains the block has assigned them;
/// `index == None` means unassigned.
#[derive(Clone)]
pub struct ParameterBlock {
    values: DVector<f64>,
    manifold: Option<Arc<dyn Manifold>>,
    constant: bool,
    pub(crate) index: Option<usize>,
    pub(crate) state_offset: usize,
    pub(crate) delta_offset: usize,
}

impl ParameterBlock {
    pub fn new(values: DVector<f64>) -> Self {
        Self {
            values,
            manifold: None,
            constant: false,
            index: None,
            state_offset: 0,
            delta_offset: 0,
        }
    }

    /// Ambient size of the block.
    pub fn size(&self) -> usize {
        self.values.len()
    }

    /// Tangent size of the block, which differs from [`size`](Self::size) only when a
    /// manifold is attached.
    pub fn local_size(&self) -> usize {
        self.manifold
            .as_ref()
            .map_or(self.values.len(), |m| m.tangent_size())
    }

    pub fn values(&self) -> &DVector<f64> {
        &self.values
    }

    pub(crate) fn values_mut(&mut self) -> &mut DVector<f64> {
        &mut self.values
    }

    pub fn manifold(&self) -> Option<&Arc<dyn Manifold>> {
        self.manifold.as_ref()
    }

    pub(crate) fn set_manifold(&mut self, manifold: Option<Arc<dyn Manifold>>) {
        self.manifold = manifold;
    }

    pub fn is_constant(&self) -> bool {
        self.constant
    }

    pub(crate) fn set_constant(&mut self, constant: bool) {
        self.constant = constant;
    }

    /// Position of the block in the program that last assigned indices.
    pub fn index(&self) -> Option<usize> {
        self.index
    }

    pub fn state_offset(&self) -> usize {
        self.state_offset
    }

    pub fn delta_offset(&self) -> usize {
        self.delta_offset
    }
}

impl fmt::Debug for ParameterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterBlock")
            .field("size", &self.size())
            .field("local_size", &self.local_size())
            .field("constant", &self.constant)
            .field("index", &self.index)
            .finish()
    }
}
