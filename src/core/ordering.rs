//! Elimination orderings over parameter blocks.
//!
//! A [`ParameterBlockOrdering`] partitions parameter blocks into groups identified by
//! non-negative integers. Lower group ids are eliminated first: for Schur-type linear
//! solvers group 0 holds the e-blocks, and inner iterations optimize groups in ascending
//! order. Within a group blocks are kept in handle order, which makes every ordering
//! derived from it deterministic.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::parameter_block::ParameterBlockId;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParameterBlockOrdering {
    groups: BTreeMap<usize, BTreeSet<ParameterBlockId>>,
    element_to_group: HashMap<ParameterBlockId, usize>,
}

impl ParameterBlockOrdering {
    pub fn new() -> Self {
        Self::default()
    }

    /// Place `id` in `group`, moving it out of any group it was in before.
    pub fn add_element_to_group(&mut self, id: ParameterBlockId, group: usize) {
        if let Some(previous) = self.element_to_group.insert(id, group) {
            if previous == group {
                return;
            }
            self.remove_from_group(id, previous);
        }
        self.groups.entry(group).or_default().insert(id);
    }

    /// Remove `id` from the ordering. Returns whether it was present.
    pub fn remove(&mut self, id: ParameterBlockId) -> bool {
        match self.element_to_group.remove(&id) {
            Some(group) => {
                self.remove_from_group(id, group);
                true
            }
            None => false,
        }
    }

    fn remove_from_group(&mut self, id: ParameterBlockId, group: usize) {
        if let Some(members) = self.groups.get_mut(&group) {
            members.remove(&id);
            if members.is_empty() {
                self.groups.remove(&group);
            }
        }
    }

    /// Reverse the order of the groups, keeping their contents.
    pub fn reverse(&mut self) {
        let Some(&max_group) = self.groups.keys().next_back() else {
            return;
        };
        let groups = std::mem::take(&mut self.groups);
        self.element_to_group.clear();
        for (group, members) in groups {
            let new_group = max_group - group;
            for &id in &members {
                self.element_to_group.insert(id, new_group);
            }
            self.groups.insert(new_group, members);
        }
    }

    pub fn contains(&self, id: ParameterBlockId) -> bool {
        self.element_to_group.contains_key(&id)
    }

    pub fn group_id(&self, id: ParameterBlockId) -> Option<usize> {
        self.element_to_group.get(&id).copied()
    }

    /// Number of non-empty groups.
    pub fn num_groups(&self) -> usize {
        self.groups.len()
    }

    pub fn num_elements(&self) -> usize {
        self.element_to_group.len()
    }

    pub fn group_size(&self, group: usize) -> usize {
        self.groups.get(&group).map_or(0, BTreeSet::len)
    }

    /// Size of the lowest-numbered group, or 0 for an empty ordering.
    pub fn first_group_size(&self) -> usize {
        self.groups.values().next().map_or(0, BTreeSet::len)
    }

    /// Iterate over `(group id, members)` in ascending group order.
    pub fn groups(&self) -> impl Iterator<Item = (usize, &BTreeSet<ParameterBlockId>)> {
        self.groups.iter().map(|(&g, members)| (g, members))
    }

    /// Sizes of the non-empty groups in ascending group order.
    pub fn group_sizes(&self) -> Vec<usize> {
        self.groups.values().map(BTreeSet::len).collect()
    }
}
