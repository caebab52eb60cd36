//! # Variable sets and assignments
//!
//! A [`VarSet`] is an ordered, duplicate-free collection of variables with
//! their arities captured at construction. The order is fixed for the
//! lifetime of the set and defines a mixed-radix bijection between joint
//! configurations and flat indices — the first variable is the most
//! significant digit, matching row-major tensor layout. Every potential
//! table, belief tensor, and feature table is indexed through this
//! encoding.
//!
//! A [`VarConfig`] is a partial or total assignment of states to
//! variables.

use std::collections::HashMap;

use crate::var::VarId;

/// Ordered, duplicate-free variable collection with captured arities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarSet {
    ids: Vec<VarId>,
    arities: Vec<usize>,
}

impl VarSet {
    /// Build from `(id, arity)` pairs, keeping the first occurrence of
    /// each id.
    pub fn new(pairs: impl IntoIterator<Item = (VarId, usize)>) -> Self {
        let mut ids = Vec::new();
        let mut arities = Vec::new();
        for (id, arity) in pairs {
            if !ids.contains(&id) {
                assert!(arity >= 1, "variable {id} has no states");
                ids.push(id);
                arities.push(arity);
            }
        }
        Self { ids, arities }
    }

    pub fn empty() -> Self {
        Self {
            ids: Vec::new(),
            arities: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> &[VarId] {
        &self.ids
    }

    pub fn arity(&self, position: usize) -> usize {
        self.arities[position]
    }

    pub fn arities(&self) -> &[usize] {
        &self.arities
    }

    pub fn contains(&self, id: VarId) -> bool {
        self.ids.contains(&id)
    }

    pub fn position(&self, id: VarId) -> Option<usize> {
        self.ids.iter().position(|&v| v == id)
    }

    /// Number of joint configurations (1 for the empty set).
    pub fn num_configs(&self) -> usize {
        self.arities.iter().product()
    }

    /// Mixed-radix index of a total assignment over this set. Panics if
    /// the config does not cover every variable.
    pub fn config_index(&self, config: &VarConfig) -> usize {
        let mut index = 0;
        for (pos, &id) in self.ids.iter().enumerate() {
            let state = config
                .get(id)
                .unwrap_or_else(|| panic!("config missing {id}"));
            debug_assert!(state < self.arities[pos]);
            index = index * self.arities[pos] + state;
        }
        index
    }

    /// State of the variable at `position` within configuration `index`.
    pub fn state_at(&self, mut index: usize, position: usize) -> usize {
        for pos in (position + 1..self.len()).rev() {
            index /= self.arities[pos];
        }
        index % self.arities[position]
    }

    /// Decode a configuration index into per-position states.
    pub fn states_of(&self, mut index: usize) -> Vec<usize> {
        let mut states = vec![0; self.len()];
        for pos in (0..self.len()).rev() {
            states[pos] = index % self.arities[pos];
            index /= self.arities[pos];
        }
        states
    }

    /// Decode a configuration index into a total [`VarConfig`].
    pub fn config(&self, index: usize) -> VarConfig {
        let states = self.states_of(index);
        let mut config = VarConfig::new();
        for (pos, &id) in self.ids.iter().enumerate() {
            config.set(id, states[pos]);
        }
        config
    }
}

/// A partial or total assignment of states to variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VarConfig {
    map: HashMap<VarId, usize>,
}

impl VarConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, id: VarId, state: usize) -> &mut Self {
        self.map.insert(id, state);
        self
    }

    pub fn get(&self, id: VarId) -> Option<usize> {
        self.map.get(&id).copied()
    }

    pub fn contains(&self, id: VarId) -> bool {
        self.map.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn vars(&self) -> impl Iterator<Item = VarId> + '_ {
        self.map.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VarId, usize)> + '_ {
        self.map.iter().map(|(&id, &s)| (id, s))
    }

    /// The sub-assignment over variables satisfying `keep`.
    pub fn restricted(&self, keep: impl Fn(VarId) -> bool) -> VarConfig {
        let mut out = VarConfig::new();
        for (id, state) in self.iter() {
            if keep(id) {
                out.set(id, state);
            }
        }
        out
    }
}
