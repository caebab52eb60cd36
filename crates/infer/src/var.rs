//! # Discrete random variables
//!
//! A [`Var`] is a named discrete variable with an ordered list of state
//! labels. Variables are owned by a
//! [`FactorGraph`](crate::graph::FactorGraph) arena and addressed by
//! [`VarId`] handles.
//!
//! Structured factors attach positional meaning through [`VarLabel`]:
//! a `Link` is a boolean edge indicator between token positions (with
//! `parent: None` for the virtual wall at the left of the sentence), a
//! `Span` is a boolean bracket indicator over a token range.

/// Index of a variable within its factor graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub usize);

impl std::fmt::Display for VarId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// The role a variable plays in training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarKind {
    /// Always given; clamped in both objective graphs.
    Observed,
    /// Never given; free in both objective graphs.
    Latent,
    /// The training target; clamped to gold in the numerator graph only.
    Predicted,
}

/// Positional payload for structured variables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarLabel {
    Plain,
    /// Dependency edge indicator: `parent → child` over token positions,
    /// `parent = None` for the virtual wall.
    Link {
        parent: Option<usize>,
        child: usize,
    },
    /// Constituency bracket indicator over the half-open token range
    /// `start..end`.
    Span { start: usize, end: usize },
}

/// State index conventions for boolean variables.
pub const FALSE: usize = 0;
pub const TRUE: usize = 1;

/// A discrete random variable: name, ordered state labels, training role,
/// and optional positional payload.
#[derive(Debug, Clone)]
pub struct Var {
    pub name: String,
    pub states: Vec<String>,
    pub kind: VarKind,
    pub label: VarLabel,
}

impl Var {
    pub fn new(name: impl Into<String>, states: Vec<String>, kind: VarKind) -> Self {
        let name = name.into();
        assert!(states.len() >= 2, "variable {name} needs at least two states");
        Self {
            name,
            states,
            kind,
            label: VarLabel::Plain,
        }
    }

    /// A boolean variable with states `["false", "true"]`.
    pub fn binary(name: impl Into<String>, kind: VarKind) -> Self {
        Self::new(name, vec!["false".into(), "true".into()], kind)
    }

    /// A dependency-link indicator (boolean, `Predicted`).
    pub fn link(parent: Option<usize>, child: usize) -> Self {
        let name = match parent {
            Some(p) => format!("link({p},{child})"),
            None => format!("link(wall,{child})"),
        };
        let mut var = Self::binary(name, VarKind::Predicted);
        var.label = VarLabel::Link { parent, child };
        var
    }

    /// A constituency-span indicator (boolean, `Predicted`).
    pub fn span(start: usize, end: usize) -> Self {
        assert!(start < end, "empty span {start}..{end}");
        let mut var = Self::binary(format!("span({start},{end})"), VarKind::Predicted);
        var.label = VarLabel::Span { start, end };
        var
    }

    pub fn num_states(&self) -> usize {
        self.states.len()
    }

    pub fn is_binary(&self) -> bool {
        self.states.len() == 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_var_state_order() {
        let v = Var::binary("x", VarKind::Latent);
        assert_eq!(v.states[FALSE], "false");
        assert_eq!(v.states[TRUE], "true");
    }

    #[test]
    fn link_var_names_the_wall() {
        let v = Var::link(None, 2);
        assert_eq!(v.name, "link(wall,2)");
        assert_eq!(
            v.label,
            VarLabel::Link {
                parent: None,
                child: 2
            }
        );
        assert_eq!(v.kind, VarKind::Predicted);
    }
}
