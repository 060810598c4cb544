//! Ordered variable sets with per-variable metadata.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A named variable with its level count and the grid it lives on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub levels: usize,
    /// Identifier of the geometry the variable is laid out on (empty when unset).
    #[serde(default)]
    pub grid: String,
}

impl Variable {
    pub fn new(name: impl Into<String>, levels: usize) -> Self {
        Self {
            name: name.into(),
            levels,
            grid: String::new(),
        }
    }

    pub fn on_grid(mut self, grid: impl Into<String>) -> Self {
        self.grid = grid.into();
        self
    }
}

impl fmt::Display for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.levels)
    }
}

/// Ordered set of variables. Two sets are equal when names and metadata agree
/// in the same order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variables {
    vars: Vec<Variable>,
}

impl Variables {
    pub fn new(vars: Vec<Variable>) -> Self {
        let mut out = Self::default();
        for v in vars {
            out.push(v);
        }
        out
    }

    /// Names only, levels left at zero until a geometry fills them in.
    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Self {
        Self::new(names.iter().map(|n| Variable::new(n.as_ref(), 0)).collect())
    }

    /// Appends a variable; a name already present is replaced in place.
    pub fn push(&mut self, var: Variable) {
        match self.vars.iter_mut().find(|v| v.name == var.name) {
            Some(slot) => *slot = var,
            None => self.vars.push(var),
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn has(&self, name: &str) -> bool {
        self.vars.iter().any(|v| v.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&Variable> {
        self.vars.iter().find(|v| v.name == name)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Variable> {
        self.vars.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.vars.iter().map(|v| v.name.clone()).collect()
    }

    /// Variables of `self` that also appear (by name) in `other`, in `self` order.
    pub fn intersection(&self, other: &Variables) -> Variables {
        Variables::new(
            self.vars
                .iter()
                .filter(|v| other.has(&v.name))
                .cloned()
                .collect(),
        )
    }

    /// True when every name in `other` is present in `self`.
    pub fn contains_all(&self, other: &Variables) -> bool {
        other.iter().all(|v| self.has(&v.name))
    }

    /// Same names in the same order, ignoring metadata.
    pub fn same_names(&self, other: &Variables) -> bool {
        self.vars.len() == other.vars.len()
            && self.vars.iter().zip(other.vars.iter()).all(|(a, b)| a.name == b.name)
    }
}

impl<'a> IntoIterator for &'a Variables {
    type Item = &'a Variable;
    type IntoIter = std::slice::Iter<'a, Variable>;

    fn into_iter(self) -> Self::IntoIter {
        self.vars.iter()
    }
}

impl FromIterator<Variable> for Variables {
    fn from_iter<T: IntoIterator<Item = Variable>>(iter: T) -> Self {
        Variables::new(iter.into_iter().collect())
    }
}

impl fmt::Display for Variables {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.vars.iter().map(|v| v.to_string()).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_includes_metadata() {
        let a = Variables::new(vec![Variable::new("psi", 4), Variable::new("chi", 4)]);
        let b = Variables::new(vec![Variable::new("psi", 4), Variable::new("chi", 4)]);
        let c = Variables::new(vec![Variable::new("psi", 4), Variable::new("chi", 3)]);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.same_names(&c));
    }

    #[test]
    fn test_push_replaces_existing_name() {
        let mut vars = Variables::from_names(&["t", "q"]);
        vars.push(Variable::new("t", 10));
        assert_eq!(vars.len(), 2);
        assert_eq!(vars.get("t").map(|v| v.levels), Some(10));
        assert_eq!(vars.names(), vec!["t".to_string(), "q".to_string()]);
    }
}
