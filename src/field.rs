//! Field bundles and the field-algebra facade.
//!
//! Every numerical step of the chain algebra goes through these methods.
//! Only `dot` (and `norm`) is collective.

use std::ops::{Index, IndexMut};

use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use crate::error::{SaberError, SaberResult};
use crate::geometry::{FunctionSpace, GeometryData};
use crate::variables::{Variable, Variables};

/// One variable laid out as `(points, levels)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    name: String,
    values: Array2<f64>,
}

impl Field {
    pub fn new(name: impl Into<String>, values: Array2<f64>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }

    pub fn zeros(name: impl Into<String>, points: usize, levels: usize) -> Self {
        Self::new(name, Array2::zeros((points, levels)))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn points(&self) -> usize {
        self.values.nrows()
    }

    pub fn levels(&self) -> usize {
        self.values.ncols()
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut Array2<f64> {
        &mut self.values
    }

    fn check_shape(&self, other: &Field, context: &str) -> SaberResult<()> {
        if self.values.dim() != other.values.dim() {
            return Err(SaberError::shape(
                context,
                format!(
                    "field {} has shape {:?}, other has {:?}",
                    self.name,
                    self.values.dim(),
                    other.values.dim()
                ),
            ));
        }
        Ok(())
    }
}

/// Keyed collection of fields, ordered by insertion.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSet {
    fields: Vec<Field>,
}

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn level_count(geom: &GeometryData, var: &Variable) -> usize {
        if var.levels > 0 {
            var.levels
        } else {
            geom.levels(&var.name)
        }
    }

    /// Zero bundle with one field per variable on `geom`.
    pub fn zeros(geom: &GeometryData, vars: &Variables) -> Self {
        Self::filled(geom, vars, 0.0)
    }

    pub fn filled(geom: &GeometryData, vars: &Variables, value: f64) -> Self {
        let points = geom.function_space().size();
        let fields = vars
            .iter()
            .map(|v| {
                Field::new(
                    v.name.clone(),
                    Array2::from_elem((points, Self::level_count(geom, v)), value),
                )
            })
            .collect();
        Self { fields }
    }

    /// Independent N(0,1) draws on owned points, halo synchronized.
    /// Deterministic for a fixed seed and rank.
    pub fn random(geom: &GeometryData, vars: &Variables, seed: u64) -> Self {
        let rank = geom.comm().rank() as u64;
        let mut rng = ChaCha8Rng::seed_from_u64(seed ^ rank.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let fs = geom.function_space();
        let mut out = Self::zeros(geom, vars);
        for field in out.fields.iter_mut() {
            for (jnode, mut row) in field.values.rows_mut().into_iter().enumerate() {
                if fs.ghost[jnode] {
                    continue;
                }
                for x in row.iter_mut() {
                    *x = StandardNormal.sample(&mut rng);
                }
            }
        }
        out.synchronize(fs);
        out
    }

    pub fn zero_like(&self) -> Self {
        let mut out = self.clone();
        out.zero();
        out
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Field> {
        self.fields.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Field> {
        self.fields.iter_mut()
    }

    pub fn names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Variables carried by this bundle, levels read from the arrays.
    pub fn variables(&self) -> Variables {
        self.fields
            .iter()
            .map(|f| Variable::new(f.name.clone(), f.levels()))
            .collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.iter_mut().find(|f| f.name == name)
    }

    pub fn require(&self, name: &str) -> SaberResult<&Field> {
        self.field(name)
            .ok_or_else(|| SaberError::shape("field set", format!("missing field {name}")))
    }

    pub fn require_mut(&mut self, name: &str) -> SaberResult<&mut Field> {
        self.field_mut(name)
            .ok_or_else(|| SaberError::shape("field set", format!("missing field {name}")))
    }

    /// Inserts a field, replacing any field with the same name in place.
    pub fn insert(&mut self, field: Field) {
        match self.fields.iter_mut().find(|f| f.name == field.name) {
            Some(slot) => *slot = field,
            None => self.fields.push(field),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<Field> {
        let idx = self.fields.iter().position(|f| f.name == name)?;
        Some(self.fields.remove(idx))
    }

    /// Copies owned values into the halo rows.
    pub fn synchronize(&mut self, fs: &FunctionSpace) {
        let owned = fs.owned();
        if owned == 0 {
            return;
        }
        for field in self.fields.iter_mut() {
            if field.points() != fs.size() {
                continue;
            }
            for (k, jnode) in (owned..fs.size()).enumerate() {
                let src = field.values.row(k % owned).to_owned();
                field.values.row_mut(jnode).assign(&src);
            }
        }
    }

    pub fn zero(&mut self) {
        self.fill(0.0);
    }

    pub fn fill(&mut self, value: f64) {
        for f in self.fields.iter_mut() {
            f.values.fill(value);
        }
    }

    pub fn scale(&mut self, factor: f64) {
        for f in self.fields.iter_mut() {
            f.values *= factor;
        }
    }

    fn zip_with<F>(&mut self, other: &FieldSet, context: &str, mut op: F) -> SaberResult<()>
    where
        F: FnMut(&mut f64, f64) -> SaberResult<()>,
    {
        for f in self.fields.iter_mut() {
            let g = other.field(&f.name).ok_or_else(|| {
                SaberError::shape(context, format!("missing field {} in second operand", f.name))
            })?;
            f.check_shape(g, context)?;
            for (x, y) in f.values.iter_mut().zip(g.values.iter()) {
                op(x, *y)?;
            }
        }
        Ok(())
    }

    /// Elementwise product, per variable.
    pub fn multiply(&mut self, other: &FieldSet) -> SaberResult<()> {
        self.zip_with(other, "multiply", |x, y| {
            *x *= y;
            Ok(())
        })
    }

    /// Elementwise quotient; a zero divisor is an error.
    pub fn divide(&mut self, other: &FieldSet) -> SaberResult<()> {
        self.zip_with(other, "divide", |x, y| {
            if y == 0.0 {
                return Err(SaberError::shape("divide", "division by zero"));
            }
            *x /= y;
            Ok(())
        })
    }

    fn zip_subset<F>(&mut self, weights: &FieldSet, context: &str, mut op: F) -> SaberResult<()>
    where
        F: FnMut(&mut f64, f64) -> SaberResult<()>,
    {
        for w in weights.iter() {
            let f = self.field_mut(&w.name).ok_or_else(|| {
                SaberError::shape(context, format!("missing field {} in first operand", w.name))
            })?;
            f.check_shape(w, context)?;
            for (x, y) in f.values.iter_mut().zip(w.values.iter()) {
                op(x, *y)?;
            }
        }
        Ok(())
    }

    /// Multiplies the fields `weights` carries; the other fields pass through.
    pub fn multiply_by(&mut self, weights: &FieldSet) -> SaberResult<()> {
        self.zip_subset(weights, "multiply", |x, y| {
            *x *= y;
            Ok(())
        })
    }

    /// Divides the fields `weights` carries; the other fields pass through.
    pub fn divide_by(&mut self, weights: &FieldSet) -> SaberResult<()> {
        self.zip_subset(weights, "divide", |x, y| {
            if y == 0.0 {
                return Err(SaberError::shape("divide", "division by zero"));
            }
            *x /= y;
            Ok(())
        })
    }

    /// Copy restricted to `vars`, in their order.
    pub fn subset(&self, vars: &Variables) -> SaberResult<FieldSet> {
        let mut out = FieldSet::new();
        for var in vars {
            out.insert(self.require(&var.name)?.clone());
        }
        Ok(out)
    }

    pub fn add(&mut self, other: &FieldSet) -> SaberResult<()> {
        self.axpy(1.0, other)
    }

    pub fn sub(&mut self, other: &FieldSet) -> SaberResult<()> {
        self.axpy(-1.0, other)
    }

    /// self += a * other
    pub fn axpy(&mut self, a: f64, other: &FieldSet) -> SaberResult<()> {
        if self.len() != other.len() {
            return Err(SaberError::shape(
                "add",
                format!("{} fields against {}", self.len(), other.len()),
            ));
        }
        self.zip_with(other, "add", |x, y| {
            *x += a * y;
            Ok(())
        })
    }

    /// Elementwise square root; entries must be nonnegative.
    pub fn sqrt(&mut self) -> SaberResult<()> {
        for f in self.fields.iter_mut() {
            if let Some(bad) = f.values.iter().find(|x| **x < 0.0) {
                return Err(SaberError::shape(
                    "sqrt",
                    format!("negative value {bad} in field {}", f.name),
                ));
            }
            f.values.mapv_inplace(f64::sqrt);
        }
        Ok(())
    }

    /// Sum of products over owned points, levels and `active` variables,
    /// reduced over the communicator.
    pub fn dot(
        &self,
        other: &FieldSet,
        active: &Variables,
        geom: &GeometryData,
    ) -> SaberResult<f64> {
        let ghost = &geom.function_space().ghost;
        let mut local = 0.0;
        for var in active {
            let a = self.require(&var.name)?;
            let b = other.require(&var.name)?;
            a.check_shape(b, "dot")?;
            if a.points() != ghost.len() {
                return Err(SaberError::shape(
                    "dot",
                    format!(
                        "field {} has {} points, geometry {} has {}",
                        a.name,
                        a.points(),
                        geom.id(),
                        ghost.len()
                    ),
                ));
            }
            for (jnode, (ra, rb)) in a.values.rows().into_iter().zip(b.values.rows()).enumerate() {
                if !ghost[jnode] {
                    local += ra.dot(&rb);
                }
            }
        }
        Ok(geom.comm().all_reduce_sum(local))
    }

    /// Dot product over every variable of `self`.
    pub fn dot_all(&self, other: &FieldSet, geom: &GeometryData) -> SaberResult<f64> {
        self.dot(other, &self.variables(), geom)
    }

    pub fn norm(&self, geom: &GeometryData) -> SaberResult<f64> {
        Ok(self.dot_all(self, geom)?.sqrt())
    }

    /// Largest absolute entry over all fields (local, not reduced).
    pub fn max_abs(&self) -> f64 {
        self.fields
            .iter()
            .flat_map(|f| f.values.iter())
            .fold(0.0, |acc: f64, x| acc.max(x.abs()))
    }
}

impl<'a> IntoIterator for &'a FieldSet {
    type Item = &'a Field;
    type IntoIter = std::slice::Iter<'a, Field>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.iter()
    }
}

/// Time slots of field bundles; the algebra is lifted slot by slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldSet4D {
    slots: Vec<FieldSet>,
}

impl FieldSet4D {
    pub fn new(slots: Vec<FieldSet>) -> Self {
        Self { slots }
    }

    pub fn single(fset: FieldSet) -> Self {
        Self { slots: vec![fset] }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn first(&self) -> Option<&FieldSet> {
        self.slots.first()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, FieldSet> {
        self.slots.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, FieldSet> {
        self.slots.iter_mut()
    }

    pub fn into_slots(self) -> Vec<FieldSet> {
        self.slots
    }

    pub fn zero_like(&self) -> Self {
        Self::new(self.slots.iter().map(FieldSet::zero_like).collect())
    }

    pub fn zero(&mut self) {
        self.slots.iter_mut().for_each(FieldSet::zero);
    }

    pub fn scale(&mut self, factor: f64) {
        self.slots.iter_mut().for_each(|s| s.scale(factor));
    }

    /// Multiplies every slot by the same 3D weight.
    pub fn multiply(&mut self, weight: &FieldSet) -> SaberResult<()> {
        self.slots.iter_mut().try_for_each(|s| s.multiply(weight))
    }

    fn check_slots(&self, other: &FieldSet4D, context: &str) -> SaberResult<()> {
        if self.len() != other.len() {
            return Err(SaberError::shape(
                context,
                format!("{} time slots against {}", self.len(), other.len()),
            ));
        }
        Ok(())
    }

    pub fn add(&mut self, other: &FieldSet4D) -> SaberResult<()> {
        self.axpy(1.0, other)
    }

    pub fn sub(&mut self, other: &FieldSet4D) -> SaberResult<()> {
        self.axpy(-1.0, other)
    }

    pub fn axpy(&mut self, a: f64, other: &FieldSet4D) -> SaberResult<()> {
        self.check_slots(other, "add")?;
        self.slots
            .iter_mut()
            .zip(other.slots.iter())
            .try_for_each(|(s, o)| s.axpy(a, o))
    }

    /// Dot product over all slots and all variables.
    pub fn dot(&self, other: &FieldSet4D, geom: &GeometryData) -> SaberResult<f64> {
        self.check_slots(other, "dot")?;
        let mut total = 0.0;
        for (s, o) in self.slots.iter().zip(other.slots.iter()) {
            total += s.dot_all(o, geom)?;
        }
        Ok(total)
    }

    pub fn norm(&self, geom: &GeometryData) -> SaberResult<f64> {
        Ok(self.dot(self, geom)?.sqrt())
    }
}

impl Index<usize> for FieldSet4D {
    type Output = FieldSet;

    fn index(&self, idx: usize) -> &FieldSet {
        &self.slots[idx]
    }
}

impl IndexMut<usize> for FieldSet4D {
    fn index_mut(&mut self, idx: usize) -> &mut FieldSet {
        &mut self.slots[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GeometryParameters;
    use crate::geometry::Geometry;
    use approx::assert_relative_eq;

    fn geometry(halo: usize) -> Geometry {
        Geometry::serial(&GeometryParameters {
            nx: 4,
            ny: 3,
            levels: 2,
            halo,
            ..GeometryParameters::default()
        })
        .unwrap()
    }

    #[test]
    fn test_random_is_reproducible() {
        let geom = geometry(0);
        let vars = Variables::from_names(&["a", "b"]);
        let x = FieldSet::random(&geom, &vars, 42);
        let y = FieldSet::random(&geom, &vars, 42);
        let z = FieldSet::random(&geom, &vars, 43);
        assert_eq!(x, y);
        assert_ne!(x, z);
        assert_eq!(x.require("a").unwrap().values().dim(), (12, 2));
    }

    #[test]
    fn test_dot_skips_halo_points() {
        let geom = geometry(3);
        let vars = Variables::from_names(&["a"]);
        let ones = FieldSet::filled(&geom, &vars, 1.0);
        // 12 owned points x 2 levels; the 3 halo points are excluded.
        assert_relative_eq!(ones.dot_all(&ones, &geom).unwrap(), 24.0);
    }

    #[test]
    fn test_dot_restricted_to_active_variables() {
        let geom = geometry(0);
        let vars = Variables::from_names(&["a", "b"]);
        let ones = FieldSet::filled(&geom, &vars, 1.0);
        let active = Variables::from_names(&["b"]);
        assert_relative_eq!(ones.dot(&ones, &active, &geom).unwrap(), 24.0);
        assert_relative_eq!(ones.dot_all(&ones, &geom).unwrap(), 48.0);
    }

    #[test]
    fn test_elementwise_algebra() {
        let geom = geometry(0);
        let vars = Variables::from_names(&["a"]);
        let mut x = FieldSet::filled(&geom, &vars, 3.0);
        let y = FieldSet::filled(&geom, &vars, 4.0);
        x.multiply(&y).unwrap();
        assert_relative_eq!(x.max_abs(), 12.0);
        x.sqrt().unwrap();
        x.sub(&y).unwrap();
        assert_relative_eq!(x.max_abs(), 12f64.sqrt() - 4.0, epsilon = 1e-14);
        x.scale(0.0);
        assert_eq!(x.max_abs(), 0.0);
    }

    #[test]
    fn test_sqrt_rejects_negative_values() {
        let geom = geometry(0);
        let mut x = FieldSet::filled(&geom, &Variables::from_names(&["a"]), -1.0);
        assert!(matches!(x.sqrt(), Err(SaberError::Shape { .. })));
    }

    #[test]
    fn test_mismatched_variables_are_rejected() {
        let geom = geometry(0);
        let mut x = FieldSet::zeros(&geom, &Variables::from_names(&["a"]));
        let y = FieldSet::zeros(&geom, &Variables::from_names(&["b"]));
        assert!(x.add(&y).is_err());
        assert!(x.multiply(&y).is_err());
    }

    #[test]
    fn test_halo_follows_owned_values() {
        let geom = geometry(2);
        let x = FieldSet::random(&geom, &Variables::from_names(&["a"]), 7);
        let f = x.require("a").unwrap();
        assert_eq!(f.values().row(12), f.values().row(0));
        assert_eq!(f.values().row(13), f.values().row(1));
    }
}
