//! Bilinear interpolation from a coarse regular grid (inner) to the outer grid.

use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::blocks::parameters::ParameterKey;
use crate::blocks::{
    BlockContext, BlockParameters, Capabilities, OuterBlock, OuterBlockType, ParameterKind,
    SaberBlock, SaberBlockParameters,
};
use crate::config::GeometryParameters;
use crate::error::{SaberError, SaberResult};
use crate::field::{Field, FieldSet};
use crate::geometry::{FunctionSpace, Geometry};
use crate::variables::Variables;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct InterpolationParameters {
    #[serde(flatten)]
    pub base: SaberBlockParameters,
    /// Inner grid; the dual-resolution geometry when absent.
    #[serde(default)]
    pub geometry: Option<GeometryParameters>,
}

impl BlockParameters for InterpolationParameters {
    const KEYS: &'static [ParameterKey] = &[ParameterKey::optional(
        "geometry",
        ParameterKind::Table,
        None,
        "inner (coarse) geometry; defaults to the dual resolution geometry",
    )];

    fn base(&self) -> &SaberBlockParameters {
        &self.base
    }

    fn validate(&self) -> SaberResult<()> {
        match &self.geometry {
            Some(g) => g.validate(),
            None => Ok(()),
        }
    }
}

/// Four (source index, weight) pairs per owned outer point.
type Stencil = [(usize, f64); 4];

fn axis(value: f64, min: f64, max: f64, n: usize) -> (usize, usize, f64) {
    if n < 2 || max <= min {
        return (0, 0, 0.0);
    }
    let step = (max - min) / (n - 1) as f64;
    let pos = ((value - min) / step).clamp(0.0, (n - 1) as f64);
    let i0 = (pos.floor() as usize).min(n - 2);
    (i0, i0 + 1, pos - i0 as f64)
}

fn stencils(outer: &FunctionSpace, inner: &GeometryParameters) -> Vec<Stencil> {
    (0..outer.owned())
        .map(|p| {
            let (i0, i1, wx) = axis(outer.lon[p], inner.lon_min, inner.lon_max, inner.nx);
            let (j0, j1, wy) = axis(outer.lat[p], inner.lat_min, inner.lat_max, inner.ny);
            let idx = |i: usize, j: usize| j * inner.nx + i;
            [
                (idx(i0, j0), (1.0 - wx) * (1.0 - wy)),
                (idx(i1, j0), wx * (1.0 - wy)),
                (idx(i0, j1), (1.0 - wx) * wy),
                (idx(i1, j1), wx * wy),
            ]
        })
        .collect()
}

fn nearest(value: f64, min: f64, max: f64, n: usize) -> usize {
    if n < 2 || max <= min {
        return 0;
    }
    let step = (max - min) / (n - 1) as f64;
    (((value - min) / step).round().max(0.0) as usize).min(n - 1)
}

pub struct Interpolation {
    outer_geometry: Geometry,
    inner_geometry: Geometry,
    active: Variables,
    inner_vars: Variables,
    stencils: Vec<Stencil>,
}

impl Interpolation {
    fn check_points(&self, field: &Field, expected: usize, side: &str) -> SaberResult<()> {
        if field.points() != expected {
            return Err(SaberError::shape(
                Self::NAME,
                format!(
                    "field {} has {} points, {} grid has {}",
                    field.name(),
                    field.points(),
                    side,
                    expected
                ),
            ));
        }
        Ok(())
    }
}

impl SaberBlock for Interpolation {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MULTIPLY | Capabilities::MULTIPLY_AD
    }

    fn active_vars(&self) -> &Variables {
        &self.active
    }
}

impl OuterBlock for Interpolation {
    fn inner_geometry(&self) -> &Geometry {
        &self.inner_geometry
    }

    fn inner_vars(&self) -> &Variables {
        &self.inner_vars
    }

    fn multiply(&self, fset: &mut FieldSet) -> SaberResult<()> {
        let inner_size = self.inner_geometry.function_space().size();
        let outer_fs = self.outer_geometry.function_space();
        for field in fset.iter_mut() {
            self.check_points(field, inner_size, "inner")?;
            let src = field.values();
            let mut out = Array2::zeros((outer_fs.size(), field.levels()));
            for (p, stencil) in self.stencils.iter().enumerate() {
                let mut row = out.row_mut(p);
                for &(k, w) in stencil {
                    if w != 0.0 {
                        row.scaled_add(w, &src.row(k));
                    }
                }
            }
            *field.values_mut() = out;
        }
        fset.synchronize(outer_fs);
        Ok(())
    }

    fn multiply_ad(&self, fset: &mut FieldSet) -> SaberResult<()> {
        let inner_fs = self.inner_geometry.function_space();
        let outer_size = self.outer_geometry.function_space().size();
        for field in fset.iter_mut() {
            self.check_points(field, outer_size, "outer")?;
            let src = field.values();
            let mut out = Array2::zeros((inner_fs.size(), field.levels()));
            for (p, stencil) in self.stencils.iter().enumerate() {
                for &(k, w) in stencil {
                    if w != 0.0 {
                        out.row_mut(k).scaled_add(w, &src.row(p));
                    }
                }
            }
            *field.values_mut() = out;
        }
        fset.synchronize(inner_fs);
        Ok(())
    }

    /// Nearest outer point for every inner point.
    fn transfer_background(&self, fset: &FieldSet) -> SaberResult<FieldSet> {
        let outer = self.outer_geometry.parameters();
        let inner_fs = self.inner_geometry.function_space();
        let mut out = FieldSet::new();
        for field in fset {
            self.check_points(field, self.outer_geometry.function_space().size(), "outer")?;
            let mut values = Array2::zeros((inner_fs.size(), field.levels()));
            for c in 0..inner_fs.owned() {
                let i = nearest(inner_fs.lon[c], outer.lon_min, outer.lon_max, outer.nx);
                let j = nearest(inner_fs.lat[c], outer.lat_min, outer.lat_max, outer.ny);
                values.row_mut(c).assign(&field.values().row(j * outer.nx + i));
            }
            out.insert(Field::new(field.name(), values));
        }
        out.synchronize(inner_fs);
        Ok(out)
    }
}

impl OuterBlockType for Interpolation {
    const NAME: &'static str = "Interpolation";
    type Parameters = InterpolationParameters;

    fn new(
        ctx: &BlockContext<'_>,
        outer_vars: &Variables,
        active: Variables,
        params: InterpolationParameters,
    ) -> SaberResult<Self> {
        if !active.same_names(outer_vars) {
            return Err(SaberError::config(
                Self::NAME,
                "every variable changes grid; active variables must cover the input",
            ));
        }
        let dual = ctx.covariance.dual_geometry.as_ref();
        let inner_geometry = match (&params.geometry, dual) {
            (Some(p), Some(d)) if d.parameters() == p => d.clone(),
            (Some(p), _) => ctx.geometry.dual(Some(p))?,
            (None, Some(d)) => d.clone(),
            (None, None) => {
                return Err(SaberError::config(
                    Self::NAME,
                    "needs a geometry key or a dual resolution geometry",
                ))
            }
        };
        let stencils = stencils(ctx.geometry.function_space(), inner_geometry.parameters());
        let inner_vars = inner_geometry.variables_with_levels(outer_vars);
        for (o, i) in outer_vars.iter().zip(inner_vars.iter()) {
            if o.levels != i.levels {
                return Err(SaberError::config(
                    Self::NAME,
                    format!(
                        "variable {} has {} levels outside and {} inside",
                        o.name, o.levels, i.levels
                    ),
                ));
            }
        }
        Ok(Self {
            outer_geometry: ctx.geometry.clone(),
            inner_geometry,
            active,
            inner_vars,
            stencils,
        })
    }
}

impl fmt::Display for Interpolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Interpolation {} -> {} on {}",
            self.inner_geometry.id(),
            self.outer_geometry.id(),
            self.active
        )
    }
}
