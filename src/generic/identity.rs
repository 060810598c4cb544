//! Identity outer block, optionally renaming its active variables.

use std::fmt;

use crate::blocks::{
    BlockContext, Capabilities, CommonParameters, OuterBlock, OuterBlockType, SaberBlock,
};
use crate::error::{SaberError, SaberResult};
use crate::field::FieldSet;
use crate::geometry::Geometry;
use crate::variables::{Variable, Variables};

pub struct Identity {
    geometry: Geometry,
    active: Variables,
    inner_vars: Variables,
    /// (outer name, inner name) for every renamed variable.
    renames: Vec<(String, String)>,
}

impl Identity {
    /// Renames in a single pass so that swaps are handled.
    fn rename(&self, fset: &mut FieldSet, to_inner: bool) {
        for field in fset.iter_mut() {
            let target = self.renames.iter().find_map(|(outer, inner)| {
                let (from, to) = if to_inner { (outer, inner) } else { (inner, outer) };
                (field.name() == from).then(|| to.clone())
            });
            if let Some(to) = target {
                field.rename(to);
            }
        }
    }

    fn to_inner(&self, fset: &mut FieldSet) {
        self.rename(fset, true);
    }

    fn to_outer(&self, fset: &mut FieldSet) {
        self.rename(fset, false);
    }
}

impl SaberBlock for Identity {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::MULTIPLY
            | Capabilities::MULTIPLY_AD
            | Capabilities::INVERSE_MULTIPLY
            | Capabilities::INVERSE_MULTIPLY_AD
    }

    fn active_vars(&self) -> &Variables {
        &self.active
    }
}

impl OuterBlock for Identity {
    fn inner_geometry(&self) -> &Geometry {
        &self.geometry
    }

    fn inner_vars(&self) -> &Variables {
        &self.inner_vars
    }

    fn multiply(&self, fset: &mut FieldSet) -> SaberResult<()> {
        self.to_outer(fset);
        Ok(())
    }

    fn multiply_ad(&self, fset: &mut FieldSet) -> SaberResult<()> {
        self.to_inner(fset);
        Ok(())
    }

    fn inverse_multiply(&self, fset: &mut FieldSet) -> SaberResult<()> {
        self.to_inner(fset);
        Ok(())
    }

    fn inverse_multiply_ad(&self, fset: &mut FieldSet) -> SaberResult<()> {
        self.to_outer(fset);
        Ok(())
    }

    fn transfer_background(&self, fset: &FieldSet) -> SaberResult<FieldSet> {
        let mut out = fset.clone();
        self.to_inner(&mut out);
        Ok(out)
    }
}

impl OuterBlockType for Identity {
    const NAME: &'static str = "Identity";
    type Parameters = CommonParameters;

    fn new(
        ctx: &BlockContext<'_>,
        outer_vars: &Variables,
        active: Variables,
        params: CommonParameters,
    ) -> SaberResult<Self> {
        let renames: Vec<(String, String)> = match &params.base.output_inner_variables {
            None => Vec::new(),
            Some(names) => {
                if names.len() != active.len() {
                    return Err(SaberError::config(
                        Self::NAME,
                        format!(
                            "output inner variables has {} names for {} active variables",
                            names.len(),
                            active.len()
                        ),
                    ));
                }
                active
                    .iter()
                    .zip(names.iter())
                    .filter(|(v, n)| v.name != **n)
                    .map(|(v, n)| (v.name.clone(), n.clone()))
                    .collect()
            }
        };
        for (_, inner) in &renames {
            if outer_vars.has(inner) && !renames.iter().any(|(o, _)| o == inner) {
                return Err(SaberError::config(
                    Self::NAME,
                    format!("inner variable {inner} collides with a passive variable"),
                ));
            }
        }

        let inner_vars = outer_vars
            .iter()
            .map(|v| match renames.iter().find(|(o, _)| *o == v.name) {
                Some((_, inner)) => Variable {
                    name: inner.clone(),
                    ..v.clone()
                },
                None => v.clone(),
            })
            .collect();
        Ok(Self {
            geometry: ctx.geometry.clone(),
            active,
            inner_vars,
            renames,
        })
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity on {}", self.active)?;
        for (outer, inner) in &self.renames {
            write!(f, " {outer}->{inner}")?;
        }
        Ok(())
    }
}
