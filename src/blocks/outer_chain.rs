//! Ordered composition of outer blocks.

use std::fmt;

use tracing::{info, trace};

use super::{BlockContext, OuterBlock};
use crate::ensemble::MemberSource;
use crate::error::{SaberError, SaberResult};
use crate::field::FieldSet;
use crate::geometry::Geometry;
use crate::variables::Variables;
use crate::verification::{adjoint_test_outer, inverse_test_outer, TestRecord};

struct OuterEntry {
    block: Box<dyn OuterBlock>,
    /// Geometry and variables on the block's outer side.
    geometry: Geometry,
    vars: Variables,
}

/// Outer blocks, stored outermost first.
pub struct OuterBlockChain {
    entries: Vec<OuterEntry>,
    outer_geometry: Geometry,
    outer_vars: Variables,
    inner_geometry: Geometry,
    inner_vars: Variables,
    xb: FieldSet,
    fg: FieldSet,
    records: Vec<TestRecord>,
}

impl OuterBlockChain {
    /// Builds the chain from descriptors listed outermost first. Each block's
    /// inner variables become the next block's outer variables.
    pub fn new(
        ctx: &BlockContext<'_>,
        outer_vars: &Variables,
        tables: &[toml::Table],
        members: Option<&dyn MemberSource>,
    ) -> SaberResult<Self> {
        let mut chain = Self {
            entries: Vec::with_capacity(tables.len()),
            outer_geometry: ctx.geometry.clone(),
            outer_vars: outer_vars.clone(),
            inner_geometry: ctx.geometry.clone(),
            inner_vars: outer_vars.clone(),
            xb: ctx.xb.clone(),
            fg: ctx.fg.clone(),
            records: Vec::new(),
        };

        for table in tables {
            let params = ctx.factory.outer_parameters(table)?;
            let base = params.base().clone();
            trace!(block = %base.name, "outer block construction");

            let block_ctx = BlockContext {
                geometry: &chain.inner_geometry,
                xb: &chain.xb,
                fg: &chain.fg,
                ..*ctx
            };
            let mut block = ctx
                .factory
                .make_outer(&block_ctx, &chain.inner_vars, params.as_ref())?;
            check_inner_vars(block.as_ref())?;

            if base.read.is_some() {
                block.read()?;
            }
            if base.calibration.is_some() {
                let source = members.ok_or_else(|| {
                    SaberError::config(&base.name, "calibration requires an ensemble")
                })?;
                let mut fsets = source.members()?;
                for fset in fsets.iter_mut() {
                    chain.apply_inverse_from(source.geometry(), fset)?;
                }
                block.direct_calibration(&fsets)?;
            }
            if base.write.is_some() {
                block.write()?;
            }

            let seeds = &ctx.covariance.seeds;
            if ctx.covariance.adjoint_test {
                chain.records.push(adjoint_test_outer(
                    block.as_ref(),
                    &chain.inner_geometry,
                    &chain.inner_vars,
                    ctx.covariance.adjoint_tolerance,
                    seeds.next_seed(),
                )?);
            }
            if ctx.covariance.inverse_test {
                chain.records.push(inverse_test_outer(
                    block.as_ref(),
                    &chain.inner_geometry,
                    &chain.inner_vars,
                    ctx.covariance.inverse_tolerance,
                    seeds.next_seed(),
                )?);
            }

            chain.xb = block.transfer_background(&chain.xb)?;
            chain.fg = block.transfer_background(&chain.fg)?;
            let geometry =
                std::mem::replace(&mut chain.inner_geometry, block.inner_geometry().clone());
            let vars = std::mem::replace(&mut chain.inner_vars, block.inner_vars().clone());
            info!(block = %block, "outer block ready");
            chain.entries.push(OuterEntry {
                block,
                geometry,
                vars,
            });
        }
        Ok(chain)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn outer_geometry(&self) -> &Geometry {
        &self.outer_geometry
    }

    pub fn outer_vars(&self) -> &Variables {
        &self.outer_vars
    }

    pub fn inner_geometry(&self) -> &Geometry {
        &self.inner_geometry
    }

    pub fn inner_vars(&self) -> &Variables {
        &self.inner_vars
    }

    /// Background and first guess expressed at the inner end of the chain.
    pub fn inner_background(&self) -> (&FieldSet, &FieldSet) {
        (&self.xb, &self.fg)
    }

    pub fn records(&self) -> &[TestRecord] {
        &self.records
    }

    pub fn block_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.block.name()).collect()
    }

    /// Inner to outer: blocks applied innermost first.
    pub fn apply(&self, fset: &mut FieldSet) -> SaberResult<()> {
        for entry in self.entries.iter().rev() {
            trace!(block = entry.block.name(), "multiply");
            entry.block.multiply(fset)?;
        }
        Ok(())
    }

    /// Outer to inner, adjoint of `apply`: blocks applied outermost first.
    pub fn apply_ad(&self, fset: &mut FieldSet) -> SaberResult<()> {
        for entry in &self.entries {
            trace!(block = entry.block.name(), "multiplyAD");
            entry.block.multiply_ad(fset)?;
        }
        Ok(())
    }

    /// Outer to inner, inverse of `apply`.
    pub fn apply_inverse(&self, fset: &mut FieldSet) -> SaberResult<()> {
        for entry in &self.entries {
            trace!(block = entry.block.name(), "inverseMultiply");
            entry.block.inverse_multiply(fset)?;
        }
        Ok(())
    }

    /// Inner to outer, adjoint of `apply_inverse`.
    pub fn apply_inverse_ad(&self, fset: &mut FieldSet) -> SaberResult<()> {
        for entry in self.entries.iter().rev() {
            trace!(block = entry.block.name(), "inverseMultiplyAD");
            entry.block.inverse_multiply_ad(fset)?;
        }
        Ok(())
    }

    /// Moves a bundle laid out on `geometry` to the inner end of the chain,
    /// inverting only the blocks whose outer side lives on that geometry or
    /// further in.
    pub fn apply_inverse_from(
        &self,
        geometry: &Geometry,
        fset: &mut FieldSet,
    ) -> SaberResult<()> {
        let start = match self.entries.iter().position(|e| e.geometry.aliases(geometry)) {
            Some(index) => index,
            None if self.inner_geometry.aliases(geometry) => self.entries.len(),
            None => {
                return Err(SaberError::config(
                    "ensemble",
                    format!(
                        "geometry {} does not match any block of the outer chain",
                        geometry.id()
                    ),
                ))
            }
        };
        if let Some(entry) = self.entries.get(start) {
            if let Some(missing) = entry.vars.iter().find(|v| !fset.has(&v.name)) {
                return Err(SaberError::shape(
                    entry.block.name(),
                    format!("ensemble member lacks outer variable {}", missing.name),
                ));
            }
        }
        for entry in &self.entries[start..] {
            entry.block.inverse_multiply(fset)?;
        }
        Ok(())
    }
}

/// Inner variables must agree with the level counts of the inner geometry.
fn check_inner_vars(block: &dyn OuterBlock) -> SaberResult<()> {
    let geom = block.inner_geometry();
    for var in block.inner_vars() {
        let expected = geom.levels(&var.name);
        if var.levels != expected {
            return Err(SaberError::config(
                block.name(),
                format!(
                    "inner variable {} has {} levels, geometry {} has {}",
                    var.name,
                    var.levels,
                    geom.id(),
                    expected
                ),
            ));
        }
    }
    Ok(())
}

impl fmt::Display for OuterBlockChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for entry in &self.entries {
            writeln!(f, "  {}", entry.block)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{BlockFactory, CovarianceConfig};
    use crate::config::GeometryParameters;
    use crate::variables::Variable;
    use crate::verification::{TestKind, TestStatus};

    fn setup() -> (Geometry, Variables) {
        let geom = Geometry::serial(&GeometryParameters {
            nx: 4,
            ny: 4,
            levels: 2,
            ..GeometryParameters::default()
        })
        .unwrap();
        let vars = geom.variables_with_levels(&Variables::from_names(&["psi", "chi"]));
        (geom, vars)
    }

    fn tables(text: &str) -> Vec<toml::Table> {
        #[derive(serde::Deserialize)]
        struct Wrapper {
            blocks: Vec<toml::Table>,
        }
        toml::from_str::<Wrapper>(text).unwrap().blocks
    }

    #[test]
    fn test_chain_order_matches_composition() {
        let (geom, vars) = setup();
        let factory = BlockFactory::with_builtin_blocks().unwrap();
        let covariance = CovarianceConfig::default();
        let xb = FieldSet::filled(&geom, &vars, 1.0);
        let ctx = BlockContext {
            factory: &factory,
            covariance: &covariance,
            geometry: &geom,
            xb: &xb,
            fg: &xb,
        };
        let descriptors = tables(
            r#"
[[blocks]]
"saber block name" = "StdDev"
value = 2.0
"active variables" = ["psi"]

[[blocks]]
"saber block name" = "StdDev"
value = 3.0
"#,
        );
        let both = OuterBlockChain::new(&ctx, &vars, &descriptors, None).unwrap();
        let first = OuterBlockChain::new(&ctx, &vars, &descriptors[..1], None).unwrap();
        let second = OuterBlockChain::new(&ctx, &vars, &descriptors[1..], None).unwrap();
        assert_eq!(both.block_names(), vec!["StdDev", "StdDev"]);

        let x = FieldSet::random(&geom, &vars, 3);
        let mut composed = x.clone();
        both.apply(&mut composed).unwrap();
        let mut manual = x.clone();
        second.apply(&mut manual).unwrap();
        first.apply(&mut manual).unwrap();
        assert_eq!(composed, manual);

        let mut composed_ad = x.clone();
        both.apply_ad(&mut composed_ad).unwrap();
        let mut manual_ad = x.clone();
        first.apply_ad(&mut manual_ad).unwrap();
        second.apply_ad(&mut manual_ad).unwrap();
        assert_eq!(composed_ad, manual_ad);

        let mut round = x.clone();
        both.apply(&mut round).unwrap();
        both.apply_inverse(&mut round).unwrap();
        round.sub(&x).unwrap();
        assert!(round.max_abs() < 1e-14);
    }

    #[test]
    fn test_empty_chain_is_identity() {
        let (geom, vars) = setup();
        let factory = BlockFactory::with_builtin_blocks().unwrap();
        let covariance = CovarianceConfig::default();
        let xb = FieldSet::zeros(&geom, &vars);
        let ctx = BlockContext {
            factory: &factory,
            covariance: &covariance,
            geometry: &geom,
            xb: &xb,
            fg: &xb,
        };
        let chain = OuterBlockChain::new(&ctx, &vars, &[], None).unwrap();
        assert!(chain.is_empty());
        assert_eq!(chain.inner_vars(), &vars);
        let x = FieldSet::random(&geom, &vars, 1);
        let mut y = x.clone();
        chain.apply(&mut y).unwrap();
        chain.apply_ad(&mut y).unwrap();
        assert_eq!(x, y);
    }

    #[test]
    fn test_renaming_propagates_inner_variables() {
        let (geom, vars) = setup();
        let factory = BlockFactory::with_builtin_blocks().unwrap();
        let covariance = CovarianceConfig {
            adjoint_test: true,
            inverse_test: true,
            ..CovarianceConfig::default()
        };
        let xb = FieldSet::zeros(&geom, &vars);
        let ctx = BlockContext {
            factory: &factory,
            covariance: &covariance,
            geometry: &geom,
            xb: &xb,
            fg: &xb,
        };
        let descriptors = tables(
            r#"
[[blocks]]
"saber block name" = "Identity"
"active variables" = ["psi"]
"output inner variables" = ["stream"]
"#,
        );
        let chain = OuterBlockChain::new(&ctx, &vars, &descriptors, None).unwrap();
        assert_eq!(chain.inner_vars().names(), vec!["stream".to_string(), "chi".to_string()]);
        assert_eq!(
            chain.inner_vars().get("stream"),
            Some(&Variable::new("stream", 2).on_grid(geom.id()))
        );
        assert_eq!(chain.records().len(), 2);
        assert!(chain.records().iter().all(|r| r.passed()));
    }

    #[test]
    fn test_interpolation_chain_records() {
        let (geom, vars) = setup();
        let factory = BlockFactory::with_builtin_blocks().unwrap();
        let covariance = CovarianceConfig {
            adjoint_test: true,
            inverse_test: true,
            ..CovarianceConfig::default()
        };
        let xb = FieldSet::filled(&geom, &vars, 1.0);
        let ctx = BlockContext {
            factory: &factory,
            covariance: &covariance,
            geometry: &geom,
            xb: &xb,
            fg: &xb,
        };
        let descriptors = tables(
            r#"
[[blocks]]
"saber block name" = "StdDev"
value = 2.0

[[blocks]]
"saber block name" = "Interpolation"
geometry = { nx = 3, ny = 3, levels = 2 }
"#,
        );
        let chain = OuterBlockChain::new(&ctx, &vars, &descriptors, None).unwrap();
        assert_eq!(chain.inner_geometry().parameters().nx, 3);
        assert_eq!(chain.inner_geometry().function_space().size(), 9);

        let summary: Vec<(TestKind, &str, TestStatus)> = chain
            .records()
            .iter()
            .map(|r| (r.kind, r.block.as_str(), r.status))
            .collect();
        assert_eq!(
            summary,
            vec![
                (TestKind::Adjoint, "StdDev", TestStatus::Passed),
                (TestKind::Inverse, "StdDev", TestStatus::Passed),
                (TestKind::Adjoint, "Interpolation", TestStatus::Passed),
                (TestKind::Inverse, "Interpolation", TestStatus::Skipped),
            ]
        );
        let interp = &chain.records()[2];
        assert!(interp.metric < 1e-12);
        assert!(interp.lhs.abs() > 0.0);

        // A constant on the coarse grid is interpolated exactly, then scaled.
        let mut x = FieldSet::filled(chain.inner_geometry(), chain.inner_vars(), 1.0);
        chain.apply(&mut x).unwrap();
        assert_eq!(x.require("psi").unwrap().points(), 16);
        for f in &x {
            assert!(f.values().iter().all(|v| (v - 2.0).abs() < 1e-14));
        }
        let (inner_xb, _) = chain.inner_background();
        assert_eq!(inner_xb.require("chi").unwrap().points(), 9);
    }

    #[test]
    fn test_member_missing_outer_variable_is_rejected() {
        let (geom, vars) = setup();
        let factory = BlockFactory::with_builtin_blocks().unwrap();
        let covariance = CovarianceConfig::default();
        let xb = FieldSet::zeros(&geom, &vars);
        let ctx = BlockContext {
            factory: &factory,
            covariance: &covariance,
            geometry: &geom,
            xb: &xb,
            fg: &xb,
        };
        let descriptors = tables(
            r#"
[[blocks]]
"saber block name" = "StdDev"
value = 2.0
"#,
        );
        let chain = OuterBlockChain::new(&ctx, &vars, &descriptors, None).unwrap();
        let psi_only = geom.variables_with_levels(&Variables::from_names(&["psi"]));
        let mut member = FieldSet::filled(&geom, &psi_only, 4.0);
        let err = chain.apply_inverse_from(&geom, &mut member).unwrap_err();
        assert!(matches!(err, SaberError::Shape { .. }));
        assert!(err.to_string().contains("chi"));

        let mut member = FieldSet::filled(&geom, &vars, 4.0);
        chain.apply_inverse_from(&geom, &mut member).unwrap();
        assert!(member.require("chi").unwrap().values().iter().all(|v| *v == 2.0));
    }
}
