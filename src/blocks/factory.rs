//! Name to maker registry for central and outer blocks.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use once_cell::sync::OnceCell;
use tracing::debug;

use super::parameters::{schema_of, ParameterKey, ParametersRecord};
use super::{
    BlockContext, BlockParameters, CentralBlock, CentralBlockType, OuterBlock, OuterBlockType,
};
use crate::config::block_name;
use crate::error::{SaberError, SaberResult};
use crate::generic;
use crate::variables::Variables;

trait CentralMaker: Send + Sync {
    fn parameters(&self) -> Box<dyn ParametersRecord>;
    fn schema(&self) -> Vec<ParameterKey>;
    fn make(
        &self,
        ctx: &BlockContext<'_>,
        vars: &Variables,
        params: &dyn ParametersRecord,
    ) -> SaberResult<Box<dyn CentralBlock>>;
}

trait OuterMaker: Send + Sync {
    fn parameters(&self) -> Box<dyn ParametersRecord>;
    fn schema(&self) -> Vec<ParameterKey>;
    fn make(
        &self,
        ctx: &BlockContext<'_>,
        outer_vars: &Variables,
        params: &dyn ParametersRecord,
    ) -> SaberResult<Box<dyn OuterBlock>>;
}

struct TypedCentralMaker<B>(PhantomData<fn() -> B>);
struct TypedOuterMaker<B>(PhantomData<fn() -> B>);

fn downcast<P: BlockParameters>(name: &str, params: &dyn ParametersRecord) -> SaberResult<P> {
    params
        .as_any()
        .downcast_ref::<P>()
        .cloned()
        .ok_or_else(|| SaberError::Internal(format!("parameter record type mismatch for {name}")))
}

impl<B: CentralBlockType> CentralMaker for TypedCentralMaker<B> {
    fn parameters(&self) -> Box<dyn ParametersRecord> {
        Box::new(B::Parameters::default())
    }

    fn schema(&self) -> Vec<ParameterKey> {
        schema_of::<B::Parameters>()
    }

    fn make(
        &self,
        ctx: &BlockContext<'_>,
        vars: &Variables,
        params: &dyn ParametersRecord,
    ) -> SaberResult<Box<dyn CentralBlock>> {
        let typed: B::Parameters = downcast(B::NAME, params)?;
        let active = BlockParameters::base(&typed)
            .active_vars(vars, &BlockParameters::mandatory_active_vars(&typed))?;
        Ok(Box::new(B::new(ctx, vars, active, typed)?))
    }
}

impl<B: OuterBlockType> OuterMaker for TypedOuterMaker<B> {
    fn parameters(&self) -> Box<dyn ParametersRecord> {
        Box::new(B::Parameters::default())
    }

    fn schema(&self) -> Vec<ParameterKey> {
        schema_of::<B::Parameters>()
    }

    fn make(
        &self,
        ctx: &BlockContext<'_>,
        outer_vars: &Variables,
        params: &dyn ParametersRecord,
    ) -> SaberResult<Box<dyn OuterBlock>> {
        let typed: B::Parameters = downcast(B::NAME, params)?;
        let active = BlockParameters::base(&typed)
            .active_vars(outer_vars, &BlockParameters::mandatory_active_vars(&typed))?;
        Ok(Box::new(B::new(ctx, outer_vars, active, typed)?))
    }
}

/// Block registry. Registration happens once; lookups are read-only afterwards.
#[derive(Default)]
pub struct BlockFactory {
    central: BTreeMap<&'static str, Box<dyn CentralMaker>>,
    outer: BTreeMap<&'static str, Box<dyn OuterMaker>>,
}

static GLOBAL: OnceCell<BlockFactory> = OnceCell::new();

impl BlockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every block shipped in this crate.
    pub fn with_builtin_blocks() -> SaberResult<Self> {
        let mut factory = Self::new();
        generic::register(&mut factory)?;
        Ok(factory)
    }

    /// Process-wide registry, built on first use.
    pub fn global() -> SaberResult<&'static BlockFactory> {
        GLOBAL.get_or_try_init(Self::with_builtin_blocks)
    }

    fn check_free(&self, name: &str) -> SaberResult<()> {
        if self.central.contains_key(name) || self.outer.contains_key(name) {
            return Err(SaberError::Internal(format!(
                "{name} already registered in the block factory"
            )));
        }
        Ok(())
    }

    pub fn register_central<B: CentralBlockType>(&mut self) -> SaberResult<()> {
        self.check_free(B::NAME)?;
        self.central
            .insert(B::NAME, Box::new(TypedCentralMaker::<B>(PhantomData)));
        debug!(block = B::NAME, "registered central block");
        Ok(())
    }

    pub fn register_outer<B: OuterBlockType>(&mut self) -> SaberResult<()> {
        self.check_free(B::NAME)?;
        self.outer
            .insert(B::NAME, Box::new(TypedOuterMaker::<B>(PhantomData)));
        debug!(block = B::NAME, "registered outer block");
        Ok(())
    }

    pub fn is_central(&self, name: &str) -> bool {
        self.central.contains_key(name)
    }

    pub fn is_outer(&self, name: &str) -> bool {
        self.outer.contains_key(name)
    }

    pub fn central_names(&self) -> Vec<&'static str> {
        self.central.keys().copied().collect()
    }

    pub fn outer_names(&self) -> Vec<&'static str> {
        self.outer.keys().copied().collect()
    }

    pub fn schema(&self, name: &str) -> Option<Vec<ParameterKey>> {
        self.central
            .get(name)
            .map(|m| m.schema())
            .or_else(|| self.outer.get(name).map(|m| m.schema()))
    }

    /// Fresh, empty parameter record of the named block.
    pub fn create_parameters(&self, name: &str) -> SaberResult<Box<dyn ParametersRecord>> {
        self.central
            .get(name)
            .map(|m| m.parameters())
            .or_else(|| self.outer.get(name).map(|m| m.parameters()))
            .ok_or_else(|| SaberError::config(name, "does not exist in the block factory"))
    }

    /// Deserialized and validated parameters of a central block descriptor.
    pub fn central_parameters(
        &self,
        table: &toml::Table,
    ) -> SaberResult<Box<dyn ParametersRecord>> {
        let name = block_name(table, "saber central block")?;
        let maker = self
            .central
            .get(name)
            .ok_or_else(|| {
                SaberError::config(name, "does not exist in the central block factory")
            })?;
        let mut params = maker.parameters();
        params.deserialize(table)?;
        Ok(params)
    }

    /// Deserialized and validated parameters of an outer block descriptor.
    pub fn outer_parameters(&self, table: &toml::Table) -> SaberResult<Box<dyn ParametersRecord>> {
        let name = block_name(table, "saber outer blocks")?;
        let maker = self
            .outer
            .get(name)
            .ok_or_else(|| {
                SaberError::config(name, "does not exist in the outer block factory")
            })?;
        let mut params = maker.parameters();
        params.deserialize(table)?;
        Ok(params)
    }

    pub fn make_central(
        &self,
        ctx: &BlockContext<'_>,
        vars: &Variables,
        params: &dyn ParametersRecord,
    ) -> SaberResult<Box<dyn CentralBlock>> {
        let name = params.base().name.as_str();
        let maker = self
            .central
            .get(name)
            .ok_or_else(|| {
                SaberError::config(name, "does not exist in the central block factory")
            })?;
        maker.make(ctx, vars, params)
    }

    pub fn make_outer(
        &self,
        ctx: &BlockContext<'_>,
        outer_vars: &Variables,
        params: &dyn ParametersRecord,
    ) -> SaberResult<Box<dyn OuterBlock>> {
        let name = params.base().name.as_str();
        let maker = self
            .outer
            .get(name)
            .ok_or_else(|| {
                SaberError::config(name, "does not exist in the outer block factory")
            })?;
        maker.make(ctx, outer_vars, params)
    }

    /// Parameters and block in one step.
    pub fn create_central(
        &self,
        ctx: &BlockContext<'_>,
        vars: &Variables,
        table: &toml::Table,
    ) -> SaberResult<Box<dyn CentralBlock>> {
        let params = self.central_parameters(table)?;
        self.make_central(ctx, vars, params.as_ref())
    }

    pub fn create_outer(
        &self,
        ctx: &BlockContext<'_>,
        outer_vars: &Variables,
        table: &toml::Table,
    ) -> SaberResult<Box<dyn OuterBlock>> {
        let params = self.outer_parameters(table)?;
        self.make_outer(ctx, outer_vars, params.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generic::{Diagonal, Id, Identity};

    #[test]
    fn test_duplicate_registration_is_internal_error() {
        let mut factory = BlockFactory::new();
        factory.register_central::<Id>().unwrap();
        let err = factory.register_central::<Id>().unwrap_err();
        assert!(matches!(err, SaberError::Internal(_)));
        assert!(!err.is_user_error());
    }

    #[test]
    fn test_builtin_registry() {
        let factory = BlockFactory::with_builtin_blocks().unwrap();
        for name in ["ID", "Diagonal", "Ensemble", "Hybrid"] {
            assert!(factory.is_central(name), "{name}");
        }
        for name in ["Identity", "StdDev", "Interpolation"] {
            assert!(factory.is_outer(name), "{name}");
        }
        assert!(factory.schema("Diagonal").unwrap().iter().any(|k| k.name == "variance"));
    }

    #[test]
    fn test_create_parameters_returns_fresh_record() {
        let factory = BlockFactory::with_builtin_blocks().unwrap();
        let rec = factory.create_parameters("Identity").unwrap();
        assert!(rec.base().name.is_empty());
        assert!(rec.schema().iter().any(|k| k.name == "saber block name"));
        let err = factory.create_parameters("NoSuchBlock").unwrap_err();
        assert!(err.is_user_error());
    }

    #[test]
    fn test_unknown_central_block_names_the_block() {
        let factory = BlockFactory::with_builtin_blocks().unwrap();
        let table: toml::Table = toml::from_str(r#""saber block name" = "NoSuchBlock""#).unwrap();
        let err = factory.central_parameters(&table).unwrap_err();
        assert!(err.is_user_error());
        assert!(err.to_string().starts_with("NoSuchBlock"));
    }

    #[test]
    fn test_registration_order_is_irrelevant() {
        let mut factory = BlockFactory::new();
        factory.register_outer::<Identity>().unwrap();
        factory.register_central::<Diagonal>().unwrap();
        assert_eq!(factory.central_names(), vec!["Diagonal"]);
        assert_eq!(factory.outer_names(), vec!["Identity"]);
    }
}
