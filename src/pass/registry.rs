use crate::pass::{Pass, PassError};
use crate::passes;
use std::collections::BTreeMap;

pub type PassFactory = Box<dyn Fn() -> Box<dyn Pass> + Send + Sync>;

/// Pass constructors by name. Passes are instantiated fresh for every run.
#[derive(Default)]
pub struct PassRegistry {
    factories: BTreeMap<String, PassFactory>,
}

impl PassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_passes() -> Self {
        let mut registry = Self::new();
        registry.register(passes::REMOVE_IDENTITY, || Box::new(passes::RemoveIdentity::default()));
        registry.register(passes::CONST_FOLD, || Box::new(passes::ConstFold::default()));
        registry.register(passes::PROPAGATE_FIX_INFO, || Box::new(passes::PropagateFixInfo::default()));
        registry.register(passes::FUSE_MATMUL_ADD, || Box::new(passes::FuseMatMulAdd::default()));
        registry
    }

    /// Registers `factory` under `name`, replacing any earlier registration.
    pub fn register(&mut self, name: &str, factory: impl Fn() -> Box<dyn Pass> + Send + Sync + 'static) -> &mut Self {
        if self.factories.insert(name.to_string(), Box::new(factory)).is_some() {
            log::debug!("Replaced pass registration {name}");
        }
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn create(&self, name: &str) -> Result<Box<dyn Pass>, PassError> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| PassError::UnknownPass(name.to_string()))?;
        Ok(factory())
    }
}

impl std::fmt::Debug for PassRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}
