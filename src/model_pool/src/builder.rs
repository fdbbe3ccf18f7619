//! Builder for the model pool. The caller provides memory access and one
//! backend factory per family.

use crate::model::ModelRuntime;
use crate::model_def::{FamilyDef, ModelFamily};
use crate::pool::Pool;
use std::collections::HashMap;
use std::time::Duration;

pub(crate) type Factory = Box<dyn Fn() -> Box<dyn ModelRuntime> + Send + Sync>;

/// Builder for the pool service.
pub struct Builder {
    memory: Option<memory_manager::Handle>,
    health_check_interval: Duration,
    drain_timeout: Duration,
    family_infos: Vec<FamilyInfo>,
}

macro_rules! config {
    ($name:ident, $t: ty, $comment: literal) => {
        #[doc=$comment]
        pub fn $name(mut self, $name: $t) -> Self {
            self.$name = $name;
            self
        }
    };
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            memory: None,
            health_check_interval: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
            family_infos: vec![],
        }
    }
}

impl Builder {
    /// Create a new builder with default configuration.
    pub fn new() -> Self {
        Builder::default()
    }

    config!(health_check_interval, Duration, "Interval of the health sweep");
    config!(
        drain_timeout,
        Duration,
        "How long shutdown waits for in-flight executions"
    );

    /// Memory manager the pool reserves footprints through.
    pub fn memory(mut self, memory: memory_manager::Handle) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Register a family definition with its backend factory.
    pub fn register_family(mut self, info: FamilyInfo) -> Self {
        self.family_infos.push(info);
        self
    }

    /// Build the pool.
    pub fn build(self) -> Pool {
        assert!(self.memory.is_some());
        let memory = self.memory.unwrap();
        let mut families = HashMap::new();
        for info in self.family_infos {
            log::info!(
                "Registered {:?} family ({} MB compute, {} MB working, {} concurrent)",
                info.def.family,
                info.def.compute_memory,
                info.def.working_memory,
                info.def.max_concurrent
            );
            families.insert(info.def.family, (info.def, info.factory));
        }
        Pool::new(
            memory,
            families,
            self.health_check_interval,
            self.drain_timeout,
        )
    }
}

/// Registration of one model family.
pub struct FamilyInfo {
    pub(crate) def: FamilyDef,
    pub(crate) factory: Factory,
}

impl FamilyInfo {
    /// Create a FamilyInfo from a definition and a backend factory. The
    /// factory is invoked once per loaded instance.
    pub fn new<F>(def: FamilyDef, factory: F) -> Self
    where
        F: 'static + Fn() -> Box<dyn ModelRuntime> + Send + Sync,
    {
        FamilyInfo {
            def,
            factory: Box::new(factory),
        }
    }
}

/// Shorthand for the family map handed to the pool.
pub(crate) type FamilyMap = HashMap<ModelFamily, (FamilyDef, Factory)>;
