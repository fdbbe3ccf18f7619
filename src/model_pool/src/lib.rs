#![deny(warnings)]
#![deny(missing_docs)]
#![warn(clippy::all)]

//! ModelPool owns the set of loadable model instances. It performs the
//! load/unload/health-check lifecycle, reserving memory through
//! MemoryManager before activating an instance.

pub mod builder;
mod instance;
mod model;
mod model_def;
pub mod pool;

pub use crate::builder::{Builder, FamilyInfo};
pub use crate::instance::{InstanceRef, InstanceSnapshot, Status};
pub use crate::model::{ModelOutput, ModelRuntime};
pub use crate::model_def::{FamilyDef, ModelFamily};
pub use crate::pool::{Pool, PoolHandle};

/// Errors during API calls.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// No backend is registered for the family.
    UnknownFamily(ModelFamily),
    /// Not enough memory for the family's footprint, even after one
    /// reclamation pass.
    CapacityExceeded(ModelFamily),
    /// The backend failed to initialize the instance.
    Load {
        /// Family whose instance failed to come up.
        family: ModelFamily,
        /// Backend-reported reason.
        reason: String,
    },
    /// The referenced instance is no longer in the roster.
    StaleInstance(u64),
    /// The instance has no spare execution capacity right now.
    Saturated(u64),
    /// Instance execution returned an error.
    Execution {
        /// Instance that executed the payload.
        instance: u64,
        /// Backend-reported reason.
        reason: String,
    },
    /// The pool is shutting down and no longer loads or executes.
    ShuttingDown,
}
