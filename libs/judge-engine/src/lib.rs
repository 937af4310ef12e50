pub mod build;
pub mod error;
pub mod evaluator;
pub mod executor;
pub mod pool;
pub mod registry;
pub mod supervisor;
pub mod workspace;


pub use error::JudgeError;
pub use executor::JudgeEngine;
pub use pool::{JobHandle, JudgePool, PoolStats};
pub use registry::{LanguageProfile, LanguageRegistry};
