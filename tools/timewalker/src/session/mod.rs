//! Scenario execution against one interactive process.

pub mod context;
pub mod controller;
pub mod predicate;
pub mod scenario;
pub mod template;

pub use context::SessionContext;
pub use controller::{
    keyframes_digest, CancelToken, RunRequest, SessionController, SessionReport,
};
pub use predicate::{Condition, Predicate};
pub use scenario::{Expectation, Scenario, Step};
