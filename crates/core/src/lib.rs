#![forbid(unsafe_code)]

//! Pure gate domain: profiles, resolution, contract checks, retry decisions.
//!
//! Nothing in this crate performs I/O beyond reading a registry file, and
//! nothing here is async. The runner crate drives these pieces.

pub mod attempt;
pub mod clock;
pub mod contract;
pub mod error;
pub mod ids;
pub mod profile;
pub mod registry;
pub mod request;
pub mod resolver;
pub mod retry;
pub mod scope;

pub use attempt::{
    AttemptStatus, Decision, EngineState, EscalationCause, FailureReason, GateAttempt, Outcome,
    SessionHandle, summarize_escalations,
};
pub use contract::{
    ContractValidator, ContractVerdict, GateResult, MalformedContract, RawWorkerOutput, RedFlag,
    ValidatorPayload,
};
pub use error::GateError;
pub use ids::{ChangesetId, IdError, ValidatorName, WorkType};
pub use profile::{ContractExpectations, ResolvedProfile, ValidationProfile, ValidatorSpec};
pub use registry::{ProfileEntry, ProfileRegistry, RegistryConfig};
pub use request::GateRequest;
pub use resolver::ProfileResolver;
pub use retry::{NextAction, RetryPolicy};
pub use scope::AuthorizedScope;
