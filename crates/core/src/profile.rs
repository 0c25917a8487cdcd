#![forbid(unsafe_code)]

use crate::ids::ValidatorName;
use serde::{Deserialize, Serialize};
use sha2::Digest as _;
use std::fmt::Write as _;

/// Typed red-flag predicates a validator opts into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContractExpectations {
    /// Payload exposes a numeric `failure_count`.
    pub failure_count: bool,
    /// Payload must always carry `commands_executed`.
    pub commands_executed: bool,
}

impl ContractExpectations {
    pub fn union(self, other: Self) -> Self {
        Self {
            failure_count: self.failure_count || other.failure_count,
            commands_executed: self.commands_executed || other.commands_executed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidatorSpec {
    pub name: ValidatorName,
    pub max_attempts: u32,
    #[serde(default)]
    pub expects: ContractExpectations,
}

impl ValidatorSpec {
    pub fn new(name: ValidatorName, max_attempts: u32) -> Self {
        Self {
            name,
            max_attempts,
            expects: ContractExpectations::default(),
        }
    }

    pub fn with_expectations(mut self, expects: ContractExpectations) -> Self {
        self.expects = expects;
        self
    }

    /// Combine two specs sharing a name: the larger retry budget wins and
    /// declared checks accumulate.
    pub(crate) fn merge(&mut self, other: &ValidatorSpec) {
        debug_assert_eq!(self.name, other.name);
        self.max_attempts = self.max_attempts.max(other.max_attempts);
        self.expects = self.expects.union(other.expects);
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ValidationProfile {
    #[serde(default)]
    pub blocking: Option<ValidatorSpec>,
    #[serde(default)]
    pub parallel: Vec<ValidatorSpec>,
}

impl ValidationProfile {
    pub fn validators(&self) -> impl Iterator<Item = &ValidatorSpec> {
        self.blocking.iter().chain(self.parallel.iter())
    }
}

/// Union of every profile matched by a changeset.
///
/// `blocking` is ordered by registry definition and runs sequentially;
/// `parallel` is ordered by name and never shares a name with `blocking`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedProfile {
    pub blocking: Vec<ValidatorSpec>,
    pub parallel: Vec<ValidatorSpec>,
}

impl ResolvedProfile {
    pub fn is_empty(&self) -> bool {
        self.blocking.is_empty() && self.parallel.is_empty()
    }

    pub fn parallel_names(&self) -> Vec<&ValidatorName> {
        self.parallel.iter().map(|spec| &spec.name).collect()
    }

    pub fn spec(&self, name: &ValidatorName) -> Option<&ValidatorSpec> {
        self.blocking
            .iter()
            .chain(self.parallel.iter())
            .find(|spec| &spec.name == name)
    }

    /// Lowercase hex SHA-256 over the canonical JSON form.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let digest = sha2::Sha256::digest(&canonical);
        let mut out = String::with_capacity(64);
        for b in digest {
            let _ = write!(&mut out, "{b:02x}");
        }
        out
    }
}
