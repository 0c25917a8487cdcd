#![forbid(unsafe_code)]

use crate::error::GateError;
use crate::ids::{ValidatorName, WorkType};
use crate::profile::{ValidationProfile, ValidatorSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// On-disk registry document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default)]
    pub fallback: Option<WorkType>,
    #[serde(default)]
    pub profiles: Vec<ProfileEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfileEntry {
    pub work_type: WorkType,
    #[serde(default)]
    pub blocking: Option<ValidatorSpec>,
    #[serde(default)]
    pub parallel: Vec<ValidatorSpec>,
}

impl ProfileEntry {
    fn into_parts(self) -> (WorkType, ValidationProfile) {
        (
            self.work_type,
            ValidationProfile {
                blocking: self.blocking,
                parallel: self.parallel,
            },
        )
    }
}

/// Immutable work-type → profile table.
///
/// Built once from configuration, then shared read-only across runs.
#[derive(Clone, Debug)]
pub struct ProfileRegistry {
    entries: Vec<(WorkType, ValidationProfile)>,
    index: BTreeMap<WorkType, usize>,
    fallback: Option<usize>,
}

impl ProfileRegistry {
    pub fn from_config(config: RegistryConfig) -> Result<Self, GateError> {
        let entries = config
            .profiles
            .into_iter()
            .map(ProfileEntry::into_parts)
            .collect::<Vec<_>>();
        let mut index = BTreeMap::new();
        for (position, (work_type, profile)) in entries.iter().enumerate() {
            if index.insert(work_type.clone(), position).is_some() {
                return Err(GateError::InvalidRegistry(format!(
                    "duplicate profile for work type `{work_type}`"
                )));
            }
            validate_profile(work_type, profile)?;
        }
        let fallback = match config.fallback.as_ref() {
            Some(work_type) => Some(*index.get(work_type).ok_or_else(|| {
                GateError::InvalidRegistry(format!(
                    "fallback work type `{work_type}` has no profile"
                ))
            })?),
            None => None,
        };
        Ok(Self {
            entries,
            index,
            fallback,
        })
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, GateError> {
        let config: RegistryConfig = serde_yaml::from_str(text)?;
        Self::from_config(config)
    }

    pub fn from_json_str(text: &str) -> Result<Self, GateError> {
        let config: RegistryConfig = serde_json::from_str(text)?;
        Self::from_config(config)
    }

    pub fn load(path: &Path) -> Result<Self, GateError> {
        let text = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&text)
        } else {
            Self::from_yaml_str(&text)
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn fallback(&self) -> Option<&WorkType> {
        self.fallback.map(|position| &self.entries[position].0)
    }

    pub fn profile(&self, work_type: &WorkType) -> Option<&ValidationProfile> {
        self.index
            .get(work_type)
            .map(|position| &self.entries[*position].1)
    }

    /// Definition-order position of the profile that applies to `work_type`,
    /// falling back to the configured default profile.
    pub(crate) fn position_for(&self, work_type: &WorkType) -> Option<usize> {
        self.index.get(work_type).copied().or(self.fallback)
    }

    pub(crate) fn profile_at(&self, position: usize) -> &ValidationProfile {
        &self.entries[position].1
    }
}

fn validate_profile(work_type: &WorkType, profile: &ValidationProfile) -> Result<(), GateError> {
    let mut seen = HashSet::<&ValidatorName>::new();
    for spec in profile.validators() {
        if spec.max_attempts == 0 {
            return Err(GateError::InvalidRegistry(format!(
                "{work_type}: validator `{}` must allow at least one attempt",
                spec.name
            )));
        }
        if !seen.insert(&spec.name) {
            return Err(GateError::InvalidRegistry(format!(
                "{work_type}: validator `{}` is listed more than once",
                spec.name
            )));
        }
    }
    Ok(())
}
