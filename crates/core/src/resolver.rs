#![forbid(unsafe_code)]

use crate::error::GateError;
use crate::ids::{ValidatorName, WorkType};
use crate::profile::{ResolvedProfile, ValidatorSpec};
use crate::registry::ProfileRegistry;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Computes the union profile for a changeset's work types.
#[derive(Clone, Debug)]
pub struct ProfileResolver {
    registry: Arc<ProfileRegistry>,
}

impl ProfileResolver {
    pub fn new(registry: Arc<ProfileRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &ProfileRegistry {
        &self.registry
    }

    /// Union every matching profile.
    ///
    /// Every distinct blocking validator stays blocking and runs in registry
    /// definition order; a validator that is blocking anywhere is never also
    /// parallel. Same-name specs merge to the larger retry budget.
    pub fn resolve<'a, I>(&self, work_types: I) -> Result<ResolvedProfile, GateError>
    where
        I: IntoIterator<Item = &'a WorkType>,
    {
        let mut positions = BTreeSet::new();
        let mut any = false;
        for work_type in work_types {
            any = true;
            let position = self
                .registry
                .position_for(work_type)
                .ok_or_else(|| GateError::UnknownWorkType(work_type.clone()))?;
            positions.insert(position);
        }
        if !any {
            return Err(GateError::EmptyWorkTypes);
        }

        let mut blocking: Vec<ValidatorSpec> = Vec::new();
        let mut parallel: BTreeMap<ValidatorName, ValidatorSpec> = BTreeMap::new();
        for position in positions {
            let profile = self.registry.profile_at(position);
            if let Some(spec) = profile.blocking.as_ref() {
                match blocking.iter_mut().find(|existing| existing.name == spec.name) {
                    Some(existing) => existing.merge(spec),
                    None => blocking.push(spec.clone()),
                }
            }
            for spec in &profile.parallel {
                parallel
                    .entry(spec.name.clone())
                    .and_modify(|existing| existing.merge(spec))
                    .or_insert_with(|| spec.clone());
            }
        }

        for spec in &mut blocking {
            if let Some(demoted) = parallel.remove(&spec.name) {
                spec.merge(&demoted);
            }
        }

        Ok(ResolvedProfile {
            blocking,
            parallel: parallel.into_values().collect(),
        })
    }
}
