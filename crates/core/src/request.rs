#![forbid(unsafe_code)]

use crate::ids::{ChangesetId, WorkType};
use crate::scope::AuthorizedScope;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Input to one gate run.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateRequest {
    pub changeset_id: ChangesetId,
    pub work_types: BTreeSet<WorkType>,
    pub authorized_scope: AuthorizedScope,
}

impl GateRequest {
    pub fn new<I>(changeset_id: ChangesetId, work_types: I, authorized_scope: AuthorizedScope) -> Self
    where
        I: IntoIterator<Item = WorkType>,
    {
        Self {
            changeset_id,
            work_types: work_types.into_iter().collect(),
            authorized_scope,
        }
    }
}
