use chrono::{DateTime, Utc};

use crate::{SagaId, SagaStatus};

/// Builder for selecting saga instances.
///
/// All filters are combined with AND. Results are ordered by `updated_at`
/// (oldest first) so sweeps visit the longest-idle sagas first.
#[derive(Debug, Clone, Default)]
pub struct SagaQuery {
    /// Filter by any of these statuses.
    pub statuses: Option<Vec<SagaStatus>>,

    /// Filter by saga type.
    pub saga_type: Option<String>,

    /// Only sagas not touched since this instant.
    pub updated_before: Option<DateTime<Utc>>,

    /// Only sagas whose deadline passed before this instant.
    pub timeout_before: Option<DateTime<Utc>>,

    /// Exact match on a metadata entry.
    pub metadata: Option<(String, String)>,

    /// Maximum number of sagas to return.
    pub limit: Option<usize>,
}

impl SagaQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for sagas in a single status.
    pub fn with_status(status: SagaStatus) -> Self {
        Self {
            statuses: Some(vec![status]),
            ..Default::default()
        }
    }

    pub fn statuses(mut self, statuses: Vec<SagaStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    pub fn updated_before(mut self, at: DateTime<Utc>) -> Self {
        self.updated_before = Some(at);
        self
    }

    pub fn timeout_before(mut self, at: DateTime<Utc>) -> Self {
        self.timeout_before = Some(at);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata = Some((key.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Builder for selecting transition history rows.
///
/// Results are ordered by `created_at` (oldest first).
#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub saga_id: Option<SagaId>,
    pub saga_type: Option<String>,
    pub source_state: Option<String>,
    pub target_state: Option<String>,
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for one saga's full history.
    pub fn for_saga(saga_id: SagaId) -> Self {
        Self {
            saga_id: Some(saga_id),
            ..Default::default()
        }
    }

    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    pub fn source_state(mut self, state: impl Into<String>) -> Self {
        self.source_state = Some(state.into());
        self
    }

    pub fn target_state(mut self, state: impl Into<String>) -> Self {
        self.target_state = Some(state.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}
