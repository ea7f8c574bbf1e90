//! Resource counters per kind and the aggregate completion of a run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ResourceKind;

/// Counters reported for one resource kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindProgress {
    pub completed: u64,
    /// `None` until the provisioner reports a total.
    pub total: Option<u64>,
}

impl KindProgress {
    /// True once a total is known and reached.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.total.is_some_and(|total| self.completed == total)
    }
}

/// Aggregate progress of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub completed: u64,
    pub total: u64,
    /// Every kind has reported a total. Before that `completed / total` is
    /// not a meaningful fraction.
    pub ready: bool,
}

impl ProgressSnapshot {
    /// Completion in percent, or `None` while the total is still unknown.
    #[must_use]
    pub fn percent(&self) -> Option<u8> {
        if !self.ready {
            return None;
        }
        if self.total == 0 {
            return Some(100);
        }
        let pct = u128::from(self.completed.min(self.total)) * 100 / u128::from(self.total);
        Some(u8::try_from(pct).unwrap_or(100))
    }

    /// True when every kind is ready and all resources are created.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.ready && self.completed == self.total
    }
}

impl std::fmt::Display for ProgressSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.percent() {
            Some(pct) => write!(f, "{}/{} resources ({pct}%)", self.completed, self.total),
            None => f.write_str("waiting for resource totals"),
        }
    }
}

/// Tracks resource counters for the fixed set of kinds in a run.
#[derive(Debug, Clone, Default)]
pub struct ProgressTracker {
    kinds: BTreeMap<ResourceKind, KindProgress>,
}

impl ProgressTracker {
    pub fn new(kinds: impl IntoIterator<Item = ResourceKind>) -> Self {
        Self {
            kinds: kinds
                .into_iter()
                .map(|kind| (kind, KindProgress::default()))
                .collect(),
        }
    }

    /// Record counters reported for `kind`.
    ///
    /// Inconsistent telemetry is clamped rather than rejected: `total` never
    /// drops below the kind's `completed`, `completed` never exceeds `total`
    /// and never goes backwards. Returns the counters actually stored, or
    /// `None` for a kind that is not part of the run.
    pub fn update(
        &mut self,
        kind: &ResourceKind,
        completed: u64,
        total: u64,
    ) -> Option<KindProgress> {
        let Some(entry) = self.kinds.get_mut(kind) else {
            warn!(kind = %kind, "Ignoring progress for a kind outside the run");
            return None;
        };

        let mut next_completed = completed;
        if next_completed < entry.completed {
            warn!(
                kind = %kind,
                previous = entry.completed,
                reported = completed,
                "Resource count went backwards, keeping previous value"
            );
            next_completed = entry.completed;
        }

        let mut next_total = total;
        if next_total < entry.completed {
            warn!(
                kind = %kind,
                completed = entry.completed,
                reported_total = total,
                "Total shrank below completed resources, clamping"
            );
            next_total = entry.completed;
        }

        if next_completed > next_total {
            warn!(
                kind = %kind,
                completed = next_completed,
                total = next_total,
                "Completed resources exceed total, clamping"
            );
            next_completed = next_total;
        }

        entry.completed = next_completed;
        entry.total = Some(next_total);
        Some(*entry)
    }

    /// Counters for one kind.
    #[must_use]
    pub fn kind(&self, kind: &ResourceKind) -> Option<KindProgress> {
        self.kinds.get(kind).copied()
    }

    #[must_use]
    pub fn is_kind_complete(&self, kind: &ResourceKind) -> bool {
        self.kinds.get(kind).is_some_and(KindProgress::is_complete)
    }

    /// Kinds tracked by this run.
    pub fn kinds(&self) -> impl Iterator<Item = (&ResourceKind, &KindProgress)> {
        self.kinds.iter()
    }

    /// True when every kind has a total and reached it.
    ///
    /// Checked per kind, so it stays exact even when the sums in
    /// [`snapshot`](Self::snapshot) saturate.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.kinds.values().all(KindProgress::is_complete)
    }

    /// Sum counters across all kinds. Sums saturate at `u64::MAX`.
    #[must_use]
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.kinds.values().fold(
            ProgressSnapshot {
                completed: 0,
                total: 0,
                ready: true,
            },
            |acc, progress| ProgressSnapshot {
                completed: acc.completed.saturating_add(progress.completed),
                total: acc.total.saturating_add(progress.total.unwrap_or(0)),
                ready: acc.ready && progress.total.is_some(),
            },
        )
    }
}
