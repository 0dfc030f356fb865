//! Before/after mutation hooks with per-record veto.

use crate::error::DbResult;
use crate::row::Row;
use std::fmt;
use std::sync::Arc;

/// Bit set of the hook points a trigger participates in.
///
/// Only hooks named by a trigger's [`TableTrigger::kinds`] are invoked
/// for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerKinds(u8);

impl TriggerKinds {
    /// No hooks.
    pub const NONE: Self = Self(0);
    /// Before a batch insert is persisted.
    pub const BEFORE_INSERT: Self = Self(1);
    /// After a batch insert has been persisted.
    pub const AFTER_INSERT: Self = Self(1 << 1);
    /// Before a batch delete is applied.
    pub const BEFORE_DELETE: Self = Self(1 << 2);
    /// After a batch delete has been applied.
    pub const AFTER_DELETE: Self = Self(1 << 3);
    /// Before a batch update is persisted (list form).
    pub const BEFORE_UPDATE: Self = Self(1 << 4);
    /// Before each updated row is persisted (paired old/new form).
    pub const BEFORE_UPDATE_COMPARE: Self = Self(1 << 5);
    /// After a batch update has been persisted.
    pub const AFTER_UPDATE: Self = Self(1 << 6);
    /// Every hook point.
    pub const ALL: Self = Self(0x7f);

    /// Returns true if `other`'s bits are all present in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Combines two sets.
    #[must_use]
    pub const fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl std::ops::BitOr for TriggerKinds {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.with(rhs)
    }
}

/// A row passing through a before-hook, carrying its veto flag.
///
/// A trigger vetoes a row by calling [`Candidate::veto`]; this is not an
/// error - the row is simply excluded from the persisted batch while its
/// siblings proceed.
#[derive(Debug, Clone)]
pub struct Candidate<T> {
    /// The row under consideration. Before-hooks may mutate it.
    pub row: T,
    allowed: bool,
}

impl<T> Candidate<T> {
    /// Wraps a row as an allowed candidate.
    #[must_use]
    pub fn new(row: T) -> Self {
        Self { row, allowed: true }
    }

    /// Marks the row as disallowed for this mutation.
    pub fn veto(&mut self) {
        self.allowed = false;
    }

    /// Returns true if no trigger has vetoed the row.
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    /// Unwraps the row.
    #[must_use]
    pub fn into_row(self) -> T {
        self.row
    }
}

/// An ordered, vetoable hook around table mutations.
///
/// Triggers declare the hook points they participate in via `kinds` and
/// their position in the pipeline via `position`; lower positions run
/// first, ties run in registration order. All hook methods default to
/// no-ops.
///
/// Returning `Err` from a before-hook aborts the whole batch before any
/// disk write; vetoing through [`Candidate::veto`] excludes only that
/// row.
pub trait TableTrigger<T: Row>: Send + Sync {
    /// Pipeline position; ascending order, default 0.
    fn position(&self) -> i32 {
        0
    }

    /// Hook points this trigger participates in.
    fn kinds(&self) -> TriggerKinds;

    /// Invoked before an insert batch is persisted.
    fn before_insert(&self, rows: &mut [Candidate<T>]) -> DbResult<()> {
        let _ = rows;
        Ok(())
    }

    /// Invoked after an insert batch has been persisted.
    fn after_insert(&self, rows: &[T]) -> DbResult<()> {
        let _ = rows;
        Ok(())
    }

    /// Invoked before a delete batch is applied.
    fn before_delete(&self, rows: &mut [Candidate<T>]) -> DbResult<()> {
        let _ = rows;
        Ok(())
    }

    /// Invoked after a delete batch has been applied.
    fn after_delete(&self, rows: &[T]) -> DbResult<()> {
        let _ = rows;
        Ok(())
    }

    /// Invoked before an update batch is persisted (list form).
    fn before_update(&self, rows: &mut [Candidate<T>]) -> DbResult<()> {
        let _ = rows;
        Ok(())
    }

    /// Invoked before each updated row is persisted, with the stored
    /// row for comparison-based veto.
    fn before_update_compare(&self, old: &T, new: &mut Candidate<T>) -> DbResult<()> {
        let _ = (old, new);
        Ok(())
    }

    /// Invoked after an update batch has been persisted.
    fn after_update(&self, rows: &[T]) -> DbResult<()> {
        let _ = rows;
        Ok(())
    }
}

/// The ordered set of triggers registered for one table.
pub struct TriggerSet<T: Row> {
    triggers: Vec<Arc<dyn TableTrigger<T>>>,
}

impl<T: Row> Default for TriggerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Row> TriggerSet<T> {
    /// Creates an empty trigger set.
    #[must_use]
    pub fn new() -> Self {
        Self {
            triggers: Vec::new(),
        }
    }

    /// Registers a trigger, keeping the set ordered by ascending
    /// position. Registration order breaks ties.
    pub fn register(&mut self, trigger: Arc<dyn TableTrigger<T>>) {
        self.triggers.push(trigger);
        // Stable sort keeps declaration order for equal positions.
        self.triggers.sort_by_key(|t| t.position());
    }

    /// Returns the number of registered triggers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.triggers.len()
    }

    /// Returns true if no triggers are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.triggers.is_empty()
    }

    /// Runs a before-hook selected by `select` over all triggers whose
    /// kinds contain `kind`.
    pub fn run_before<F>(&self, kind: TriggerKinds, mut select: F) -> DbResult<()>
    where
        F: FnMut(&dyn TableTrigger<T>) -> DbResult<()>,
    {
        for trigger in &self.triggers {
            if trigger.kinds().contains(kind) {
                select(trigger.as_ref())?;
            }
        }
        Ok(())
    }

    /// Runs before-insert hooks.
    pub fn before_insert(&self, rows: &mut [Candidate<T>]) -> DbResult<()> {
        self.run_before(TriggerKinds::BEFORE_INSERT, |t| t.before_insert(rows))
    }

    /// Runs after-insert hooks.
    pub fn after_insert(&self, rows: &[T]) -> DbResult<()> {
        self.run_before(TriggerKinds::AFTER_INSERT, |t| t.after_insert(rows))
    }

    /// Runs before-delete hooks.
    pub fn before_delete(&self, rows: &mut [Candidate<T>]) -> DbResult<()> {
        self.run_before(TriggerKinds::BEFORE_DELETE, |t| t.before_delete(rows))
    }

    /// Runs after-delete hooks.
    pub fn after_delete(&self, rows: &[T]) -> DbResult<()> {
        self.run_before(TriggerKinds::AFTER_DELETE, |t| t.after_delete(rows))
    }

    /// Runs before-update hooks (list form).
    pub fn before_update(&self, rows: &mut [Candidate<T>]) -> DbResult<()> {
        self.run_before(TriggerKinds::BEFORE_UPDATE, |t| t.before_update(rows))
    }

    /// Runs before-update-compare hooks for one old/new pair.
    pub fn before_update_compare(&self, old: &T, new: &mut Candidate<T>) -> DbResult<()> {
        self.run_before(TriggerKinds::BEFORE_UPDATE_COMPARE, |t| {
            t.before_update_compare(old, new)
        })
    }

    /// Runs after-update hooks.
    pub fn after_update(&self, rows: &[T]) -> DbResult<()> {
        self.run_before(TriggerKinds::AFTER_UPDATE, |t| t.after_update(rows))
    }
}

impl<T: Row> fmt::Debug for TriggerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerSet")
            .field("len", &self.triggers.len())
            .finish()
    }
}
