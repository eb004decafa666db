//! Task group: a single-cycle fan-out primitive that waits for a set of jobs
//! and aggregates their errors.
//!
//! A [`TaskGroup`] pairs an outstanding-work counter with an ordered error
//! list behind one mutex. Jobs record failures with [`TaskGroup::error`]
//! instead of returning them to a caller, so one job's failure never aborts
//! its siblings. [`TaskGroup::wait`] collapses whatever was recorded:
//!
//! - nothing recorded: `Ok(())`
//! - one error: that error, unchanged
//! - two or more: an aggregate built from a [`MultiError`]
//!
//! A group is single-use. `wait` consumes the handle it is called on; waiting
//! on a second clone of the same group after the first `wait` returned sees an
//! empty error list and is a caller bug.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tokio::task::JoinError;

/// An ordered collection of two or more errors.
///
/// Displays as `multiple errors: e1 | e2 | ...` in recording order.
#[derive(Debug, PartialEq)]
pub struct MultiError<E> {
    errors: Vec<E>,
}

impl<E> MultiError<E> {
    /// Wrap a list of errors.
    ///
    /// # Panics
    ///
    /// Panics if fewer than two errors are given. A single error is returned
    /// as-is by [`TaskGroup::wait`] and never wrapped.
    pub fn new(errors: Vec<E>) -> Self {
        assert!(
            errors.len() >= 2,
            "MultiError requires at least 2 errors, got {}",
            errors.len()
        );
        Self { errors }
    }

    /// The wrapped errors, in recording order.
    pub fn errors(&self) -> &[E] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn into_inner(self) -> Vec<E> {
        self.errors
    }
}

impl<E: fmt::Display> fmt::Display for MultiError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("multiple errors: ")?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{err}")?;
        }
        Ok(())
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for MultiError<E> {}

/// Error types that a [`TaskGroup`] can collapse into a single value.
pub trait Aggregate: Sized {
    /// Build one error out of two or more.
    fn from_multi(errors: MultiError<Self>) -> Self;

    /// Split an aggregate back into its members; any other error is returned
    /// unchanged in `Err`.
    fn into_multi(self) -> Result<MultiError<Self>, Self>;
}

struct State<E> {
    outstanding: usize,
    errors: Vec<E>,
}

struct Inner<E> {
    state: Mutex<State<E>>,
    idle: Notify,
}

/// Tracks outstanding jobs and the errors they record.
///
/// Cloning is cheap; all clones share one counter and one error list.
pub struct TaskGroup<E> {
    inner: Arc<Inner<E>>,
}

impl<E> Clone for TaskGroup<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E> Default for TaskGroup<E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outstanding: 0,
                    errors: Vec::new(),
                }),
                idle: Notify::new(),
            }),
        }
    }
}

impl<E> fmt::Debug for TaskGroup<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("TaskGroup")
            .field("outstanding", &state.outstanding)
            .field("errors", &state.errors.len())
            .finish()
    }
}

impl<E> TaskGroup<E> {
    fn lock(&self) -> MutexGuard<'_, State<E>> {
        // The lock is never held across a panic point that leaves the state
        // half-written, so a poisoned guard is still consistent.
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<E: Aggregate> TaskGroup<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `n` jobs. Must be called before the jobs start.
    pub fn add(&self, n: usize) {
        self.lock().outstanding += n;
    }

    /// Mark one job as finished, waking waiters when none remain.
    ///
    /// # Panics
    ///
    /// Panics if called more times than jobs were added.
    pub fn done(&self) {
        let remaining = {
            let mut state = self.lock();
            state.outstanding = state
                .outstanding
                .checked_sub(1)
                .expect("TaskGroup::done called more times than add");
            state.outstanding
        };
        if remaining == 0 {
            self.inner.idle.notify_waiters();
        }
    }

    /// Record an error. Aggregates are flattened into their members.
    pub fn error(&self, err: E) {
        let mut state = self.lock();
        match err.into_multi() {
            Ok(multi) => state.errors.extend(multi.into_inner()),
            Err(err) => state.errors.push(err),
        }
    }

    /// Run `job` as an independent task registered with this group.
    ///
    /// The job's error, or its panic as a join error, is recorded before the
    /// job is marked done.
    pub fn spawn<F>(&self, job: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: From<JoinError> + Send + 'static,
    {
        self.add(1);
        let group = self.clone();
        tokio::spawn(async move {
            let outcome = match tokio::spawn(job).await {
                Ok(result) => result,
                Err(join_err) => Err(E::from(join_err)),
            };
            if let Err(err) = outcome {
                group.error(err);
            }
            group.done();
        });
    }

    /// Wait until every registered job is done, then collapse the recorded
    /// errors.
    pub async fn wait(self) -> Result<(), E> {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            // Register interest before checking so a `done` racing with the
            // check still wakes us.
            notified.as_mut().enable();
            if self.lock().outstanding == 0 {
                break;
            }
            notified.await;
        }

        let mut errors = std::mem::take(&mut self.lock().errors);
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(E::from_multi(MultiError::new(errors))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Failed(&'static str),
        Panicked,
        Multiple(MultiError<TestError>),
    }

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            match self {
                TestError::Failed(msg) => f.write_str(msg),
                TestError::Panicked => f.write_str("panicked"),
                TestError::Multiple(multi) => write!(f, "{multi}"),
            }
        }
    }

    impl Aggregate for TestError {
        fn from_multi(errors: MultiError<Self>) -> Self {
            TestError::Multiple(errors)
        }

        fn into_multi(self) -> Result<MultiError<Self>, Self> {
            match self {
                TestError::Multiple(multi) => Ok(multi),
                other => Err(other),
            }
        }
    }

    impl From<JoinError> for TestError {
        fn from(_: JoinError) -> Self {
            TestError::Panicked
        }
    }

    #[tokio::test]
    async fn test_wait_without_work_is_ok() {
        let group: TaskGroup<TestError> = TaskGroup::new();
        assert_eq!(group.wait().await, Ok(()));
    }

    #[tokio::test]
    async fn test_single_error_returned_unchanged() {
        let group = TaskGroup::new();
        group.error(TestError::Failed("boom"));
        assert_eq!(group.wait().await, Err(TestError::Failed("boom")));
    }

    #[tokio::test]
    async fn test_multiple_errors_aggregate_in_recording_order() {
        let group = TaskGroup::new();
        group.error(TestError::Failed("first"));
        group.error(TestError::Failed("second"));
        group.error(TestError::Failed("third"));

        let err = group.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "multiple errors: first | second | third");
        match err {
            TestError::Multiple(multi) => assert_eq!(multi.len(), 3),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recorded_aggregates_are_flattened() {
        let first = TaskGroup::new();
        first.error(TestError::Failed("a"));
        first.error(TestError::Failed("b"));
        let loaded = first.wait().await;

        let second = TaskGroup::new();
        if let Err(err) = loaded {
            second.error(err);
        }
        second.error(TestError::Failed("maintenance"));

        let err = second.wait().await.unwrap_err();
        assert_eq!(err.to_string(), "multiple errors: a | b | maintenance");
    }

    #[tokio::test]
    async fn test_wait_blocks_until_done() {
        let group: TaskGroup<TestError> = TaskGroup::new();
        group.add(2);

        let worker = group.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            worker.error(TestError::Failed("late"));
            worker.done();
            worker.done();
        });

        assert_eq!(group.wait().await, Err(TestError::Failed("late")));
    }

    #[tokio::test]
    async fn test_spawned_jobs_do_not_abort_siblings() {
        let group = TaskGroup::new();
        let finished = Arc::new(Mutex::new(Vec::new()));

        for name in ["a", "b", "c"] {
            let finished = Arc::clone(&finished);
            group.spawn(async move {
                if name == "b" {
                    return Err(TestError::Failed("b failed"));
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                finished.lock().unwrap().push(name);
                Ok(())
            });
        }

        assert_eq!(group.wait().await, Err(TestError::Failed("b failed")));
        let mut finished = finished.lock().unwrap().clone();
        finished.sort();
        assert_eq!(finished, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_panicking_job_is_recorded() {
        let group: TaskGroup<TestError> = TaskGroup::new();
        let explode = true;
        group.spawn(async move {
            if explode {
                panic!("job exploded");
            }
            Ok(())
        });
        assert_eq!(group.wait().await, Err(TestError::Panicked));
    }

    #[test]
    #[should_panic(expected = "more times than add")]
    fn test_done_without_add_panics() {
        let group: TaskGroup<TestError> = TaskGroup::new();
        group.done();
    }

    #[test]
    #[should_panic(expected = "at least 2 errors")]
    fn test_multi_error_rejects_single_member() {
        MultiError::new(vec![TestError::Failed("alone")]);
    }
}
