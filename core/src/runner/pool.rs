//! One task per simulated user

use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::{RunError, RunResult};
use crate::events::Events;

use super::rate::IterationRateLimiter;
use super::user::{User, UserClass, UserContext};

struct UserHandle {
    user_id: u64,
    class: usize,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// The running users of one process
///
/// Each user is a tokio task owning a `oneshot` stop receiver. Users are
/// stopped newest first, so a scale-down keeps the class mix balanced.
pub(crate) struct UserPool {
    classes: Vec<UserClass>,
    events: Arc<Events>,
    limiter: Arc<IterationRateLimiter>,
    users: Vec<UserHandle>,
    per_class: Vec<usize>,
    next_user_id: u64,
}

impl UserPool {
    pub(crate) fn new(
        classes: Vec<UserClass>,
        events: Arc<Events>,
        limiter: Arc<IterationRateLimiter>,
    ) -> Self {
        let per_class = vec![0; classes.len()];
        Self {
            classes,
            events,
            limiter,
            users: Vec::new(),
            per_class,
            next_user_id: 0,
        }
    }

    /// Active users
    pub(crate) fn len(&self) -> usize {
        self.users.len()
    }

    /// Active users per class name
    pub(crate) fn class_counts(&self) -> Vec<(String, usize)> {
        self.classes
            .iter()
            .zip(&self.per_class)
            .map(|(class, count)| (class.name().to_string(), *count))
            .collect()
    }

    /// The class furthest below its weighted share
    ///
    /// Deterministic: ties go to the class registered first.
    fn next_class(&self) -> Option<usize> {
        (0..self.classes.len())
            .filter(|&idx| self.classes[idx].weight() > 0)
            .min_by(|&a, &b| {
                let load =
                    |idx: usize| self.per_class[idx] as f64 / self.classes[idx].weight() as f64;
                load(a)
                    .partial_cmp(&load(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.cmp(&b))
            })
    }

    /// Instantiate and start one user
    pub(crate) fn spawn_one(&mut self) -> RunResult<()> {
        let idx = self
            .next_class()
            .ok_or_else(|| RunError::spawn("no user classes with a positive weight"))?;
        let class = &self.classes[idx];
        let user = class.instantiate().map_err(|e| {
            RunError::spawn(format!("failed to create user of class {}: {e}", class.name()))
        })?;

        let user_id = self.next_user_id;
        self.next_user_id += 1;
        let ctx = UserContext::new(user_id, class, Arc::clone(&self.events));
        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(run_user(user, ctx, stop_rx, Arc::clone(&self.limiter)));

        self.per_class[idx] += 1;
        self.users.push(UserHandle {
            user_id,
            class: idx,
            stop_tx,
            task,
        });
        tracing::trace!(user_id, class = self.classes[idx].name(), "User spawned");
        Ok(())
    }

    /// Signal the newest user to stop; the returned task ends after its
    /// current iteration
    pub(crate) fn stop_one(&mut self) -> Option<JoinHandle<()>> {
        let handle = self.users.pop()?;
        self.per_class[handle.class] -= 1;
        let _ = handle.stop_tx.send(());
        tracing::trace!(user_id = handle.user_id, "User signalled to stop");
        Some(handle.task)
    }

    /// Signal every user to stop and hand back their tasks
    pub(crate) fn stop_all(&mut self) -> Vec<JoinHandle<()>> {
        let mut tasks = Vec::with_capacity(self.users.len());
        while let Some(task) = self.stop_one() {
            tasks.push(task);
        }
        tasks
    }
}

/// Wait for stopped user tasks to finish
pub(crate) async fn join_users(tasks: Vec<JoinHandle<()>>) {
    for result in futures::future::join_all(tasks).await {
        if let Err(e) = result {
            if e.is_panic() {
                tracing::error!(error = %e, "User task panicked");
            }
        }
    }
}

/// The user loop: iterate until stopped
async fn run_user(
    mut user: Box<dyn User>,
    ctx: UserContext,
    mut stop_rx: oneshot::Receiver<()>,
    limiter: Arc<IterationRateLimiter>,
) {
    user.on_start(&ctx).await;

    loop {
        // Sent or dropped sender both mean stop
        if !matches!(stop_rx.try_recv(), Err(oneshot::error::TryRecvError::Empty)) {
            break;
        }

        if limiter.is_enabled() {
            tokio::select! {
                biased;
                _ = &mut stop_rx => break,
                _ = limiter.wait() => {}
            }
        }

        if let Err(e) = user.run(&ctx).await {
            tracing::warn!(
                user_id = ctx.user_id(),
                class = ctx.class_name(),
                error = %e,
                "User iteration failed"
            );
        }

        let wait = user.wait_time();
        if wait.is_zero() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            biased;
            _ = &mut stop_rx => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }

    user.on_stop(&ctx).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::user::IterationResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Counting {
        iterations: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl User for Counting {
        async fn run(&mut self, _ctx: &UserContext) -> IterationResult {
            self.iterations.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn wait_time(&self) -> Duration {
            Duration::from_secs(1)
        }

        async fn on_stop(&mut self, _ctx: &UserContext) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn counting_class(
        name: &str,
        weight: u32,
        iterations: &Arc<AtomicUsize>,
        stopped: &Arc<AtomicUsize>,
    ) -> UserClass {
        let iterations = Arc::clone(iterations);
        let stopped = Arc::clone(stopped);
        UserClass::from_fn(name, move || Counting {
            iterations: Arc::clone(&iterations),
            stopped: Arc::clone(&stopped),
        })
        .with_weight(weight)
    }

    fn pool(classes: Vec<UserClass>) -> UserPool {
        UserPool::new(
            classes,
            Arc::new(Events::new()),
            Arc::new(IterationRateLimiter::unlimited()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_weighted_class_selection() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut pool = pool(vec![
            counting_class("light", 1, &iterations, &stopped),
            counting_class("heavy", 3, &iterations, &stopped),
        ]);

        for _ in 0..8 {
            pool.spawn_one().unwrap();
        }

        assert_eq!(
            pool.class_counts(),
            vec![("light".to_string(), 2), ("heavy".to_string(), 6)]
        );
        join_users(pool.stop_all()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all_waits_for_users() {
        let iterations = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        let mut pool = pool(vec![counting_class("u", 1, &iterations, &stopped)]);

        for _ in 0..5 {
            pool.spawn_one().unwrap();
        }
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        // Three iterations each: t=0, t=1, t=2
        assert_eq!(iterations.load(Ordering::SeqCst), 15);

        join_users(pool.stop_all()).await;
        assert_eq!(pool.len(), 0);
        assert_eq!(stopped.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_a_spawn_error() {
        let mut pool = pool(vec![UserClass::new("broken", || Err("boom".into()))]);
        let err = pool.spawn_one().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Spawn);
        assert!(err.message.contains("broken"));
        assert_eq!(pool.len(), 0);
    }

    #[tokio::test]
    async fn test_no_classes() {
        let mut pool = pool(Vec::new());
        assert!(pool.spawn_one().is_err());
    }
}
