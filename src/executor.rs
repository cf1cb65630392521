//! Bounded cooperative executor for attachment work.
//!
//! Nothing is spawned: tasks are plain futures polled together by the caller,
//! and a semaphore caps how many of them are past their admission point at
//! any moment. Output order always matches input order.

use std::future::Future;

use futures::future::join_all;
use tokio::sync::Semaphore;

/// Window for all attachment tasks of one record, by its total attachment
/// count.
pub fn record_window(total_attachments: usize) -> usize {
    match total_attachments {
        0..=6 => 6,
        7..=12 => 4,
        13..=30 => 3,
        _ => 2,
    }
}

/// Window for the items of a single attachment field.
pub fn field_window(items: usize) -> usize {
    match items {
        0..=4 => 4,
        5..=12 => 3,
        _ => 2,
    }
}

#[derive(Debug)]
pub struct BoundedExecutor {
    permits: Semaphore,
    window: usize,
}

impl BoundedExecutor {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            permits: Semaphore::new(window),
            window,
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    /// Run `task` once a slot is free.
    pub async fn run<F: Future>(&self, task: F) -> F::Output {
        // The semaphore is never closed, so acquisition only fails if that
        // invariant is broken; the task still runs, just unthrottled.
        let _permit = self.permits.acquire().await.ok();
        task.await
    }

    /// Run every task under this executor's window and collect the outputs
    /// in input order.
    pub async fn run_all<I, F>(&self, tasks: I) -> Vec<F::Output>
    where
        I: IntoIterator<Item = F>,
        F: Future,
    {
        join_all(tasks.into_iter().map(|t| self.run(t))).await
    }
}

/// The record and field windows an attachment task must both pass.
#[derive(Debug, Clone, Copy)]
pub struct Tiers<'a> {
    pub record: &'a BoundedExecutor,
    pub field: &'a BoundedExecutor,
}

impl Tiers<'_> {
    /// Run `task` holding a field slot and a record slot. Slots are always
    /// taken in that order and only around leaf work, so tiers never wait on
    /// each other in a cycle.
    pub async fn run<F: Future>(self, task: F) -> F::Output {
        self.field.run(self.record.run(task)).await
    }

    pub async fn run_all<I, F>(self, tasks: I) -> Vec<F::Output>
    where
        I: IntoIterator<Item = F>,
        F: Future,
    {
        join_all(tasks.into_iter().map(|t| self.run(t))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn window_tiers() {
        assert_eq!(record_window(0), 6);
        assert_eq!(record_window(6), 6);
        assert_eq!(record_window(7), 4);
        assert_eq!(record_window(12), 4);
        assert_eq!(record_window(30), 3);
        assert_eq!(record_window(31), 2);
        assert_eq!(field_window(4), 4);
        assert_eq!(field_window(12), 3);
        assert_eq!(field_window(13), 2);
    }

    async fn tracked(active: &Cell<usize>, peak: &Cell<usize>, value: usize) -> usize {
        active.set(active.get() + 1);
        peak.set(peak.get().max(active.get()));
        for _ in 0..3 {
            tokio::task::yield_now().await;
        }
        active.set(active.get() - 1);
        value
    }

    #[tokio::test]
    async fn caps_concurrency_and_keeps_order() {
        let exec = BoundedExecutor::new(3);
        let active = Cell::new(0);
        let peak = Cell::new(0);
        let out = exec
            .run_all((0..10).map(|i| tracked(&active, &peak, i)))
            .await;
        assert_eq!(out, (0..10).collect::<Vec<_>>());
        assert!(peak.get() <= 3, "peak concurrency {}", peak.get());
        assert!(peak.get() > 1, "tasks should interleave");
    }

    #[tokio::test]
    async fn nested_windows_respect_the_tighter_bound() {
        let record = BoundedExecutor::new(4);
        let field = BoundedExecutor::new(2);
        let active = Cell::new(0);
        let peak = Cell::new(0);
        let tasks = (0..8).map(|i| field.run(record.run(tracked(&active, &peak, i))));
        let out = join_all(tasks).await;
        assert_eq!(out.len(), 8);
        assert!(peak.get() <= 2);
    }

    #[tokio::test]
    async fn tiers_share_one_record_window_across_fields() {
        let record = BoundedExecutor::new(3);
        let fields = [BoundedExecutor::new(2), BoundedExecutor::new(2)];
        let active = Cell::new(0);
        let peak = Cell::new(0);
        let (active, peak) = (&active, &peak);
        let record = &record;
        let per_field = fields.iter().map(|field| {
            let tiers = Tiers { record, field };
            tiers.run_all((0..5).map(move |i| tracked(active, peak, i)))
        });
        let out = join_all(per_field).await;
        assert_eq!(out, vec![(0..5).collect::<Vec<_>>(); 2]);
        assert!(peak.get() <= 3, "peak concurrency {}", peak.get());
    }

    #[test]
    fn zero_window_is_clamped() {
        assert_eq!(BoundedExecutor::new(0).window(), 1);
    }
}
