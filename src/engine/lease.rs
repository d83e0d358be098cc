use tokio::task::JoinHandle;

/// Handle to a background task owned by the driver session. Dropping the
/// lease aborts the task.
#[derive(Debug)]
pub struct TaskLease {
    name: &'static str,
    handle: JoinHandle<()>,
}

impl TaskLease {
    pub fn spawn<F>(name: &'static str, task: F) -> Self
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        Self {
            name,
            handle: tokio::spawn(task),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for TaskLease {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Every timer and watch a logged-in, online driver keeps alive.
#[derive(Debug, Default)]
pub struct SessionTasks {
    pub reclaimer: Option<TaskLease>,
    pub sync_fallback: Option<TaskLease>,
    pub realtime: Option<TaskLease>,
    pub location_debounce: Option<TaskLease>,
}

impl SessionTasks {
    pub fn is_running(&self) -> bool {
        self.reclaimer.is_some() || self.sync_fallback.is_some() || self.realtime.is_some()
    }

    pub fn running(&self) -> Vec<&'static str> {
        [
            &self.reclaimer,
            &self.sync_fallback,
            &self.realtime,
            &self.location_debounce,
        ]
        .into_iter()
        .flatten()
        .filter(|lease| !lease.is_finished())
        .map(TaskLease::name)
        .collect()
    }

    pub fn clear(&mut self) {
        *self = SessionTasks::default();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn dropping_lease_stops_the_task() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let lease = TaskLease::spawn("ticker", async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        let before = ticks.load(Ordering::SeqCst);
        assert!(before >= 3);

        drop(lease);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), before);
    }

    #[tokio::test]
    async fn clear_releases_every_lease() {
        let mut tasks = SessionTasks {
            reclaimer: Some(TaskLease::spawn("reclaimer", std::future::pending())),
            sync_fallback: Some(TaskLease::spawn("sync_fallback", std::future::pending())),
            realtime: None,
            location_debounce: None,
        };
        assert!(tasks.is_running());
        assert_eq!(tasks.running(), vec!["reclaimer", "sync_fallback"]);

        tasks.clear();
        assert!(!tasks.is_running());
        assert!(tasks.running().is_empty());
    }
}
