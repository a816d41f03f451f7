//! Background worker that reacts to path changes.
//!
//! A single thread parks on a condition variable until either a new path is
//! set or the watcher shuts down. Every change runs the callback once with the
//! latest path; changes that arrive while the callback runs are coalesced.

use std::{
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread::JoinHandle,
};

use anyhow::Context as _;

#[derive(Debug, Default)]
struct WatchState {
    path: Option<PathBuf>,
    generation: u64,
    shutdown: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<WatchState>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub struct PathWatcher {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl PathWatcher {
    pub fn spawn<F>(mut on_change: F) -> anyhow::Result<Self>
    where
        F: FnMut(&Path) + Send + 'static,
    {
        let shared = Arc::new(Shared::default());
        let worker_shared = Arc::clone(&shared);
        let worker = std::thread::Builder::new()
            .name("path-watcher".to_string())
            .spawn(move || {
                let mut seen = 0;
                loop {
                    let path = {
                        let mut state = worker_shared.lock();
                        while !state.shutdown && state.generation == seen {
                            state = worker_shared
                                .wake
                                .wait(state)
                                .unwrap_or_else(PoisonError::into_inner);
                        }
                        if state.shutdown {
                            break;
                        }
                        seen = state.generation;
                        state.path.clone()
                    };
                    if let Some(path) = path {
                        log::debug!("Path changed to {}", path.display());
                        on_change(&path);
                    }
                }
                log::debug!("Path watcher stopped");
            })
            .context("Failed to spawn the path watcher thread")?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    /// Wakes the worker with a new path.
    pub fn set_path(&self, path: impl Into<PathBuf>) {
        let mut state = self.shared.lock();
        state.path = Some(path.into());
        state.generation += 1;
        self.shared.wake.notify_one();
    }

    pub fn path(&self) -> Option<PathBuf> {
        self.shared.lock().path.clone()
    }

    /// Stops the worker and waits for it. Called by `Drop` as well.
    pub fn shutdown(&mut self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            self.shared.wake.notify_one();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Path watcher thread panicked");
            }
        }
    }
}

impl Drop for PathWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::mpsc, time::Duration};

    use super::*;

    #[test]
    fn reports_changes_and_joins_on_drop() {
        let (tx, rx) = mpsc::channel();
        let watcher = PathWatcher::spawn(move |path| {
            let _ = tx.send(path.to_path_buf());
        })
        .expect("spawn");
        watcher.set_path("assets/models");
        let seen = rx.recv_timeout(Duration::from_secs(5)).expect("change");
        assert_eq!(seen, PathBuf::from("assets/models"));
        assert_eq!(watcher.path(), Some(PathBuf::from("assets/models")));
        drop(watcher);
        // the callback (and with it the sender) is gone once the thread joined
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_err());
    }
}
