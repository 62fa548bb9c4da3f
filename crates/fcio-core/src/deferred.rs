use crate::depth::DepthWork;
use crate::events::MgmtEvent;
use anyhow::{Context, Result};
use async_channel::{Receiver, Sender, TryRecvError};
use std::thread::{self, JoinHandle};
use tracing::{Level, debug, info, trace};

/// Work the completion path hands off instead of doing inline.
#[derive(Debug)]
pub(crate) enum DeferredWork {
    Depth(DepthWork),
    Event(MgmtEvent),
    Shutdown,
}

/// Unbounded queue between completion context and the deferred worker.
#[derive(Debug)]
pub(crate) struct DeferredQueue {
    tx: Sender<DeferredWork>,
    rx: Receiver<DeferredWork>,
}

impl DeferredQueue {
    pub(crate) fn new() -> Self {
        let (tx, rx) = async_channel::unbounded();
        Self { tx, rx }
    }

    pub(crate) fn post(&self, work: DeferredWork) {
        if let Err(err) = self.tx.try_send(work) {
            trace!(?err, "deferred queue closed");
        }
    }

    pub(crate) fn try_next(&self) -> Option<DeferredWork> {
        match self.rx.try_recv() {
            Ok(work) => Some(work),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.rx.len()
    }

    /// Run `process` on a dedicated thread until shut down or until it
    /// returns `false`.
    pub(crate) fn spawn_worker<F>(&self, name: &str, mut process: F) -> Result<WorkerHandle>
    where
        F: FnMut(DeferredWork) -> bool + Send + 'static,
    {
        let rx = self.rx.clone();
        let span = tracing::span!(Level::INFO, "deferred", worker = name);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let _enter = span.enter();
                info!("starting deferred worker");
                while let Ok(work) = rx.recv_blocking() {
                    if matches!(work, DeferredWork::Shutdown) || !process(work) {
                        break;
                    }
                }
                debug!("deferred worker exiting");
            })
            .with_context(|| format!("spawn {name}"))?;
        Ok(WorkerHandle {
            tx: self.tx.clone(),
            join: Some(join),
        })
    }
}

/// Stops the deferred worker when dropped.
#[derive(Debug)]
pub struct WorkerHandle {
    tx: Sender<DeferredWork>,
    join: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.tx.try_send(DeferredWork::Shutdown);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depth::DepthWork;
    use std::sync::{Arc, Mutex};

    #[test]
    fn worker_processes_until_shutdown() {
        let queue = DeferredQueue::new();
        let seen = Arc::new(Mutex::new(0usize));
        let counter = seen.clone();
        let worker = queue
            .spawn_worker("fcio-test-deferred", move |_| {
                *counter.lock().unwrap() += 1;
                true
            })
            .unwrap();
        queue.post(DeferredWork::Depth(DepthWork::RampDown));
        queue.post(DeferredWork::Depth(DepthWork::RampUp));
        worker.shutdown();
        assert_eq!(*seen.lock().unwrap(), 2);
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn try_next_drains_in_order() {
        let queue = DeferredQueue::new();
        queue.post(DeferredWork::Depth(DepthWork::RampDown));
        queue.post(DeferredWork::Depth(DepthWork::RampUp));
        assert!(matches!(
            queue.try_next(),
            Some(DeferredWork::Depth(DepthWork::RampDown))
        ));
        assert!(matches!(
            queue.try_next(),
            Some(DeferredWork::Depth(DepthWork::RampUp))
        ));
        assert!(queue.try_next().is_none());
    }
}
