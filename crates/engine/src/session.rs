//! Per-client frame queues and cancel flags.
//!
//! A [`Session`] is shared between the socket that drains its queue and the
//! worker thread that fills it. Progress frames are best effort; every other
//! frame waits for queue capacity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Frames buffered per session before progress frames start being dropped.
pub const QUEUE_CAPACITY: usize = 256;

pub struct Session {
    id: Uuid,
    sender: mpsc::Sender<Vec<u8>>,
    cancel: AtomicBool,
    closed: AtomicBool,
    active: AtomicUsize,
    idle: Notify,
}

impl Session {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        Self::with_capacity(QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            sender,
            cancel: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            idle: Notify::new(),
        });
        (session, receiver)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Read and clear the cancel flag.
    pub fn take_cancel(&self) -> bool {
        self.cancel.swap(false, Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Queue a progress frame without waiting. Returns false when dropped.
    pub fn send_progress(&self, frame: Vec<u8>) -> bool {
        if self.is_closed() {
            return false;
        }
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Session {} queue full, dropping progress frame", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a frame from a blocking thread, waiting for capacity.
    ///
    /// Must not be called from inside an async task.
    pub fn send_blocking(&self, frame: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        if self.sender.blocking_send(frame).is_err() {
            debug!("Session {} receiver is gone", self.id);
        }
    }

    /// Queue a frame from async code, waiting for capacity.
    pub async fn send(&self, frame: Vec<u8>) {
        if self.is_closed() {
            return;
        }
        if self.sender.send(frame).await.is_err() {
            debug!("Session {} receiver is gone", self.id);
        }
    }

    /// Mark a request as running on behalf of this session until the guard
    /// is dropped.
    pub fn track(self: &Arc<Self>) -> TaskGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        TaskGuard {
            session: Arc::clone(self),
        }
    }

    pub fn active_tasks(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Cancel running work, wait for it to finish, and stop emitting frames.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.request_cancel();
        loop {
            let notified = self.idle.notified();
            if self.active.load(Ordering::SeqCst) == 0 {
                break;
            }
            notified.await;
        }
        debug!("Session {} shut down", self.id);
    }
}

/// Keeps a session's task count raised while alive.
pub struct TaskGuard {
    session: Arc<Session>,
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        if self.session.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.session.idle.notify_waiters();
        }
    }
}

/// Connected sessions keyed by id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session and return the receiver its socket drains.
    pub async fn open(&self) -> (Arc<Session>, mpsc::Receiver<Vec<u8>>) {
        let (session, receiver) = Session::new();
        self.sessions.write().await.insert(session.id(), Arc::clone(&session));
        info!("Session {} opened", session.id());
        (session, receiver)
    }

    pub async fn get(&self, id: Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// Remove a session and wait for its running tasks.
    pub async fn close(&self, id: Uuid) {
        let session = self.sessions.write().await.remove(&id);
        if let Some(session) = session {
            session.shutdown().await;
            info!("Session {} closed", id);
        }
    }

    /// Set the cancel flag of a session. Returns false for unknown ids.
    pub async fn cancel(&self, id: Uuid) -> bool {
        match self.get(id).await {
            Some(session) => {
                session.request_cancel();
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn cancel_flag_is_cleared_when_taken() {
        let (session, _rx) = Session::new();
        assert!(!session.take_cancel());
        session.request_cancel();
        assert!(session.take_cancel());
        assert!(!session.take_cancel());
    }

    #[test]
    fn progress_frames_drop_when_full() {
        let (session, mut rx) = Session::with_capacity(2);
        assert!(session.send_progress(vec![1]));
        assert!(session.send_progress(vec![2]));
        assert!(!session.send_progress(vec![3]));
        assert_eq!(rx.try_recv().unwrap(), vec![1]);
        assert_eq!(rx.try_recv().unwrap(), vec![2]);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn blocking_send_outside_runtime() {
        let (session, mut rx) = Session::with_capacity(1);
        session.send_blocking(vec![7]);
        assert_eq!(rx.try_recv().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn shutdown_waits_for_tasks() {
        let (session, mut rx) = Session::new();
        let guard = session.track();
        assert_eq!(session.active_tasks(), 1);

        let waiter = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        assert!(session.take_cancel());

        drop(guard);
        waiter.await.unwrap();
        assert_eq!(session.active_tasks(), 0);

        session.send(vec![1]).await;
        assert!(!session.send_progress(vec![2]));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn registry_routes_cancel_by_id() {
        let registry = SessionRegistry::new();
        let (session, _rx) = registry.open().await;
        assert!(registry.cancel(session.id()).await);
        assert!(!registry.cancel(Uuid::new_v4()).await);
        assert!(session.take_cancel());

        registry.close(session.id()).await;
        assert!(registry.get(session.id()).await.is_none());
        assert!(registry.is_empty().await);
    }
}
