//! Thread-safe handle the transport calls into.
//!
//! The transport may accept connections on many threads, but every call into
//! the session goes through one mutex, so two ticks never update agent state
//! at the same time. Shutdown refuses new ticks, waits for the tick in flight
//! by taking the same lock, then lets the session persist what it holds.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::core::{MatchResult, ServiceError, TickRequest, TickResponse};
use crate::training::{SessionControl, TrainingSession};

/// Cloneable, serialized access to a [`TrainingSession`].
pub struct TrainingService<S: TrainingSession> {
    session: Arc<Mutex<S>>,
    shutting_down: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl<S: TrainingSession> Clone for TrainingService<S> {
    fn clone(&self) -> Self {
        Self {
            session: Arc::clone(&self.session),
            shutting_down: Arc::clone(&self.shutting_down),
            stopped: Arc::clone(&self.stopped),
        }
    }
}

impl<S: TrainingSession> TrainingService<S> {
    pub fn new(session: S) -> Self {
        Self {
            session: Arc::new(Mutex::new(session)),
            shutting_down: Arc::new(AtomicBool::new(false)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, S>, ServiceError> {
        self.session.lock().map_err(|_| ServiceError::Poisoned)
    }

    /// Handle one tick. The action decision is returned before any
    /// checkpoint the tick triggered reaches storage.
    pub fn tick(&self, request: &TickRequest) -> Result<TickResponse, ServiceError> {
        let mut session = self.lock()?;
        // Checked under the lock so nothing runs after `shutdown` took it.
        if self.is_shutting_down() {
            return Err(ServiceError::ShuttingDown);
        }
        session.on_tick(request)
    }

    /// Forward an end-of-match notification. Refused once shutdown began,
    /// since the session has already flushed its final checkpoint.
    pub fn match_result(&self, result: MatchResult) -> Result<SessionControl, ServiceError> {
        let mut session = self.lock()?;
        if self.is_shutting_down() {
            return Err(ServiceError::ShuttingDown);
        }
        let control = session.on_match_result(result)?;
        drop(session);
        if control == SessionControl::Stop && !self.stopped.swap(true, Ordering::SeqCst) {
            info!("session requested stop");
        }
        Ok(control)
    }

    /// Refuse further ticks without waiting for anything.
    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Whether the session has asked the transport to stop.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Stop accepting ticks, let the in-flight tick finish, then flush.
    pub fn shutdown(&self) -> Result<(), ServiceError> {
        self.request_shutdown();
        let mut session = self.lock()?;
        let result = session.shutdown();
        if let Err(err) = &result {
            warn!(error = %err, "session shutdown failed");
        } else {
            info!("training service shut down");
        }
        result
    }

    /// Run `f` with exclusive access to the session.
    pub fn with_session<R>(&self, f: impl FnOnce(&mut S) -> R) -> Result<R, ServiceError> {
        Ok(f(&mut *self.lock()?))
    }
}

impl<S: TrainingSession> std::fmt::Debug for TrainingService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingService")
            .field("shutting_down", &self.is_shutting_down())
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
