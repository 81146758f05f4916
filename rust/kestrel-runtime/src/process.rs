//! Process handles and the name registry.
//!
//! A [`ProcessHandle`] is the shared face of one running process: its name,
//! the message type its mailbox accepts, the mailbox itself and the exit flag.
//! The [`ProcessRegistry`] is built once before any process starts and is
//! only read afterwards.

use crate::mailbox::Mailbox;
use kestrel_core::TypeId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SendError {
    #[error("process '{process}' accepts messages of type {expected}, got {found}")]
    TypeMismatch {
        process: String,
        expected: TypeId,
        found: TypeId,
    },
    #[error("process '{process}' has shut down")]
    Closed { process: String },
}

// ---------------------------------------------------------------------------
// ProcessStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Uninitialized,
    RunningInit,
    WaitingForMessage,
    HandlingMessage,
    Exited,
    Failed,
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessStatus::Uninitialized => write!(f, "uninitialized"),
            ProcessStatus::RunningInit => write!(f, "running-init"),
            ProcessStatus::WaitingForMessage => write!(f, "waiting-for-message"),
            ProcessStatus::HandlingMessage => write!(f, "handling-message"),
            ProcessStatus::Exited => write!(f, "exited"),
            ProcessStatus::Failed => write!(f, "failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessHandle
// ---------------------------------------------------------------------------

pub struct ProcessHandle<T> {
    index: usize,
    name: String,
    message_type: TypeId,
    mailbox: Mailbox<T>,
    exit: AtomicBool,
    status: Mutex<ProcessStatus>,
}

impl<T> fmt::Debug for ProcessHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("message_type", &self.message_type)
            .field("status", &*self.status.lock())
            .finish()
    }
}

impl<T> ProcessHandle<T> {
    pub fn new(index: usize, name: impl Into<String>, message_type: TypeId) -> Self {
        Self {
            index,
            name: name.into(),
            message_type,
            mailbox: Mailbox::new(),
            exit: AtomicBool::new(false),
            status: Mutex::new(ProcessStatus::Uninitialized),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn message_type(&self) -> TypeId {
        self.message_type
    }

    pub fn mailbox(&self) -> &Mailbox<T> {
        &self.mailbox
    }

    /// Queue `msg` if its runtime type matches this process's message type.
    /// A mismatched message is never queued.
    pub fn deliver(&self, msg: T, ty: TypeId) -> Result<(), SendError> {
        if ty != self.message_type {
            return Err(SendError::TypeMismatch {
                process: self.name.clone(),
                expected: self.message_type,
                found: ty,
            });
        }
        if !self.mailbox.post(msg) {
            return Err(SendError::Closed {
                process: self.name.clone(),
            });
        }
        trace!(process = %self.name, "message queued");
        Ok(())
    }

    /// Ask the process loop to stop after the current message.
    pub fn request_exit(&self) {
        self.exit.store(true, Ordering::Release);
    }

    pub fn exit_requested(&self) -> bool {
        self.exit.load(Ordering::Acquire)
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: ProcessStatus) {
        *self.status.lock() = status;
    }
}

// ---------------------------------------------------------------------------
// ProcessRegistry
// ---------------------------------------------------------------------------

pub struct ProcessRegistry<T> {
    processes: Vec<Arc<ProcessHandle<T>>>,
    by_name: HashMap<String, usize>,
}

impl<T> fmt::Debug for ProcessRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.processes.iter()).finish()
    }
}

impl<T> ProcessRegistry<T> {
    /// Build the registry from `(name, message type)` pairs. Index 0 is the
    /// process that runs on the starting thread.
    pub fn new<'a>(decls: impl IntoIterator<Item = (&'a str, TypeId)>) -> Self {
        let mut processes = Vec::new();
        let mut by_name = HashMap::new();
        for (index, (name, ty)) in decls.into_iter().enumerate() {
            processes.push(Arc::new(ProcessHandle::new(index, name, ty)));
            by_name.entry(name.to_string()).or_insert(index);
        }
        Self { processes, by_name }
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Arc<ProcessHandle<T>>> {
        self.processes.get(index)
    }

    pub fn find(&self, name: &str) -> Option<&Arc<ProcessHandle<T>>> {
        self.by_name.get(name).and_then(|i| self.processes.get(*i))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ProcessHandle<T>>> {
        self.processes.iter()
    }

    /// Deliver `msg` to the process called `dest`. An unknown destination
    /// is a no-op and returns `Ok(false)`.
    pub fn send(&self, dest: &str, msg: T, ty: TypeId) -> Result<bool, SendError> {
        match self.find(dest) {
            Some(process) => process.deliver(msg, ty).map(|_| true),
            None => {
                trace!(dest, "send to unknown process ignored");
                Ok(false)
            }
        }
    }

    /// Close every mailbox so that all process loops wind down.
    pub fn shutdown(&self) {
        for p in &self.processes {
            p.mailbox.close();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ProcessRegistry<String> {
        ProcessRegistry::new([("main", TypeId::STRING), ("counter", TypeId::INT)])
    }

    #[test]
    fn lookup_by_name_and_index() {
        let reg = registry();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.find("counter").map(|p| p.index()), Some(1));
        assert_eq!(reg.get(0).map(|p| p.name().to_string()), Some("main".to_string()));
        assert!(reg.find("nobody").is_none());
    }

    #[test]
    fn matching_type_is_queued() {
        let reg = registry();
        assert_eq!(reg.send("main", "dec".into(), TypeId::STRING), Ok(true));
        assert_eq!(reg.find("main").unwrap().mailbox().try_pop(), Some("dec".to_string()));
    }

    #[test]
    fn mismatched_type_is_rejected_and_not_queued() {
        let reg = registry();
        let err = reg.send("counter", "dec".into(), TypeId::STRING).unwrap_err();
        assert_eq!(
            err,
            SendError::TypeMismatch {
                process: "counter".into(),
                expected: TypeId::INT,
                found: TypeId::STRING,
            }
        );
        assert!(reg.find("counter").unwrap().mailbox().is_empty());
    }

    #[test]
    fn unknown_destination_is_a_no_op() {
        let reg = registry();
        assert_eq!(reg.send("ghost", "hi".into(), TypeId::STRING), Ok(false));
        assert!(reg.iter().all(|p| p.mailbox().is_empty()));
    }

    #[test]
    fn shutdown_closes_every_mailbox() {
        let reg = registry();
        reg.shutdown();
        assert!(reg.iter().all(|p| p.mailbox().is_closed()));
        assert_eq!(
            reg.send("main", "late".into(), TypeId::STRING),
            Err(SendError::Closed {
                process: "main".into()
            })
        );
    }

    #[test]
    fn exit_flag_and_status() {
        let reg = registry();
        let p = reg.get(0).unwrap();
        assert!(!p.exit_requested());
        assert_eq!(p.status(), ProcessStatus::Uninitialized);
        p.request_exit();
        p.set_status(ProcessStatus::Exited);
        assert!(p.exit_requested());
        assert_eq!(p.status().to_string(), "exited");
    }
}
