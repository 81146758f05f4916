//! Kestrel Runtime
//!
//! Provides mailboxes and the process registry used by the VM's actor
//! container.

pub mod mailbox;
pub mod process;

pub use mailbox::Mailbox;
pub use process::{ProcessHandle, ProcessRegistry, ProcessStatus, SendError};
