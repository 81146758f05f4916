//! Process runtime: one interpreter and one OS thread per declared process.
//!
//! Every process starts from a copy of the global frame computed once by the
//! host interpreter, runs its `init` function to produce its first state, then
//! folds incoming messages into that state with its handler until it asks to
//! exit. Process 0 runs on the calling thread.
//!
//! A fatal error in any process closes every mailbox, so that all other
//! loops wind down, and the first error reported becomes the result of the
//! run.

use crate::config::VmConfig;
use crate::error::VmError;
use crate::interpreter::Interpreter;
use crate::link::LinkedProgram;
use crossbeam_channel::{self as cb};
use kestrel_core::{ProcessDecl, Value};
use kestrel_runtime::{ProcessHandle, ProcessRegistry, ProcessStatus};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, info_span, trace, warn};

/// How a process ended.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessReport {
    pub name: String,
    pub final_state: Value,
    /// Lines printed by the process.
    pub output: Vec<String>,
}

type Worker = JoinHandle<Option<ProcessReport>>;

/// Run every process of the program's container until all of them exit.
pub fn run_processes(
    linked: &Arc<LinkedProgram>,
    globals: &[Value],
    config: &VmConfig,
) -> Result<Vec<ProcessReport>, VmError> {
    let container = linked
        .program()
        .container
        .as_ref()
        .ok_or_else(|| VmError::Runtime("program declares no processes".into()))?;
    let registry: Arc<ProcessRegistry<Value>> = Arc::new(ProcessRegistry::new(
        container
            .processes
            .iter()
            .map(|p| (p.name.as_str(), p.message_type)),
    ));
    info!(
        container = %container.name,
        processes = registry.len(),
        "starting process runtime"
    );

    let (errors_tx, errors_rx) = cb::unbounded::<VmError>();
    let mut workers: Vec<(String, Worker)> = Vec::new();

    for (index, decl) in container.processes.iter().enumerate().skip(1) {
        let process = Process {
            index,
            decl: decl.clone(),
            linked: Arc::clone(linked),
            registry: Arc::clone(&registry),
            globals: globals.to_vec(),
            config: config.clone(),
            errors: errors_tx.clone(),
        };
        let spawned = thread::Builder::new()
            .name(format!("kestrel-process-{}", decl.name))
            .spawn(move || process.supervise());
        match spawned {
            Ok(handle) => workers.push((decl.name.clone(), handle)),
            Err(e) => {
                registry.shutdown();
                join_all(workers, &errors_tx);
                return Err(VmError::Runtime(format!(
                    "cannot start process '{}': {}",
                    decl.name, e
                )));
            }
        }
    }

    let mut reports = Vec::with_capacity(container.processes.len());
    if let Some(first) = container.processes.first() {
        let main = Process {
            index: 0,
            decl: first.clone(),
            linked: Arc::clone(linked),
            registry: Arc::clone(&registry),
            globals: globals.to_vec(),
            config: config.clone(),
            errors: errors_tx.clone(),
        };
        reports.extend(main.supervise());
    }
    reports.extend(join_all(workers, &errors_tx));
    drop(errors_tx);

    if let Ok(err) = errors_rx.try_recv() {
        return Err(err);
    }
    info!(processes = reports.len(), "process runtime finished");
    Ok(reports)
}

fn join_all(workers: Vec<(String, Worker)>, errors: &cb::Sender<VmError>) -> Vec<ProcessReport> {
    let mut reports = Vec::with_capacity(workers.len());
    for (name, worker) in workers {
        match worker.join() {
            Ok(report) => reports.extend(report),
            Err(_) => {
                let _ = errors.send(VmError::Runtime(format!("process '{}' panicked", name)));
            }
        }
    }
    reports
}

/// Everything one process thread needs.
struct Process {
    index: usize,
    decl: ProcessDecl,
    linked: Arc<LinkedProgram>,
    registry: Arc<ProcessRegistry<Value>>,
    globals: Vec<Value>,
    config: VmConfig,
    errors: cb::Sender<VmError>,
}

impl Process {
    /// Run the process, turning an error or panic into a runtime-wide
    /// shutdown.
    fn supervise(self) -> Option<ProcessReport> {
        let handle = match self.registry.get(self.index) {
            Some(h) => Arc::clone(h),
            None => {
                let _ = self.errors.send(VmError::Runtime(format!(
                    "process #{} is not registered",
                    self.index
                )));
                self.registry.shutdown();
                return None;
            }
        };
        let span = info_span!("process", name = %self.decl.name, index = self.index);
        let _enter = span.enter();

        let outcome = catch_unwind(AssertUnwindSafe(|| self.run(&handle)))
            .unwrap_or_else(|panic| Err(VmError::Runtime(panic_message(panic.as_ref()))));
        match outcome {
            Ok(report) => Some(report),
            Err(e) => {
                handle.set_status(ProcessStatus::Failed);
                warn!(error = %e, "process failed, shutting down");
                // Report before waking the others, so the root cause is the
                // first error on the channel.
                let _ = self.errors.send(e);
                self.registry.shutdown();
                None
            }
        }
    }

    fn run(&self, handle: &Arc<ProcessHandle<Value>>) -> Result<ProcessReport, VmError> {
        let mut interp = Interpreter::with_globals(
            Arc::clone(&self.linked),
            self.config.clone(),
            self.globals.clone(),
        )?;
        interp.attach_process(Arc::clone(&self.registry), Arc::clone(handle));

        handle.set_status(ProcessStatus::RunningInit);
        info!("process started");
        let mut state = interp.call_function(self.decl.init, &[])?;
        let mut handled = 0u64;

        while !handle.exit_requested() {
            handle.set_status(ProcessStatus::WaitingForMessage);
            let Some(msg) = handle.mailbox().wait_pop() else {
                debug!("mailbox closed");
                break;
            };
            handle.set_status(ProcessStatus::HandlingMessage);
            trace!(handled, "handling message");
            state = interp.call_function(self.decl.handler, &[state, msg])?;
            handled += 1;
        }

        handle.mailbox().close();
        handle.set_status(ProcessStatus::Exited);
        info!(handled, "process exited");
        Ok(ProcessReport {
            name: self.decl.name.clone(),
            final_state: state,
            output: interp.take_output(),
        })
    }
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else {
        "panicked".to_string()
    }
}
