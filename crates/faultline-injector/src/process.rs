//! ---
//! ems_section: "07-resilience-fault-tolerance"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Process discovery and termination for service crash faults."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::debug;

use crate::error::{FaultError, Result};

/// POSIX signal used to terminate a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TerminationSignal {
    /// `SIGTERM`, lets the process shut down cleanly.
    Term,
    /// `SIGKILL`, immediate termination.
    Kill,
}

impl TerminationSignal {
    pub fn for_graceful(graceful: bool) -> Self {
        if graceful {
            TerminationSignal::Term
        } else {
            TerminationSignal::Kill
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationSignal::Term => "SIGTERM",
            TerminationSignal::Kill => "SIGKILL",
        }
    }

    fn as_nix(&self) -> Signal {
        match self {
            TerminationSignal::Term => Signal::SIGTERM,
            TerminationSignal::Kill => Signal::SIGKILL,
        }
    }
}

/// Resolves service names to process ids and delivers termination signals.
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    async fn find_pids(&self, name: &str) -> Result<Vec<i32>>;
    async fn signal(&self, pid: i32, signal: TerminationSignal) -> Result<()>;
}

/// Inspector backed by `pgrep` and `kill(2)`.
#[derive(Debug, Clone, Default)]
pub struct SystemProcessInspector;

impl SystemProcessInspector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProcessInspector for SystemProcessInspector {
    async fn find_pids(&self, name: &str) -> Result<Vec<i32>> {
        let output = Command::new("pgrep")
            .arg("-f")
            .arg(name)
            .output()
            .await
            .map_err(|err| FaultError::ProcessLookup {
                name: name.to_owned(),
                reason: err.to_string(),
            })?;

        let own_pid = std::process::id() as i32;
        let pids = pgrep_outcome(
            name,
            output.status.code(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )?
        .into_iter()
        .filter(|pid| *pid != own_pid)
        .collect::<Vec<_>>();
        debug!(process = name, count = pids.len(), "resolved process ids");
        Ok(pids)
    }

    async fn signal(&self, pid: i32, signal: TerminationSignal) -> Result<()> {
        signal::kill(Pid::from_raw(pid), signal.as_nix()).map_err(|errno| FaultError::Signal {
            pid,
            reason: errno.to_string(),
        })
    }
}

/// Map a `pgrep` exit to pids: 0 is a match, 1 is no match, anything else
/// (2 syntax error, 3 fatal, killed by a signal) is a lookup failure.
fn pgrep_outcome(name: &str, code: Option<i32>, stdout: &str, stderr: &str) -> Result<Vec<i32>> {
    match code {
        Some(0) => Ok(parse_pid_list(stdout)),
        Some(1) => Ok(Vec::new()),
        other => Err(FaultError::ProcessLookup {
            name: name.to_owned(),
            reason: match other {
                Some(code) => format!("pgrep exited with {code}: {}", stderr.trim()),
                None => "pgrep terminated by signal".to_owned(),
            },
        }),
    }
}

fn parse_pid_list(stdout: &str) -> Vec<i32> {
    stdout
        .lines()
        .filter_map(|line| line.trim().parse::<i32>().ok())
        .collect()
}

#[derive(Debug, Default)]
struct StaticTable {
    processes: BTreeMap<String, Vec<i32>>,
    exited: BTreeSet<i32>,
    signals: Vec<(i32, TerminationSignal)>,
}

/// In-memory process table for tests and dry runs.
///
/// Signalled pids are removed from the table; pids marked exited fail to signal.
#[derive(Debug, Clone, Default)]
pub struct StaticProcessInspector {
    table: Arc<Mutex<StaticTable>>,
}

impl StaticProcessInspector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_process(self, name: impl Into<String>, pids: impl IntoIterator<Item = i32>) -> Self {
        self.table
            .lock()
            .processes
            .entry(name.into())
            .or_default()
            .extend(pids);
        self
    }

    /// Make signals to `pid` fail as if the process had already exited.
    pub fn mark_exited(&self, pid: i32) {
        self.table.lock().exited.insert(pid);
    }

    /// Signals delivered so far, in order.
    pub fn signals(&self) -> Vec<(i32, TerminationSignal)> {
        self.table.lock().signals.clone()
    }
}

#[async_trait]
impl ProcessInspector for StaticProcessInspector {
    async fn find_pids(&self, name: &str) -> Result<Vec<i32>> {
        Ok(self
            .table
            .lock()
            .processes
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn signal(&self, pid: i32, signal: TerminationSignal) -> Result<()> {
        let mut table = self.table.lock();
        if table.exited.contains(&pid) {
            return Err(FaultError::Signal {
                pid,
                reason: "ESRCH: No such process".into(),
            });
        }
        table.signals.push((pid, signal));
        for pids in table.processes.values_mut() {
            pids.retain(|candidate| *candidate != pid);
        }
        Ok(())
    }
}
