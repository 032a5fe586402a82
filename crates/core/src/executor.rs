use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::process::{Child, Command};

use anyhow::{Context, Result};
use sysinfo::{Pid, System};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started { pid: u32 },
    /// A previous process is still alive; nothing was spawned.
    AlreadyRunning { pid: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessPoll {
    NotStarted,
    Running,
    /// Exit code, `None` when the process was ended by a signal or its status is unknown.
    Exited(Option<i32>),
}

/// Owns zero or one external child process.
#[derive(Debug, Default)]
pub struct CommandExecutor {
    child: Option<Child>,
    exit: Option<Option<i32>>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().map(Child::id)
    }

    pub fn has_process(&self) -> bool {
        self.child.is_some()
    }

    /// Spawn `command` unless the previously started process is still alive.
    pub fn start(&mut self, command: &mut Command) -> Result<StartOutcome> {
        if let (ProcessPoll::Running, Some(pid)) = (self.poll(), self.pid()) {
            warn!(pid, "Process already running, refusing to start another");
            return Ok(StartOutcome::AlreadyRunning { pid });
        }

        let child = command
            .spawn()
            .with_context(|| format!("failed to spawn {:?}", command.get_program()))?;
        let pid = child.id();
        self.child = Some(child);
        self.exit = None;
        info!(pid, program = ?command.get_program(), "Process started");
        Ok(StartOutcome::Started { pid })
    }

    /// Non-blocking liveness check. A handle whose status can no longer be queried is
    /// reported as exited.
    pub fn poll(&mut self) -> ProcessPoll {
        if let Some(code) = self.exit {
            return ProcessPoll::Exited(code);
        }
        let Some(child) = self.child.as_mut() else {
            return ProcessPoll::NotStarted;
        };

        let code = match child.try_wait() {
            Ok(None) => return ProcessPoll::Running,
            Ok(Some(status)) => status.code(),
            Err(err) => {
                warn!(
                    pid = child.id(),
                    error = %err,
                    "Process status unavailable, treating as exited"
                );
                None
            }
        };
        self.exit = Some(code);
        ProcessPoll::Exited(code)
    }

    /// Kill every descendant of the registered process, then the process itself.
    /// Processes that are already gone count as killed.
    pub fn kill(&mut self) -> Result<()> {
        if self.poll() != ProcessPoll::Running {
            return Ok(());
        }
        let Some(child) = self.child.as_mut() else {
            return Ok(());
        };
        let root = child.id();

        let mut system = System::new();
        system.refresh_processes();
        let descendants = descendants_of(root, &process_links(&system));
        for pid in descendants.iter().rev() {
            match system.process(Pid::from_u32(*pid)) {
                Some(process) if !process.kill() => debug!(pid, "Descendant refused kill signal"),
                Some(_) => {}
                None => debug!(pid, "Descendant already gone"),
            }
        }

        match child.kill() {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::InvalidInput => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to kill process {root}"));
            }
        }

        let code = match child.wait() {
            Ok(status) => status.code(),
            Err(err) => {
                debug!(pid = root, error = %err, "Failed to reap killed process");
                None
            }
        };
        self.exit = Some(code);
        info!(pid = root, descendants = descendants.len(), "Process tree killed");
        Ok(())
    }
}

impl Drop for CommandExecutor {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.try_wait();
        }
    }
}

fn process_links(system: &System) -> Vec<(u32, u32)> {
    system
        .processes()
        .iter()
        .filter_map(|(pid, process)| process.parent().map(|parent| (pid.as_u32(), parent.as_u32())))
        .collect()
}

/// Breadth-first walk of `(pid, parent)` links starting below `root`.
pub fn descendants_of(root: u32, links: &[(u32, u32)]) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, parent) in links {
        if pid != parent {
            children.entry(*parent).or_default().push(*pid);
        }
    }
    for list in children.values_mut() {
        list.sort_unstable();
    }

    let mut found = Vec::new();
    let mut queue = VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        if let Some(list) = children.get(&current) {
            for pid in list {
                if *pid != root && !found.contains(pid) {
                    found.push(*pid);
                    queue.push_back(*pid);
                }
            }
        }
    }
    found
}
