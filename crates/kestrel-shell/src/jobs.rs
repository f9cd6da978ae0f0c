//! Background jobs, signals, and the inter-job message bus.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use kestrel_types::error::{KernelError, Result};

use crate::env::EnvironmentStack;

/// Cooperative cancellation flag shared between a job and the handlers
/// running on its behalf.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Paused,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "Running"),
            Self::Paused => write!(f, "Stopped"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Kill,
    Term,
    Stop,
    Cont,
}

impl FromStr for Signal {
    type Err = KernelError;

    /// Accepts `KILL`, `TERM`, `STOP`, `CONT` in any case, with or without
    /// a `SIG` prefix.
    fn from_str(s: &str) -> Result<Self> {
        let upper = s.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        match name {
            "KILL" => Ok(Self::Kill),
            "TERM" => Ok(Self::Term),
            "STOP" => Ok(Self::Stop),
            "CONT" => Ok(Self::Cont),
            _ => Err(KernelError::InvalidArgument(format!("invalid signal: {s}"))),
        }
    }
}

/// One queued unit of work: a command line plus the lines it may read as
/// password input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStep {
    pub command: String,
    pub inputs: Vec<String>,
}

impl JobStep {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            inputs: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub struct Job {
    pub id: u64,
    pub command: String,
    pub status: JobStatus,
    pub user: String,
    pub cwd: String,
    pub start_time: DateTime<Utc>,
    pub token: CancellationToken,
    /// Work left to do, front first.
    pub steps: VecDeque<JobStep>,
    /// The job's own variable scope.
    pub vars: EnvironmentStack,
    /// Script nesting depth of the queued steps.
    pub depth: usize,
    /// Steps executed so far, across every script the job ran.
    pub steps_run: usize,
}

impl Job {
    pub fn is_finished(&self) -> bool {
        self.steps.is_empty() || self.token.is_cancelled()
    }
}

/// A job as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobInfo {
    pub id: u64,
    pub command: String,
    pub status: JobStatus,
    pub user: String,
    pub start_time: DateTime<Utc>,
}

/// Every live background job.
#[derive(Debug)]
pub struct JobTable {
    next_id: AtomicU64,
    jobs: BTreeMap<u64, Job>,
    mailboxes: BTreeMap<u64, VecDeque<String>>,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            jobs: BTreeMap::new(),
            mailboxes: BTreeMap::new(),
        }
    }

    /// Register a running job whose first step is `command`.
    pub fn spawn(
        &mut self,
        command: &str,
        user: &str,
        cwd: &str,
        vars: EnvironmentStack,
        now: DateTime<Utc>,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut steps = VecDeque::new();
        steps.push_back(JobStep::new(command));
        self.jobs.insert(
            id,
            Job {
                id,
                command: command.to_string(),
                status: JobStatus::Running,
                user: user.to_string(),
                cwd: cwd.to_string(),
                start_time: now,
                token: CancellationToken::new(),
                steps,
                vars,
                depth: 0,
                steps_run: 0,
            },
        );
        self.mailboxes.insert(id, VecDeque::new());
        log::info!("Job [{id}] started by {user}: {command}");
        id
    }

    pub fn get(&self, id: u64) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn ids(&self) -> Vec<u64> {
        self.jobs.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn list(&self) -> Vec<JobInfo> {
        self.jobs
            .values()
            .map(|j| JobInfo {
                id: j.id,
                command: j.command.clone(),
                status: j.status,
                user: j.user.clone(),
                start_time: j.start_time,
            })
            .collect()
    }

    /// Highest id among paused jobs.
    pub fn last_paused(&self) -> Option<u64> {
        self.jobs
            .values()
            .rev()
            .find(|j| j.status == JobStatus::Paused)
            .map(|j| j.id)
    }

    /// Deliver a signal. KILL and TERM cancel the job and remove it; STOP
    /// and CONT only toggle its status.
    pub fn signal(&mut self, id: u64, signal: Signal) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&id)
            .ok_or_else(|| KernelError::NotFound(format!("job {id}")))?;
        match signal {
            Signal::Kill | Signal::Term => {
                job.token.cancel();
                self.remove(id);
                log::info!("Job [{id}] terminated by {signal:?}");
            },
            Signal::Stop => job.status = JobStatus::Paused,
            Signal::Cont => job.status = JobStatus::Running,
        }
        Ok(())
    }

    /// Drop a job and its mailbox.
    pub fn remove(&mut self, id: u64) -> Option<Job> {
        self.mailboxes.remove(&id);
        self.jobs.remove(&id)
    }

    pub fn post_message(&mut self, id: u64, message: &str) -> Result<()> {
        let mailbox = self
            .mailboxes
            .get_mut(&id)
            .ok_or_else(|| KernelError::NotFound(format!("job {id}")))?;
        mailbox.push_back(message.to_string());
        Ok(())
    }

    /// Take every pending message for a job.
    pub fn read_messages(&mut self, id: u64) -> Result<Vec<String>> {
        let mailbox = self
            .mailboxes
            .get_mut(&id)
            .ok_or_else(|| KernelError::NotFound(format!("job {id}")))?;
        Ok(mailbox.drain(..).collect())
    }
}

/// Parse a job reference: `%3` or `3`.
pub fn parse_job_id(arg: &str) -> Result<u64> {
    arg.strip_prefix('%')
        .unwrap_or(arg)
        .parse()
        .map_err(|_| KernelError::InvalidArgument(format!("invalid job id: {arg}")))
}
