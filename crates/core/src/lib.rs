//! Job orchestration and progress tracking for stem separation.
//!
//! The server side queues [`mission::Mission`]s in a [`scheduler::Scheduler`], which
//! launches one worker process per mission through [`executor::CommandExecutor`] and
//! reconciles each worker's `progress.json` against the files it has produced. The
//! worker side lives in [`worker`].

pub mod config;
pub mod executor;
pub mod fsutil;
pub mod logging;
pub mod mission;
pub mod preset;
pub mod progress;
pub mod scan;
pub mod scheduler;
pub mod server;
pub mod worker;
