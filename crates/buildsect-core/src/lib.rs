//! buildsect core
//!
//! Finds the first candidate (revision, derivation, graph node) whose build
//! fails, by bisecting an ordered candidate space over an opaque build
//! capability.
//!
//! # Components
//!
//! - **Candidate space**: ordering, midpoints, narrowing, skip bookkeeping
//! - **Classifier**: raw build result to `Good` / `Bad` / `Skip` / `Inconclusive`
//! - **Build runner**: runs one build with a deadline and cancellation
//! - **Result cache**: outcome memo with bounded retries for flaky builds
//! - **Session store**: versioned, atomically written run state
//! - **Engine**: the search loop and its state machine
//!
//! # Architecture
//!
//! ```text
//! CandidateSpace::midpoint → ResultCache → BuildRunner → Classifier
//!        ↑                                                   │
//!        └──── narrow ←── ResultCache::put ←─────────────────┘
//!                              │
//!                        SessionStore::save → StatusEvent
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use buildsect_core::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn example(candidates: Vec<Candidate>) -> BisectResult<()> {
//! let config = BisectConfig::default();
//! let runner = Arc::new(CommandRunner::new("git checkout -q {candidate} && make"));
//! let store = Arc::new(FileSessionStore::new(".buildsect/session.json"));
//!
//! let mut engine = BisectEngine::new(candidates, config, runner, store)?;
//! match engine.run(&CancelToken::new()).await? {
//!     BisectReport::Converged { first_bad, .. } => println!("first bad: {}", first_bad.id),
//!     BisectReport::NoTransitionFound { .. } => println!("no transition"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod candidate;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod runner;
pub mod session;
pub mod types;

pub use cache::{CacheEntry, Lookup, ResultCache};
pub use candidate::{CandidateSpace, Progress};
pub use classifier::{Action, ActionPolicy, BuildStatus, Classifier, ClassifierConfig};
pub use config::{BisectConfig, OrderingDirection, SkipSide};
pub use engine::{BisectEngine, BisectReport, EngineState};
pub use error::{
    BisectError, BisectResult, CandidateSpaceError, PersistenceError, RecentTest, RunnerError,
};
pub use events::{log_line, EventSink, StatusEvent};
pub use runner::{BuildCapability, BuildRunner, CancelToken, CommandRunner, RawResult, Termination};
pub use session::{
    FileSessionStore, MemorySessionStore, SessionState, SessionStatus, SessionStore,
    SESSION_SCHEMA_VERSION,
};
pub use types::{
    Candidate, CandidateDescriptor, CandidateId, Diagnostic, FailureCategory, Outcome, OutcomeKind,
    SearchRange,
};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving a bisection
    pub use crate::config::{BisectConfig, OrderingDirection, SkipSide};
    pub use crate::engine::{BisectEngine, BisectReport};
    pub use crate::error::{BisectError, BisectResult};
    pub use crate::events::{EventSink, StatusEvent};
    pub use crate::runner::{BuildCapability, CancelToken, CommandRunner, RawResult, Termination};
    pub use crate::session::{FileSessionStore, MemorySessionStore, SessionStore};
    pub use crate::types::{Candidate, CandidateDescriptor, CandidateId, Outcome, OutcomeKind};
}
