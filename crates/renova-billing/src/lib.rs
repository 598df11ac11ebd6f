pub mod engine;
pub mod summary;

pub use engine::{
    EngineOptions, Job, RenewalEngine, RunOptions, RunOutcome, SkipReason, Stores,
};
pub use summary::{DispatchStatus, NoticeDispatch, RunSummary};
