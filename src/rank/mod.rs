//! Retrieval: quantile calibration, hybrid ranking, session tracking,
//! reranking, and context formatting.

pub mod calibrate;
pub mod context;
pub mod hybrid;
pub mod rerank;
pub mod session;

pub use hybrid::{Candidate, RankOutcome, RankRequest, Ranker};
pub use session::SessionTracker;
