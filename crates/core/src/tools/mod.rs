//! # Pipeline Tools
//!
//! Deterministic building blocks the coordinator composes. None of these
//! hold run state; each is a function of its inputs plus an injected seam.
//!
//! ## Modules
//!
//! - `classifier` - Request → `InputDescriptor`, versioned
//! - `dedup` - Registry Gate: token-set overlap and naming rules
//! - `router` - Total decision table → `Route`
//! - `acquirer` - Probe/retry/fetch into scoped temp workspaces
//! - `merge` - Hybrid artifact merge with provenance and contradictions
//! - `validator` - Format check run before publishing

pub mod acquirer;
pub mod classifier;
pub mod dedup;
pub mod merge;
pub mod router;
pub mod validator;
