//! Coverage queries
//!
//! - **Resolver**: Picks one winning segment per instant under a precedence policy
//! - **Planner**: Expands a channel pattern and resolves every matched identity
//! - **Plan**: Gap-aware coverage plans returned to callers
//!
//! # Example
//!
//! ```rust,ignore
//! use seisindex::query::{PrecedencePolicy, QueryPlanner};
//!
//! let planner = QueryPlanner::new(index, PrecedencePolicy::default());
//! let plans = planner.plan(&"GE.*..BHZ".parse()?, window).await?;
//! for plan in &plans {
//!     println!("{}: {:?}", plan.identity, plan.summary());
//! }
//! ```

mod plan;
mod planner;
mod resolver;

pub use plan::{AmbiguousCoverage, CoverageEntry, CoveragePlan, CoverageSummary, GapCause};
pub use planner::{plan_channels, QueryPlanner};
pub use resolver::{mark_removed, resolve, Criterion, PrecedencePolicy, Resolution};

pub(crate) use resolver::push_gap;
