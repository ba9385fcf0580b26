//! Client-side weighted round robin load balancing
//!
//! Distributes picks across READY endpoints in proportion to weights derived
//! from backend load reports: queries-per-second, errors-per-second and
//! utilization, combined as `qps / (utilization + eps/qps * penalty)`.
//! Reports arrive in per-call trailers or from an out-of-band watcher on
//! each endpoint, and feed per-endpoint weight records with blackout and
//! expiration handling so the policy never acts on premature or dead data.
//!
//! A static stride scheduler turns the weight vector into a deterministic
//! pick sequence with one atomic increment per pick. When fewer than two
//! endpoints have usable weights the picker degrades to plain round-robin.
//!
//! Configuration is the `"weighted_round_robin"` JSON stanza:
//!
//! ```ignore
//! {
//!     "enableOobLoadReport": false,
//!     "blackoutPeriod": "10s",
//!     "weightUpdatePeriod": "1s",
//!     "weightExpirationPeriod": "180s",
//!     "errorUtilizationPenalty": 1.0
//! }
//! ```
//!
//! The host channel drives the policy through [`policy::WeightedRoundRobin`]
//! and the traits in [`lb`]: a resolver feeds endpoint lists into
//! `update`, per-endpoint children report connectivity through
//! `on_endpoint_state_update`, and the policy publishes pickers back through
//! the [`lb::ChannelController`]. Control-plane calls must be serialized by
//! the host; published pickers are safe for concurrent picks.

pub use self::{
    config::{ConfigError, POLICY_NAME, WeightedRoundRobinConfig},
    policy::WeightedRoundRobin,
    scheduler::StaticStrideScheduler,
};

pub mod config;
mod endpoint_list;
mod endpoint_weight;
pub mod lb;
pub mod metrics;
mod picker;
pub mod policy;
pub mod scheduler;
