//! Cluster membership and consistent-hash partition routing for a fleet of
//! interchangeable IoT platform instances.
//!
//! Every instance publishes itself through a [`DiscoveryService`] and keeps
//! one hash ring per service role (and per isolated tenant) in a
//! [`HashPartitionService`]. Any instance can then answer, without
//! coordination, which partition an entity belongs to and whether the local
//! instance owns it.

mod config;
mod discovery;
mod errors;
mod events;
mod hashing;
mod identity;
mod metrics;
mod node;
mod partition;
pub mod utils;

pub(crate) mod constants;

pub use config::*;
pub use discovery::*;
pub use errors::*;
pub use events::*;
pub use hashing::*;
pub use identity::*;
pub use metrics::*;
pub use node::*;
pub use partition::*;

//-----------------------------------------------------------
// Autometrics
/// autometrics: https://docs.autometrics.dev/rust/adding-alerts-and-slos
use autometrics::objectives::Objective;
use autometrics::objectives::ObjectiveLatency;
use autometrics::objectives::ObjectivePercentile;
const API_SLO: Objective = Objective::new("api")
    .success_rate(ObjectivePercentile::P99_9)
    .latency(ObjectiveLatency::Ms10, ObjectivePercentile::P99);
