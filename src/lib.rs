//! NSerf - decentralized cluster membership, failure detection, and event
//! dissemination, modeled on SWIM/gossip-based cluster coordination.
//!
//! [`memberlist`] provides pure SWIM group membership; [`serf`] layers the
//! logical-clock coordination (member/user/query events, tags, keys) on
//! top of it; [`agent`] is the façade most callers should actually use.

pub mod error;
pub mod config;
pub mod clock;
pub mod codec;
pub mod coordinate;
pub mod transport;
pub mod broadcast;
pub mod memberlist;
pub mod serf;
pub mod dispatcher;
pub mod coalesce;
pub mod query;
pub mod internal_query;
pub mod reaper;
pub mod snapshot;
pub mod keymanager;
pub mod agent;
pub mod rpc;
pub mod metrics;

pub use agent::Agent;
pub use config::Config;
pub use error::{NserfError, Result};
