//! Network coordinate oracle contract (spec.md §2, §13 Non-goals: the
//! Vivaldi math itself is out of scope). `Agent` treats coordinates as
//! values supplied by an external, pluggable provider; RTT-based distance
//! computation is the provider's job, not this crate's.

use std::sync::Arc;

/// A node's position in whatever coordinate space the provider uses.
pub type Coordinate = Vec<f64>;

pub trait CoordinateProvider: Send + Sync {
    /// This node's current coordinate, or `None` if the provider hasn't
    /// produced one yet (e.g. too few RTT samples).
    fn local_coordinate(&self) -> Option<Coordinate>;
}

/// Used whenever `Config::disable_coordinates` is set, or no provider was
/// supplied: `GetCoordinate` always answers `None` rather than erroring.
pub struct NoopCoordinateProvider;

impl CoordinateProvider for NoopCoordinateProvider {
    fn local_coordinate(&self) -> Option<Coordinate> {
        None
    }
}

pub fn default_provider() -> Arc<dyn CoordinateProvider> {
    Arc::new(NoopCoordinateProvider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_provider_never_has_a_coordinate() {
        assert!(NoopCoordinateProvider.local_coordinate().is_none());
    }
}
