//! Image sources: where candidate panoramas come from.

use async_trait::async_trait;

use crate::types::{AssignmentResult, SpatialPoint};

pub mod local;
pub mod remote;

/// Finds and claims the nearest free image for a point.
///
/// Implementations share an [`AssignmentRegistry`](crate::AssignmentRegistry)
/// with every concurrent caller of the same run. A returned image id is
/// claimed before the call returns and is never returned again. "Nothing
/// within range" is an empty result, not an error; transport failures are
/// recorded in `AssignmentResult::error` rather than returned.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Largest residual distance, in metres, this source will accept.
    fn max_distance_m(&self) -> f64;

    async fn find_nearest_unassigned(&self, point: &SpatialPoint) -> AssignmentResult;
}
