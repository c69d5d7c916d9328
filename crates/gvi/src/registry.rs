use dashmap::DashSet;

use crate::types::ImageRecord;

/// Image ids consumed during one run.
///
/// Shared by every worker. The only mutation is an atomic insert-if-absent, so
/// an id can be handed out at most once and is never released.
#[derive(Debug, Default)]
pub struct AssignmentRegistry {
    claimed: DashSet<String>,
}

impl AssignmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `image_id`. Returns `false` if some other caller already holds it.
    #[inline]
    pub fn try_claim(&self, image_id: &str) -> bool {
        self.claimed.insert(image_id.to_owned())
    }

    #[inline]
    pub fn is_claimed(&self, image_id: &str) -> bool {
        self.claimed.contains(image_id)
    }

    pub fn len(&self) -> usize {
        self.claimed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }

    /// Claims the closest candidate that nobody holds yet.
    ///
    /// Candidates are tried in ascending distance; equal distances keep their
    /// input order. Losing a race on one id moves on to the next-nearest one,
    /// which makes the lookup and the claim a single transaction from the
    /// caller's point of view.
    pub fn claim_nearest<'a>(
        &self,
        mut candidates: Vec<(&'a ImageRecord, f64)>,
    ) -> Option<(&'a ImageRecord, f64)> {
        candidates.retain(|(record, _)| !self.is_claimed(&record.id));
        candidates.sort_by(|a, b| a.1.total_cmp(&b.1));

        candidates.into_iter().find(|(record, _)| {
            let won = self.try_claim(&record.id);
            if !won {
                tracing::debug!(image_id = %record.id, "Lost claim race; trying next candidate");
            }
            won
        })
    }
}
