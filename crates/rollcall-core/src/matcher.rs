//! 1:N face identification over the enrolled gallery.
//!
//! Distance is Euclidean. Confidence is `1 - distance / distance_max`,
//! clamped to [0, 1]. A query is identified only when the best distance is
//! strictly below `threshold` AND the runner-up is at least `margin`
//! further away. Exact ties are always rejected. A query with NaN or
//! infinite components never matches, and templates whose distance is not
//! finite are left out of the ranking.

use crate::error::MatchPolicyError;
use crate::types::{Embedding, FaceTemplate, IdentityId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MatchPolicy {
    /// Maximum accepted distance (exclusive).
    pub threshold: f32,
    /// Required gap between best and second-best distance.
    pub margin: f32,
    /// Distance that maps to zero confidence.
    pub distance_max: f32,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            margin: 0.1,
            distance_max: 1.0,
        }
    }
}

impl MatchPolicy {
    pub fn new(threshold: f32, margin: f32, distance_max: f32) -> Result<Self, MatchPolicyError> {
        if !(distance_max > 0.0) || !distance_max.is_finite() {
            return Err(MatchPolicyError::DistanceMax(distance_max));
        }
        if !(threshold > 0.0 && threshold <= distance_max) {
            return Err(MatchPolicyError::Threshold {
                threshold,
                distance_max,
            });
        }
        if !(margin >= 0.0) || !margin.is_finite() {
            return Err(MatchPolicyError::Margin(margin));
        }
        Ok(Self {
            threshold,
            margin,
            distance_max,
        })
    }

    /// Monotonically non-increasing in `distance`; 1.0 at distance 0.
    pub fn confidence(&self, distance: f32) -> f32 {
        (1.0 - distance / self.distance_max).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NoMatchReason {
    EmptyGallery,
    NonFiniteQuery,
    AboveThreshold { best_distance: f32 },
    Ambiguous { best_distance: f32, runner_up_distance: f32 },
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchDecision {
    Match {
        identity: IdentityId,
        distance: f32,
        confidence: f32,
    },
    NoMatch(NoMatchReason),
}

/// Strategy for identifying a query embedding among enrolled templates.
pub trait Matcher {
    fn identify(&self, query: &Embedding, gallery: &[&FaceTemplate]) -> MatchDecision;
}

/// Euclidean nearest-neighbour matcher with an absolute threshold and a
/// relative margin.
///
/// Always scores every gallery entry; scan order only matters for exact
/// ties, and those are rejected.
pub struct EuclideanMatcher {
    policy: MatchPolicy,
}

impl EuclideanMatcher {
    pub fn new(policy: MatchPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MatchPolicy {
        &self.policy
    }
}

impl Matcher for EuclideanMatcher {
    fn identify(&self, query: &Embedding, gallery: &[&FaceTemplate]) -> MatchDecision {
        if !query.is_finite() {
            tracing::warn!("query embedding has non-finite components");
            return MatchDecision::NoMatch(NoMatchReason::NonFiniteQuery);
        }

        let mut best: Option<(f32, usize)> = None;
        let mut runner_up: Option<f32> = None;

        for (i, template) in gallery.iter().enumerate() {
            if template.embedding.dim() != query.dim() {
                tracing::warn!(
                    identity = %template.identity,
                    expected = query.dim(),
                    actual = template.embedding.dim(),
                    "skipping template with mismatched dimension"
                );
                continue;
            }
            let d = query.euclidean_distance(&template.embedding);
            if !d.is_finite() {
                tracing::warn!(
                    identity = %template.identity,
                    "skipping template with non-finite distance"
                );
                continue;
            }
            match best {
                Some((best_d, _)) if d >= best_d => {
                    if runner_up.map_or(true, |r| d < r) {
                        runner_up = Some(d);
                    }
                }
                _ => {
                    runner_up = best.map(|(best_d, _)| best_d);
                    best = Some((d, i));
                }
            }
        }

        let Some((best_distance, idx)) = best else {
            return MatchDecision::NoMatch(NoMatchReason::EmptyGallery);
        };

        tracing::debug!(
            best_distance,
            runner_up_distance = ?runner_up,
            candidates = gallery.len(),
            "match scored"
        );

        if best_distance >= self.policy.threshold {
            return MatchDecision::NoMatch(NoMatchReason::AboveThreshold { best_distance });
        }

        if let Some(runner_up_distance) = runner_up {
            let gap = runner_up_distance - best_distance;
            if runner_up_distance == best_distance || gap < self.policy.margin {
                return MatchDecision::NoMatch(NoMatchReason::Ambiguous {
                    best_distance,
                    runner_up_distance,
                });
            }
        }

        MatchDecision::Match {
            identity: gallery[idx].identity.clone(),
            distance: best_distance,
            confidence: self.policy.confidence(best_distance),
        }
    }
}
