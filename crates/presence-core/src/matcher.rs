//! Exact nearest-neighbour identification under cosine distance.
//!
//! A linear scan over the gallery. Every comparable pair gets a distance in
//! `[0, 2]`; pairs without a defined distance (zero norm, dimension or model
//! mismatch, non-finite arithmetic) are skipped and can never be selected.

use crate::types::{Embedding, Identity};

/// Acceptance threshold for ArcFace w600k_r50 embeddings.
///
/// Tied to the embedding model: switching models invalidates it.
pub const ARCFACE_DISTANCE_THRESHOLD: f64 = 0.68;

/// Cosine distance `1 - cos(a, b)`, or `None` when undefined for this pair.
///
/// Computed and returned in f64 so the threshold comparison sees the exact
/// value, not one rounded to f32.
pub fn cosine_distance(a: &Embedding, b: &Embedding) -> Option<f64> {
    if !a.is_comparable(b) {
        return None;
    }

    let denom = a.norm() * b.norm();
    if denom <= 0.0 || !denom.is_finite() {
        return None;
    }

    let dot: f64 = a
        .values
        .iter()
        .zip(b.values.iter())
        .map(|(&x, &y)| f64::from(x) * f64::from(y))
        .sum();

    let distance = 1.0 - dot / denom;
    distance.is_finite().then_some(distance)
}

/// The accepted gallery entry closest to a probe.
#[derive(Debug, Clone, Copy)]
pub struct Match<'g> {
    pub identity: &'g Identity,
    pub distance: f64,
}

/// Strategy for classifying a probe embedding against a gallery.
pub trait Matcher {
    /// Best accepted match, or `None` when no gallery entry qualifies.
    fn best_match<'g>(&self, probe: &Embedding, gallery: &'g [Identity]) -> Option<Match<'g>>;
}

/// Cosine-distance matcher with a strict acceptance threshold.
///
/// Among candidates the strictly smallest distance wins; on equal distances
/// the entry encountered first in gallery order is kept.
#[derive(Debug, Clone, Copy)]
pub struct CosineMatcher {
    threshold: f64,
}

impl CosineMatcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Whether a distance qualifies as a candidate. Strict: equality rejects.
    pub fn accepts(&self, distance: f64) -> bool {
        distance < self.threshold
    }
}

impl Default for CosineMatcher {
    fn default() -> Self {
        Self::new(ARCFACE_DISTANCE_THRESHOLD)
    }
}

impl Matcher for CosineMatcher {
    fn best_match<'g>(&self, probe: &Embedding, gallery: &'g [Identity]) -> Option<Match<'g>> {
        let mut best: Option<Match<'g>> = None;
        let mut skipped = 0usize;

        for identity in gallery {
            let Some(distance) = cosine_distance(probe, &identity.embedding) else {
                skipped += 1;
                continue;
            };
            if !self.accepts(distance) {
                continue;
            }
            if best.map_or(true, |b| distance < b.distance) {
                best = Some(Match { identity, distance });
            }
        }

        if skipped > 0 {
            tracing::warn!(
                skipped,
                gallery = gallery.len(),
                probe_dim = probe.dim(),
                probe_model = ?probe.model_version,
                "gallery entries without a defined distance were skipped"
            );
        }

        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn identity(id: &str, values: Vec<f32>) -> Identity {
        Identity {
            id: id.into(),
            display_name: id.to_uppercase(),
            email: format!("{id}@x.com"),
            role: "employee".into(),
            department: "General".into(),
            embedding: Embedding::untagged(values),
            enrolled_at: Utc::now(),
        }
    }

    /// Unit vector in the plane whose cosine distance to (1, 0) is `d`.
    fn at_distance(d: f64) -> Vec<f32> {
        let cos = 1.0 - d;
        let sin = (1.0 - cos * cos).max(0.0).sqrt();
        vec![cos as f32, sin as f32]
    }

    fn probe() -> Embedding {
        Embedding::untagged(vec![1.0, 0.0])
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let v = Embedding::untagged(vec![0.3, -1.2, 4.5, 0.01]);
        let d = cosine_distance(&v, &v).unwrap();
        assert!(d.abs() < 1e-6, "got {d}");
        let gallery = vec![identity("a", v.values.clone())];
        let m = CosineMatcher::default().best_match(&v, &gallery).unwrap();
        assert_eq!(m.identity.id, "a");
    }

    #[test]
    fn test_distance_orthogonal_and_opposite() {
        let a = Embedding::untagged(vec![1.0, 0.0]);
        let b = Embedding::untagged(vec![0.0, 1.0]);
        let c = Embedding::untagged(vec![-1.0, 0.0]);
        assert!((cosine_distance(&a, &b).unwrap() - 1.0).abs() < 1e-6);
        assert!((cosine_distance(&a, &c).unwrap() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_scale_invariant() {
        let a = Embedding::untagged(vec![1.0, 2.0, 3.0]);
        let b = Embedding::untagged(vec![10.0, 20.0, 30.0]);
        assert!(cosine_distance(&a, &b).unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_distance_undefined_cases() {
        let zero = Embedding::untagged(vec![0.0, 0.0]);
        let unit = Embedding::untagged(vec![1.0, 0.0]);
        assert!(cosine_distance(&zero, &unit).is_none());
        assert!(cosine_distance(&unit, &zero).is_none());
        assert!(cosine_distance(&unit, &Embedding::untagged(vec![1.0, 0.0, 0.0])).is_none());
        assert!(cosine_distance(&unit, &Embedding::untagged(vec![f32::NAN, 1.0])).is_none());
        assert!(cosine_distance(&unit, &Embedding::untagged(vec![f32::INFINITY, 1.0])).is_none());
    }

    #[test]
    fn test_threshold_is_strict() {
        let m = CosineMatcher::new(0.68);
        assert!(!m.accepts(0.68));
        assert!(m.accepts(0.679999));
        assert!(!m.accepts(0.70));
    }

    #[test]
    fn test_threshold_holds_below_f32_resolution() {
        // Exact distance is 0.67999999583, which rounds to 0.68 in f32.
        let known = Embedding::untagged(vec![3.3776027e-1, 1.0]);
        let d = cosine_distance(&probe(), &known).unwrap();
        assert!(d < 0.68, "got {d}");
        assert_eq!(d as f32, 0.68f32);

        let gallery = vec![identity("edge", known.values.clone())];
        let m = CosineMatcher::default().best_match(&probe(), &gallery).unwrap();
        assert_eq!(m.identity.id, "edge");
    }

    #[test]
    fn test_closer_candidate_wins() {
        let gallery = vec![
            identity("a", at_distance(0.40)),
            identity("b", at_distance(0.55)),
        ];
        let m = CosineMatcher::default().best_match(&probe(), &gallery).unwrap();
        assert_eq!(m.identity.id, "a");
        assert!((m.distance - 0.40).abs() < 1e-4);

        // Order in the gallery does not matter for a strict winner.
        let reversed: Vec<_> = gallery.into_iter().rev().collect();
        let m = CosineMatcher::default().best_match(&probe(), &reversed).unwrap();
        assert_eq!(m.identity.id, "a");
    }

    #[test]
    fn test_no_candidate_under_threshold() {
        let gallery = vec![identity("a", at_distance(0.70))];
        assert!(CosineMatcher::default().best_match(&probe(), &gallery).is_none());
    }

    #[test]
    fn test_empty_gallery() {
        assert!(CosineMatcher::default().best_match(&probe(), &[]).is_none());
    }

    #[test]
    fn test_zero_norm_entry_never_wins() {
        let gallery = vec![
            identity("zero", vec![0.0, 0.0]),
            identity("far", at_distance(0.60)),
        ];
        let m = CosineMatcher::default().best_match(&probe(), &gallery).unwrap();
        assert_eq!(m.identity.id, "far");

        let only_zero = vec![identity("zero", vec![0.0, 0.0])];
        assert!(CosineMatcher::default().best_match(&probe(), &only_zero).is_none());
    }

    #[test]
    fn test_zero_norm_probe_matches_nothing() {
        let gallery = vec![identity("a", vec![1.0, 0.0])];
        let zero = Embedding::untagged(vec![0.0, 0.0]);
        assert!(CosineMatcher::default().best_match(&zero, &gallery).is_none());
    }

    #[test]
    fn test_tie_keeps_first_in_gallery_order() {
        let gallery = vec![
            identity("first", vec![1.0, 0.0]),
            identity("second", vec![2.0, 0.0]),
        ];
        let m = CosineMatcher::default().best_match(&probe(), &gallery).unwrap();
        assert_eq!(m.identity.id, "first");
    }

    #[test]
    fn test_model_version_mismatch_is_skipped() {
        let mut other = identity("other-model", vec![1.0, 0.0]);
        other.embedding.model_version = Some("buffalo_s".into());
        let gallery = vec![other];
        let probe = Embedding::new(vec![1.0, 0.0], "w600k_r50");
        assert!(CosineMatcher::default().best_match(&probe, &gallery).is_none());
    }

    #[test]
    fn test_superset_gallery_never_worse() {
        let small = vec![
            identity("a", at_distance(0.50)),
            identity("b", at_distance(0.65)),
        ];
        let mut large = small.clone();
        large.push(identity("c", at_distance(0.20)));
        large.push(identity("d", at_distance(0.90)));
        large.insert(0, identity("z", vec![0.0, 0.0]));

        let matcher = CosineMatcher::default();
        let p = probe();
        let in_small = matcher.best_match(&p, &small).unwrap();
        let in_large = matcher.best_match(&p, &large).unwrap();
        assert!(in_large.distance <= in_small.distance);
        assert_eq!(in_large.identity.id, "c");
    }

    #[test]
    fn test_custom_threshold() {
        let gallery = vec![identity("a", at_distance(0.50))];
        assert!(CosineMatcher::new(0.40).best_match(&probe(), &gallery).is_none());
        assert!(CosineMatcher::new(0.60).best_match(&probe(), &gallery).is_some());
    }
}
