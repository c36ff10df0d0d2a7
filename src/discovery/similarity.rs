//! Capability similarity used for fallback routing.
//!
//! Two capabilities are compared on their names (containment, then shared
//! tokens) and on how many providers they share. The index is rebuilt with
//! the capability view and queried live for names the view does not know.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::discovery::view::CapabilityView;

/// Name score when one name contains the other.
pub const CONTAINMENT_SCORE: f64 = 0.8;

/// Scale applied to token Jaccard when neither name contains the other.
pub const TOKEN_SCALE: f64 = 0.5;

pub const NAME_WEIGHT: f64 = 0.7;
pub const OVERLAP_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarCapability {
    pub name: String,
    pub score: f64,
}

fn tokens(name: &str) -> BTreeSet<String> {
    name.split(|c: char| matches!(c, '-' | '_' | '.' | ':' | '/') || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn jaccard<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(b).count() as f64 / union as f64
}

/// Similarity of two capability names in `[0, 0.8]`.
pub fn name_similarity(a: &str, b: &str) -> f64 {
    let a = a.to_lowercase();
    let b = b.to_lowercase();
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    if a.contains(&b) || b.contains(&a) {
        return CONTAINMENT_SCORE;
    }
    TOKEN_SCALE * jaccard(&tokens(&a), &tokens(&b))
}

/// Jaccard index of two provider sets.
pub fn provider_overlap<T: Ord>(a: &BTreeSet<T>, b: &BTreeSet<T>) -> f64 {
    jaccard(a, b)
}

/// Combined similarity of `a` and `b` against the view.
///
/// Provider overlap only contributes when both capabilities have providers.
pub fn combined_similarity(view: &CapabilityView, a: &str, b: &str) -> f64 {
    let name = name_similarity(a, b);
    let pa = view.providers(a);
    let pb = view.providers(b);
    if pa.is_empty() || pb.is_empty() {
        return name;
    }
    NAME_WEIGHT * name + OVERLAP_WEIGHT * provider_overlap(&pa, &pb)
}

#[derive(Debug, Clone, Default)]
pub struct SimilarityIndex {
    similar: HashMap<String, Vec<SimilarCapability>>,
    similarity_threshold: f64,
    fallback_threshold: f64,
}

impl SimilarityIndex {
    /// Score every pair of capabilities in `view`, record candidates and
    /// write direct fallbacks back into the view's records.
    pub fn build(
        view: &mut CapabilityView,
        similarity_threshold: f64,
        fallback_threshold: f64,
    ) -> Self {
        let mut index = Self {
            similar: HashMap::new(),
            similarity_threshold,
            fallback_threshold,
        };

        let names: Vec<String> = view.names().map(str::to_string).collect();
        for name in &names {
            let ranked = index.score_against(view, name);
            if !ranked.is_empty() {
                index.similar.insert(name.clone(), ranked);
            }
        }

        for name in &names {
            let fallbacks = index.fallbacks(name);
            view.set_fallbacks(name, fallbacks);
        }
        index
    }

    fn score_against(&self, view: &CapabilityView, name: &str) -> Vec<SimilarCapability> {
        let mut ranked: Vec<SimilarCapability> = view
            .names()
            .filter(|other| *other != name)
            .map(|other| SimilarCapability {
                name: other.to_string(),
                score: combined_similarity(view, name, other),
            })
            .filter(|s| s.score >= self.similarity_threshold)
            .collect();
        ranked.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.name.cmp(&b.name)));
        ranked
    }

    /// Indexed candidates for a known capability.
    pub fn similar_to(&self, name: &str) -> &[SimilarCapability] {
        self.similar.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Candidates for any name, scored live when the name is not indexed.
    pub fn rank(&self, view: &CapabilityView, name: &str) -> Vec<SimilarCapability> {
        if view.contains(name) {
            self.similar_to(name).to_vec()
        } else {
            self.score_against(view, name)
        }
    }

    /// Names at or above the fallback threshold, most similar first.
    pub fn fallbacks(&self, name: &str) -> Vec<String> {
        self.similar_to(name)
            .iter()
            .filter(|s| s.score >= self.fallback_threshold)
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.similar.len()
    }

    pub fn is_empty(&self) -> bool {
        self.similar.is_empty()
    }
}
