//! Lightweight place-recognition index over keyframe descriptors.
//!
//! Full-scale systems back this with a DBoW2 vocabulary and an inverted
//! file. Relocalization only needs "which keyframes look like this frame,
//! ranked" — here each keyframe is summarized by a coarse histogram over
//! descriptor prefixes and queries score by normalized dot product. The
//! scoring can be upgraded to a real vocabulary without touching the
//! tracker.

use std::collections::HashMap;

use crate::features::Descriptor;

use super::types::KeyFrameId;

const SIGNATURE_BINS: usize = 64;

/// Normalized histogram signature of one keyframe's descriptor set.
#[derive(Debug, Clone)]
struct Signature([f32; SIGNATURE_BINS]);

fn signature_of(descriptors: &[Descriptor]) -> Signature {
    let mut bins = [0f32; SIGNATURE_BINS];
    for d in descriptors {
        // Coarse quantization: the top six bits of the first byte.
        let bin = (d.0[0] >> 2) as usize % SIGNATURE_BINS;
        bins[bin] += 1.0;
    }
    let norm = bins.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in bins.iter_mut() {
            *v /= norm;
        }
    }
    Signature(bins)
}

/// Relocalization candidate with its similarity score.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub keyframe_id: KeyFrameId,
    pub score: f64,
}

#[derive(Default)]
pub struct KeyFrameIndex {
    entries: HashMap<KeyFrameId, Signature>,
}

impl KeyFrameIndex {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn add(&mut self, kf_id: KeyFrameId, descriptors: &[Descriptor]) {
        self.entries.insert(kf_id, signature_of(descriptors));
    }

    pub fn erase(&mut self, kf_id: KeyFrameId) {
        self.entries.remove(&kf_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Keyframes ranked by similarity to the query descriptors.
    pub fn candidates(&self, descriptors: &[Descriptor], max_results: usize) -> Vec<Candidate> {
        let query = signature_of(descriptors);
        let mut out: Vec<Candidate> = self
            .entries
            .iter()
            .map(|(&kf_id, sig)| {
                let score: f32 = sig.0.iter().zip(query.0.iter()).map(|(a, b)| a * b).sum();
                Candidate {
                    keyframe_id: kf_id,
                    score: score as f64,
                }
            })
            .filter(|c| c.score > 0.0)
            .collect();
        out.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        out.truncate(max_results);
        out
    }
}
