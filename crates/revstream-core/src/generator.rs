//! Result generation collaborator.
//!
//! The protocol treats ranking as a black box: given a context and a
//! revision, produce a bounded, scored [`ResponseBatch`]. The server only
//! depends on the [`Generate`] trait; [`HashScoreGenerator`] is the default
//! mock that scores deterministically from the context so repeated calls are
//! reproducible.

use crate::proto::{RequestContext, ResponseBatch, ResponseItem};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Smallest batch the default generator produces.
pub const MIN_ITEMS: usize = 5;

/// Largest batch the default generator produces.
pub const MAX_ITEMS: usize = 10;

/// Produces the result list for one revision of a call.
///
/// Implementations must be synchronous, free of protocol-visible side
/// effects, and fast relative to the 50ms protocol delays.
pub trait Generate: Send + Sync {
    fn generate(&self, context: &RequestContext, revision: u32) -> ResponseBatch;
}

impl<F> Generate for F
where
    F: Fn(&RequestContext, u32) -> ResponseBatch + Send + Sync,
{
    fn generate(&self, context: &RequestContext, revision: u32) -> ResponseBatch {
        self(context, revision)
    }
}

/// Hash-seeded mock ranker with progressive refinement.
///
/// - Batch size is drawn from `MIN_ITEMS..=MAX_ITEMS` with an RNG seeded by
///   the query and subject.
/// - Each item starts from a hash-derived base score in `[0, 1)`.
/// - A non-empty refinement adds a boost of up to `0.2`.
/// - Later revisions are scaled up (`0.7`, `0.9`, `1.1`).
/// - Jitter of `±0.1` is applied, then the score is clamped to `[0, 1]`.
///
/// Items are returned sorted by descending score.
#[derive(Debug, Default, Clone, Copy)]
pub struct HashScoreGenerator;

impl HashScoreGenerator {
    fn revision_multiplier(revision: u32) -> f64 {
        match revision {
            1 => 0.7,
            2 => 0.9,
            3 => 1.1,
            _ => 1.0,
        }
    }
}

impl Generate for HashScoreGenerator {
    fn generate(&self, context: &RequestContext, revision: u32) -> ResponseBatch {
        let mut rng = StdRng::seed_from_u64(hash_of(&(&context.query, &context.subject_id)));
        let count = rng.random_range(MIN_ITEMS..=MAX_ITEMS);

        let boost = if context.refinement.is_empty() {
            0.0
        } else {
            (hash_of(&context.refinement) % 200) as f64 / 1000.0
        };
        let multiplier = Self::revision_multiplier(revision);

        let mut items: Vec<ResponseItem> = (0..count)
            .map(|index| {
                let base =
                    (hash_of(&(&context.query, &context.subject_id, index)) % 1000) as f64 / 1000.0;
                let jitter = rng.random_range(-0.1..=0.1);
                let score = ((base + boost) * multiplier + jitter).clamp(0.0, 1.0);

                ResponseItem {
                    subject_id: context.subject_id.clone(),
                    item_id: format!("item_{}_{}_r{}", context.subject_id, index + 1, revision),
                    score,
                }
            })
            .collect();

        items.sort_by(|a, b| b.score.total_cmp(&a.score));

        ResponseBatch { items, revision }
    }
}

fn hash_of<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
