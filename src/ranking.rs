use std::{cmp::Reverse, future::ready, sync::Arc};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::race::select_first;

/// Something that can be ranked by priority and checked for usability
#[async_trait]
pub trait Candidate: Send + Sync {
    fn priority(&self) -> i32;

    /// Never fails: any error or cancellation counts as unusable
    async fn usable(&self, ct: &CancellationToken) -> bool;
}

/// Picks a usable candidate, preferring higher priorities.
///
/// Candidates are grouped by priority, highest first. Each group is raced as a
/// whole and the first usable member wins; a lower group is only looked at once
/// every member of the groups above turned out unusable.
pub async fn select_working<C: Candidate + ?Sized>(
    ct: &CancellationToken,
    candidates: &[Arc<C>],
) -> Option<Arc<C>> {
    let mut sorted = candidates.to_vec();
    sorted.sort_by_key(|c| Reverse(c.priority()));

    for group in sorted.chunk_by(|a, b| a.priority() == b.priority()) {
        info!(
            "Looking at {} candidate(s) with priority {}",
            group.len(),
            group[0].priority()
        );

        let tasks = group.iter().cloned().map(|candidate| {
            move |token: CancellationToken| async move {
                candidate.usable(&token).await.then_some(candidate)
            }
        });

        if let Some(winner) = select_first(ct, tasks, |c| ready(c.is_some())).await.flatten() {
            debug!("Found a usable candidate with priority {}", winner.priority());
            return Some(winner);
        }

        if ct.is_cancelled() {
            return None;
        }
    }

    None
}
