//! Per-view preference and finality tracking
//!
//! A view starts undecided. The first candidate offered through
//! [`Resolver::prefer`] is committed for the rest of the view; later
//! offers are no-ops. Commitment is a once-cell swap, so concurrent
//! callers never block on each other and every reader sees the same
//! winner.
//!
//! On top of the commitment the resolver tracks snowball confidence:
//! consecutive polls in which a quorum of sampled peers answered with our
//! preference. The view is decided once that streak reaches `beta`.

use ledger_state::Identifier;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

/// Snowball sampling parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverParams {
    /// Peers sampled per query
    pub k: usize,
    /// Fraction of the sample that must agree for a poll to succeed
    pub alpha: f64,
    /// Consecutive successful polls needed to decide
    pub beta: u32,
}

impl Default for ResolverParams {
    fn default() -> Self {
        Self {
            k: 10,
            alpha: 0.8,
            beta: 10,
        }
    }
}

impl ResolverParams {
    /// Agreeing answers needed out of a sample of `sampled` peers.
    ///
    /// The sample never counts more than `k` peers and a poll always
    /// needs at least one agreeing answer.
    pub fn quorum(&self, sampled: usize) -> usize {
        let sample = sampled.min(self.k);
        let needed = (self.alpha * sample as f64).ceil() as usize;
        needed.max(1)
    }
}

/// Where the current view stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverStatus {
    Undecided,
    Committed(Identifier),
}

#[derive(Debug)]
struct ViewState {
    view_id: u64,
    preferred: OnceLock<Identifier>,
    successes: AtomicU32,
}

impl ViewState {
    fn new(view_id: u64) -> Self {
        Self {
            view_id,
            preferred: OnceLock::new(),
            successes: AtomicU32::new(0),
        }
    }
}

/// Preference and confidence for one view at a time
#[derive(Debug)]
pub struct Resolver {
    params: ResolverParams,
    state: RwLock<Arc<ViewState>>,
}

impl Resolver {
    pub fn new(params: ResolverParams, view_id: u64) -> Self {
        Self {
            params,
            state: RwLock::new(Arc::new(ViewState::new(view_id))),
        }
    }

    fn current(&self) -> Arc<ViewState> {
        self.state.read().clone()
    }

    pub fn params(&self) -> &ResolverParams {
        &self.params
    }

    /// View the resolver is tracking
    pub fn view_id(&self) -> u64 {
        self.current().view_id
    }

    /// Offer `id` as the preferred candidate of this view.
    ///
    /// Returns true only for the call that committed. The zero identifier
    /// means "none" and is never committed.
    pub fn prefer(&self, id: Identifier) -> bool {
        if id.is_zero() {
            return false;
        }
        self.current().preferred.set(id).is_ok()
    }

    pub fn preferred(&self) -> Option<Identifier> {
        self.current().preferred.get().copied()
    }

    pub fn status(&self) -> ResolverStatus {
        match self.preferred() {
            Some(id) => ResolverStatus::Committed(id),
            None => ResolverStatus::Undecided,
        }
    }

    /// Begin `view_id`, dropping the preference and confidence of the
    /// previous view
    pub fn reset(&self, view_id: u64) {
        *self.state.write() = Arc::new(ViewState::new(view_id));
        tracing::trace!("Resolver reset to view {}", view_id);
    }

    /// Record the answers of one sampled query. Peers that did not answer
    /// count as the zero identifier.
    ///
    /// Returns whether the poll reached quorum for our preference. A poll
    /// without a preference or below quorum breaks the success streak.
    pub fn record_poll(&self, responses: &[Identifier]) -> bool {
        let state = self.current();

        let Some(preferred) = state.preferred.get().copied() else {
            state.successes.store(0, Ordering::Release);
            return false;
        };

        if responses.is_empty() {
            state.successes.store(0, Ordering::Release);
            return false;
        }

        let agreeing = responses.iter().filter(|id| **id == preferred).count();
        if agreeing >= self.params.quorum(responses.len()) {
            let streak = state.successes.fetch_add(1, Ordering::AcqRel) + 1;
            tracing::trace!(
                "Poll for {} reached quorum ({}/{}), streak {}",
                preferred,
                agreeing,
                responses.len(),
                streak
            );
            true
        } else {
            state.successes.store(0, Ordering::Release);
            false
        }
    }

    /// Consecutive successful polls in this view
    pub fn successes(&self) -> u32 {
        self.current().successes.load(Ordering::Acquire)
    }

    /// True once the preference has gathered `beta` consecutive successes
    pub fn decided(&self) -> bool {
        let state = self.current();
        state.preferred.get().is_some()
            && state.successes.load(Ordering::Acquire) >= self.params.beta
    }
}
