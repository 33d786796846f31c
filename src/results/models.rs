use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub id: String,
    pub text: String,
    #[serde(default)]
    pub vote_count: u64,
    /// Set while the count holds an unconfirmed local vote.
    #[serde(skip)]
    pub provisional: bool,
}

impl PollOption {
    pub fn new(id: impl Into<String>, text: impl Into<String>, vote_count: u64) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            vote_count,
            provisional: false,
        }
    }
}

/// Client-side view of a poll and its tallies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSnapshot {
    pub id: String,
    pub question: String,
    pub options: Vec<PollOption>,
    /// Always the sum of the option counts; recomputed, never read from the wire.
    #[serde(default)]
    pub total_votes: u64,
    #[serde(default)]
    pub closes_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finalized: bool,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub is_tie: bool,
    #[serde(default)]
    pub is_closed: bool,
}

/// How an authoritative count that is lower than the current one is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReconcilePolicy {
    /// The most recently processed message wins.
    #[default]
    LastProcessedWins,
    /// Authoritative counts never go down; provisional counts are still
    /// overwritten.
    Monotonic,
}

/// Result of applying an authoritative count to one option.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed { previous: u64 },
    /// Same count as a provisional local vote, which is now authoritative.
    Confirmed,
    Unchanged,
    /// Dropped by [`ReconcilePolicy::Monotonic`].
    Stale,
    UnknownOption,
}

impl PollSnapshot {
    pub fn new(id: impl Into<String>, question: impl Into<String>, options: Vec<PollOption>) -> Self {
        let mut snapshot = Self {
            id: id.into(),
            question: question.into(),
            options,
            total_votes: 0,
            closes_at: None,
            finalized: false,
            winner: None,
            is_tie: false,
            is_closed: false,
        };
        snapshot.recompute_total();
        snapshot
    }

    /// Re-derives every computed field. Call after decoding from the wire.
    pub fn normalize(&mut self, now: DateTime<Utc>) {
        self.recompute_total();
        self.refresh_closed(now);
    }

    pub fn recompute_total(&mut self) {
        self.total_votes = self.options.iter().map(|o| o.vote_count).sum();
    }

    pub fn option(&self, option_id: &str) -> Option<&PollOption> {
        self.options.iter().find(|o| o.id == option_id)
    }

    /// Replaces (never increments) one option's count with an authoritative
    /// value and clears any provisional tag.
    pub fn apply_vote_count(&mut self, option_id: &str, vote_count: u64, policy: ReconcilePolicy) -> Applied {
        let Some(option) = self.options.iter_mut().find(|o| o.id == option_id) else {
            return Applied::UnknownOption;
        };

        let previous = option.vote_count;
        let was_provisional = option.provisional;
        if policy == ReconcilePolicy::Monotonic && !option.provisional && vote_count < previous {
            return Applied::Stale;
        }

        option.vote_count = vote_count;
        option.provisional = false;
        self.recompute_total();

        if previous != vote_count {
            Applied::Changed { previous }
        } else if was_provisional {
            Applied::Confirmed
        } else {
            Applied::Unchanged
        }
    }

    /// Optimistically counts a local vote before the server confirms it.
    pub fn apply_optimistic_vote(&mut self, option_id: &str) -> bool {
        let Some(option) = self.options.iter_mut().find(|o| o.id == option_id) else {
            return false;
        };
        option.vote_count += 1;
        option.provisional = true;
        self.recompute_total();
        true
    }

    /// Undoes an optimistic vote if no authoritative count replaced it yet.
    pub fn rollback_optimistic_vote(&mut self, option_id: &str) -> bool {
        let Some(option) = self
            .options
            .iter_mut()
            .find(|o| o.id == option_id && o.provisional)
        else {
            return false;
        };
        option.vote_count = option.vote_count.saturating_sub(1);
        option.provisional = false;
        self.recompute_total();
        true
    }

    pub fn is_provisional(&self, option_id: &str) -> bool {
        self.option(option_id).is_some_and(|o| o.provisional)
    }

    /// Options sharing the highest non-zero count.
    pub fn leaders(&self) -> Vec<&PollOption> {
        let top = self.options.iter().map(|o| o.vote_count).max().unwrap_or(0);
        if top == 0 {
            return Vec::new();
        }
        self.options.iter().filter(|o| o.vote_count == top).collect()
    }

    /// Recomputes `is_closed`, and the outcome for polls that closed by time
    /// without the server finalizing them. Returns true if the poll is
    /// closed now but was not before.
    pub fn refresh_closed(&mut self, now: DateTime<Utc>) -> bool {
        let was_closed = self.is_closed;
        self.is_closed = self.finalized || self.closes_at.is_some_and(|at| at <= now);

        if self.is_closed && !self.finalized {
            let leaders: Vec<String> = self.leaders().iter().map(|o| o.id.clone()).collect();
            self.is_tie = leaders.len() > 1;
            self.winner = match leaders.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            };
        }

        self.is_closed && !was_closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultsMode {
    /// Updates arrive over the change feed.
    Live,
    /// The feed is unhealthy; the poll is re-fetched on an interval.
    Polling,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultsEvent {
    /// An applied update landed on a positive multiple of ten.
    Milestone { option_id: String, vote_count: u64 },
    ModeChanged(ResultsMode),
    /// Non-fatal transport problem, only reported while still in live mode.
    TransportError(String),
    ReconnectRequired,
    PollClosed,
}

/// Body of a successful `POST /api/plico/{id}/vote`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteReceipt {
    pub success: bool,
    pub vote_count: u64,
}
