use super::api::PollApi;
use super::models::{Applied, PollSnapshot, ReconcilePolicy, ResultsEvent, ResultsMode, VoteReceipt};
use crate::error::{ApiError, RealtimeError};
use crate::feed::{ChangeEvent, ChangePayload, EventSpec, RowFilter};
use crate::realtime::{RealtimeManager, SubscribeConfig, Subscription};
use crate::timer::{self, TimerHandle};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, info, warn};

/// Consecutive push errors tolerated before switching to polling.
pub const FAILURE_THRESHOLD: u32 = 3;
pub const POLLING_INTERVAL: Duration = Duration::from_millis(3000);
pub const MILESTONE_STEP: u64 = 10;

#[derive(Debug, Clone)]
pub struct ResultsConfig {
    pub failure_threshold: u32,
    pub polling_interval: Duration,
    pub schema: String,
    pub options_table: String,
    pub poll_table: String,
    /// Column on option rows that references the poll.
    pub poll_key_column: String,
    pub reconcile: ReconcilePolicy,
}

impl Default for ResultsConfig {
    fn default() -> Self {
        Self {
            failure_threshold: FAILURE_THRESHOLD,
            polling_interval: POLLING_INTERVAL,
            schema: "public".to_string(),
            options_table: "Option".to_string(),
            poll_table: "Plico".to_string(),
            poll_key_column: "plicoId".to_string(),
            reconcile: ReconcilePolicy::default(),
        }
    }
}

pub fn options_channel(poll_id: &str) -> String {
    format!("poll-{poll_id}")
}

pub fn poll_channel(poll_id: &str) -> String {
    format!("plico-{poll_id}")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OptionRow {
    id: String,
    vote_count: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PollRow {
    #[serde(default)]
    question: Option<String>,
    #[serde(default)]
    closes_at: Option<DateTime<Utc>>,
    #[serde(default)]
    finalized: bool,
    #[serde(default)]
    winner: Option<String>,
    #[serde(default)]
    is_tie: bool,
}

struct ControllerState {
    mode: ResultsMode,
    failure_count: u32,
    polling: Option<TimerHandle>,
    close_timer: Option<TimerHandle>,
    unmounted: bool,
}

enum ErrorAction {
    Report,
    EnterPolling,
    Suppress,
}

struct ControllerInner {
    poll_id: String,
    config: ResultsConfig,
    api: Arc<dyn PollApi>,
    snapshot: watch::Sender<PollSnapshot>,
    events: broadcast::Sender<ResultsEvent>,
    state: Mutex<ControllerState>,
}

impl ControllerInner {
    fn emit(&self, event: ResultsEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    fn is_unmounted(&self) -> bool {
        self.state.lock().unmounted
    }

    fn options_subscription(self: &Arc<Self>) -> SubscribeConfig {
        let spec = EventSpec::new(&self.config.options_table)
            .schema(&self.config.schema)
            .event(ChangeEvent::Update)
            .filter(RowFilter::eq(&self.config.poll_key_column, &self.poll_id).to_string());

        let on_message = Arc::downgrade(self);
        let on_error = Arc::downgrade(self);
        let on_connect = Arc::downgrade(self);
        SubscribeConfig::new(options_channel(&self.poll_id), spec, move |payload| {
            if let Some(inner) = on_message.upgrade() {
                inner.on_option_change(&payload);
            }
        })
        .on_error(move |error| {
            if let Some(inner) = on_error.upgrade() {
                inner.on_push_error(error);
            }
        })
        .on_connect(move || {
            if let Some(inner) = on_connect.upgrade() {
                inner.on_push_healthy();
            }
        })
    }

    fn poll_subscription(self: &Arc<Self>) -> SubscribeConfig {
        let spec = EventSpec::new(&self.config.poll_table)
            .schema(&self.config.schema)
            .event(ChangeEvent::Update)
            .filter(RowFilter::eq("id", &self.poll_id).to_string());

        let weak = Arc::downgrade(self);
        let poll_id = self.poll_id.clone();
        SubscribeConfig::new(poll_channel(&self.poll_id), spec, move |payload| {
            if let Some(inner) = weak.upgrade() {
                inner.on_poll_change(&payload);
            }
        })
        .on_error(move |error| {
            debug!(poll = %poll_id, %error, "poll row channel error");
        })
    }

    fn on_option_change(self: &Arc<Self>, payload: &ChangePayload) {
        if self.is_unmounted() {
            return;
        }
        let row: OptionRow = match serde_json::from_value(payload.row().clone()) {
            Ok(row) => row,
            Err(e) => {
                warn!(poll = %self.poll_id, error = %e, "ignoring malformed option row");
                return;
            }
        };

        let mut applied = Applied::UnknownOption;
        self.snapshot.send_if_modified(|snapshot| {
            applied = snapshot.apply_vote_count(&row.id, row.vote_count, self.config.reconcile);
            matches!(applied, Applied::Changed { .. } | Applied::Confirmed | Applied::Unchanged)
        });

        self.on_push_healthy();

        match applied {
            Applied::Changed { .. } | Applied::Confirmed => {
                if let Applied::Changed { previous } = applied {
                    debug!(poll = %self.poll_id, option = %row.id, previous, votes = row.vote_count, "applied vote count");
                }
                if row.vote_count > 0 && row.vote_count % MILESTONE_STEP == 0 {
                    self.emit(ResultsEvent::Milestone {
                        option_id: row.id,
                        vote_count: row.vote_count,
                    });
                }
            }
            Applied::Unchanged => {}
            Applied::Stale => {
                debug!(poll = %self.poll_id, option = %row.id, votes = row.vote_count, "dropped stale vote count");
            }
            Applied::UnknownOption => {
                warn!(poll = %self.poll_id, option = %row.id, "update for unknown option");
            }
        }
    }

    fn on_poll_change(self: &Arc<Self>, payload: &ChangePayload) {
        if self.is_unmounted() {
            return;
        }
        let row: PollRow = match serde_json::from_value(payload.row().clone()) {
            Ok(row) => row,
            Err(e) => {
                warn!(poll = %self.poll_id, error = %e, "ignoring malformed poll row");
                return;
            }
        };

        let mut became_closed = false;
        self.snapshot.send_modify(|snapshot| {
            if let Some(question) = row.question {
                snapshot.question = question;
            }
            snapshot.closes_at = row.closes_at;
            snapshot.finalized = row.finalized;
            if row.finalized {
                snapshot.winner = row.winner;
                snapshot.is_tie = row.is_tie;
            }
            became_closed = snapshot.refresh_closed(Utc::now());
        });

        if became_closed {
            info!(poll = %self.poll_id, "poll closed");
            self.emit(ResultsEvent::PollClosed);
        }
        self.arm_close_timer();
    }

    /// A message or SUBSCRIBED on the option channel: the push path works.
    fn on_push_healthy(&self) {
        let resumed = {
            let mut state = self.state.lock();
            if state.unmounted {
                return;
            }
            state.failure_count = 0;
            if state.mode == ResultsMode::Polling {
                state.mode = ResultsMode::Live;
                state.polling = None;
                true
            } else {
                false
            }
        };
        if resumed {
            info!(poll = %self.poll_id, "push recovered, polling stopped");
            self.emit(ResultsEvent::ModeChanged(ResultsMode::Live));
        }
    }

    fn on_push_error(self: &Arc<Self>, error: &RealtimeError) {
        let action = {
            let mut state = self.state.lock();
            if state.unmounted {
                return;
            }
            state.failure_count += 1;
            if state.mode == ResultsMode::Polling {
                ErrorAction::Suppress
            } else if state.failure_count >= self.config.failure_threshold {
                state.mode = ResultsMode::Polling;
                state.polling = Some(self.start_polling());
                ErrorAction::EnterPolling
            } else {
                ErrorAction::Report
            }
        };

        match action {
            ErrorAction::Report => self.emit(ResultsEvent::TransportError(error.to_string())),
            ErrorAction::EnterPolling => {
                warn!(poll = %self.poll_id, %error, "push unhealthy, using polling mode");
                self.emit(ResultsEvent::ModeChanged(ResultsMode::Polling));
            }
            ErrorAction::Suppress => debug!(poll = %self.poll_id, %error, "push error while polling"),
        }

        if error.is_terminal() {
            self.emit(ResultsEvent::ReconnectRequired);
        }
    }

    /// Fetches now, then every `polling_interval`.
    fn start_polling(self: &Arc<Self>) -> TimerHandle {
        let weak: Weak<ControllerInner> = Arc::downgrade(self);
        let mut ticker = interval_at(Instant::now(), self.config.polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer::spawn(async move {
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.poll_once().await;
            }
        })
    }

    async fn poll_once(self: &Arc<Self>) {
        match self.api.fetch_poll(&self.poll_id).await {
            Ok(mut fresh) => {
                if self.is_unmounted() {
                    return;
                }
                fresh.normalize(Utc::now());
                self.replace_snapshot(fresh);
            }
            // Fetch failures do not count against the push path.
            Err(e) => warn!(poll = %self.poll_id, error = %e, "polling fetch failed, retrying next tick"),
        }
    }

    fn replace_snapshot(self: &Arc<Self>, fresh: PollSnapshot) {
        let was_closed = self.snapshot.borrow().is_closed;
        self.snapshot.send_if_modified(|snapshot| {
            if *snapshot == fresh {
                false
            } else {
                *snapshot = fresh;
                true
            }
        });
        if !was_closed && self.snapshot.borrow().is_closed {
            self.emit(ResultsEvent::PollClosed);
        }
        self.arm_close_timer();
    }

    fn arm_close_timer(self: &Arc<Self>) {
        let closes_at = {
            let snapshot = self.snapshot.borrow();
            if snapshot.is_closed { None } else { snapshot.closes_at }
        };

        let close_timer = closes_at.map(|at| {
            let delay = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            let weak = Arc::downgrade(self);
            timer::schedule(delay, move || {
                if let Some(inner) = weak.upgrade() {
                    inner.close_at(at);
                }
            })
        });

        let mut state = self.state.lock();
        if !state.unmounted {
            state.close_timer = close_timer;
        }
    }

    fn close_at(&self, at: DateTime<Utc>) {
        let now = Utc::now().max(at);
        let mut became_closed = false;
        self.snapshot.send_if_modified(|snapshot| {
            became_closed = snapshot.refresh_closed(now);
            became_closed
        });
        if became_closed {
            info!(poll = %self.poll_id, "poll closed");
            self.emit(ResultsEvent::PollClosed);
        }
    }
}

/// Keeps a [`PollSnapshot`] current: push updates while the change feed is
/// healthy, interval polling of the REST endpoint while it is not.
///
/// Dropping the controller unmounts it: both channel subscriptions are
/// released and every timer is cancelled.
pub struct HybridResultsController {
    inner: Arc<ControllerInner>,
    subscriptions: Vec<Subscription>,
}

impl HybridResultsController {
    /// Hydrates from the REST endpoint, then subscribes.
    pub async fn mount(
        manager: &RealtimeManager,
        api: Arc<dyn PollApi>,
        poll_id: &str,
        config: ResultsConfig,
    ) -> Result<Self, ApiError> {
        let mut snapshot = api.fetch_poll(poll_id).await?;
        snapshot.normalize(Utc::now());
        Ok(Self::with_snapshot(manager, api, snapshot, config))
    }

    pub fn with_snapshot(
        manager: &RealtimeManager,
        api: Arc<dyn PollApi>,
        snapshot: PollSnapshot,
        config: ResultsConfig,
    ) -> Self {
        let poll_id = snapshot.id.clone();
        let (snapshot, _) = watch::channel(snapshot);
        let (events, _) = broadcast::channel(64);
        let inner = Arc::new(ControllerInner {
            poll_id: poll_id.clone(),
            config,
            api,
            snapshot,
            events,
            state: Mutex::new(ControllerState {
                mode: ResultsMode::Live,
                failure_count: 0,
                polling: None,
                close_timer: None,
                unmounted: false,
            }),
        });

        let subscriptions = vec![
            manager.subscribe(inner.options_subscription()),
            manager.subscribe(inner.poll_subscription()),
        ];
        inner.arm_close_timer();

        info!(poll = %poll_id, "results controller mounted");
        Self {
            inner,
            subscriptions,
        }
    }

    pub fn poll_id(&self) -> &str {
        &self.inner.poll_id
    }

    pub fn snapshot(&self) -> PollSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<PollSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ResultsEvent> {
        self.inner.events.subscribe()
    }

    pub fn mode(&self) -> ResultsMode {
        self.inner.state.lock().mode
    }

    pub fn failure_count(&self) -> u32 {
        self.inner.state.lock().failure_count
    }

    /// Counts the vote locally right away, then confirms it with the server.
    /// A push that lands first wins over the server's reply; a failed vote is
    /// rolled back.
    pub async fn vote(&self, option_id: &str) -> Result<VoteReceipt, ApiError> {
        let counted = self
            .inner
            .snapshot
            .send_if_modified(|snapshot| snapshot.apply_optimistic_vote(option_id));
        if !counted {
            return Err(ApiError::UnknownOption(option_id.to_string()));
        }

        let result = match self.inner.api.cast_vote(&self.inner.poll_id, option_id).await {
            Ok(receipt) if receipt.success => Ok(receipt),
            Ok(_) => Err(ApiError::Rejected {
                status: 502,
                message: "vote was not recorded".to_string(),
            }),
            Err(e) => Err(e),
        };

        match &result {
            Ok(receipt) => {
                self.inner.snapshot.send_if_modified(|snapshot| {
                    if !snapshot.is_provisional(option_id) {
                        return false;
                    }
                    snapshot.apply_vote_count(option_id, receipt.vote_count, ReconcilePolicy::LastProcessedWins);
                    true
                });
            }
            Err(e) => {
                warn!(poll = %self.inner.poll_id, option = %option_id, error = %e, "vote failed, rolling back");
                self.inner
                    .snapshot
                    .send_if_modified(|snapshot| snapshot.rollback_optimistic_vote(option_id));
            }
        }
        result
    }

    pub fn unmount(self) {
        drop(self);
    }
}

impl Drop for HybridResultsController {
    fn drop(&mut self) {
        {
            let mut state = self.inner.state.lock();
            state.unmounted = true;
            state.polling = None;
            state.close_timer = None;
        }
        for subscription in &self.subscriptions {
            subscription.unsubscribe();
        }
        debug!(poll = %self.inner.poll_id, "results controller unmounted");
    }
}
