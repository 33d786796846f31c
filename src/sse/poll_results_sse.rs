use crate::results::{HybridResultsController, PollSnapshot, ResultsEvent};
use crate::sse::models::LiveEvent;
use crate::startup::AppState;
use axum::{
    extract::{Extension, Path},
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use std::{convert::Infallible, time::Duration};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

enum Next {
    Snapshot,
    Status,
    Results(ResultsEvent),
    Done,
}

/// Streams one poll's live results. Each stream mounts its own controller;
/// viewers of the same poll share the upstream channel through the
/// registry. The controller unmounts when the client goes away.
pub async fn poll_results_sse(
    Extension(app_state): Extension<AppState>,
    Path(poll_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = async_stream::stream! {
        let mounted = HybridResultsController::mount(
            &app_state.manager,
            app_state.api.clone(),
            &poll_id,
            app_state.results.clone(),
        )
        .await;

        match mounted {
            Ok(controller) => {
                let mut snapshots = controller.watch();
                let mut events = controller.events();
                let mut status = app_state.manager.connection_state();

                yield Ok(LiveEvent::Init {
                    poll: controller.snapshot(),
                    mode: controller.mode(),
                }
                .into_event());

                loop {
                    let next = tokio::select! {
                        changed = snapshots.changed() => match changed {
                            Ok(()) => Next::Snapshot,
                            Err(_) => Next::Done,
                        },
                        changed = status.changed() => match changed {
                            Ok(()) => Next::Status,
                            Err(_) => Next::Done,
                        },
                        received = events.recv() => match received {
                            Ok(event) => Next::Results(event),
                            Err(RecvError::Lagged(skipped)) => {
                                debug!(poll = %poll_id, skipped, "live stream lagged");
                                continue;
                            }
                            Err(RecvError::Closed) => Next::Done,
                        },
                    };

                    match next {
                        Next::Snapshot => {
                            let poll: PollSnapshot = snapshots.borrow_and_update().clone();
                            yield Ok(LiveEvent::VoteUpdate(poll).into_event());
                        }
                        Next::Status => {
                            let state = status.borrow_and_update().clone();
                            yield Ok(LiveEvent::Status(state).into_event());
                        }
                        Next::Results(event) => {
                            yield Ok(LiveEvent::Results {
                                poll_id: poll_id.clone(),
                                event,
                            }
                            .into_event());
                        }
                        Next::Done => break,
                    }
                }
            }
            Err(e) => {
                warn!(poll = %poll_id, error = %e, "failed to load poll for live stream");
                yield Ok(LiveEvent::Error(e.to_string()).into_event());
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    )
}
