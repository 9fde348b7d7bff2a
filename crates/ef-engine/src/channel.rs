//! Progress channel: ordered, backpressured delivery to a single subscriber.
//!
//! The publisher half is cheap to clone and may be narrowed to a progress
//! window and tagged with a strategy or sweep point. Every clone shares one
//! lock, so sequence numbers and progress values stay totally ordered even
//! when several tasks publish at once.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use ef_types::{
    EfError, EventPayload, EventStatus, PointTag, ProgressEvent, RunId, Stage, StrategyKind,
};

/// The subscriber has gone away, or the channel already carried its terminal event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("progress channel closed")]
pub struct ChannelClosed;

/// How the task behind a channel ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

struct PublisherState {
    sender: Option<mpsc::Sender<ProgressEvent>>,
    next_sequence: u64,
    progress: u8,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Scope {
    lo: u8,
    hi: u8,
    strategy: Option<StrategyKind>,
    point: Option<PointTag>,
}

impl Scope {
    fn map(&self, local: u8) -> u8 {
        let local = local.min(100) as u32;
        let span = self.hi.saturating_sub(self.lo) as u32;
        (self.lo as u32 + span * local / 100) as u8
    }
}

/// Sending half of a progress channel.
#[derive(Clone)]
pub struct ProgressPublisher {
    run_id: RunId,
    state: Arc<Mutex<PublisherState>>,
    scope: Scope,
}

/// Open a channel buffering at most `capacity` undelivered events.
pub fn channel(run_id: RunId, capacity: usize) -> (ProgressPublisher, ProgressChannel) {
    let (sender, receiver) = mpsc::channel(capacity.max(1));
    let publisher = ProgressPublisher {
        run_id,
        state: Arc::new(Mutex::new(PublisherState {
            sender: Some(sender),
            next_sequence: 0,
            progress: 0,
        })),
        scope: Scope {
            lo: 0,
            hi: 100,
            strategy: None,
            point: None,
        },
    };
    let channel = ProgressChannel {
        run_id,
        receiver,
        task: None,
    };
    (publisher, channel)
}

impl ProgressPublisher {
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Narrow to the sub-window `[lo, hi]` of the current window.
    pub fn scoped(&self, lo: u8, hi: u8) -> Self {
        let mut scoped = self.clone();
        scoped.scope.lo = self.scope.map(lo);
        scoped.scope.hi = self.scope.map(hi.max(lo));
        scoped
    }

    pub fn with_strategy(&self, strategy: StrategyKind) -> Self {
        let mut tagged = self.clone();
        tagged.scope.strategy = Some(strategy);
        tagged
    }

    pub fn with_point(&self, point: PointTag) -> Self {
        let mut tagged = self.clone();
        tagged.scope.point = Some(point);
        tagged
    }

    /// Publish a non-terminal event. `progress` is relative to this publisher's window.
    pub async fn emit(
        &self,
        stage: Stage,
        status: EventStatus,
        progress: u8,
        payload: EventPayload,
    ) -> Result<(), ChannelClosed> {
        let progress = self.scope.map(progress);
        self.publish(stage, status, Some(progress), payload, false).await
    }

    /// Report the failure of one strategy or sweep point. The channel stays open.
    pub async fn unit_failed(
        &self,
        stage: Stage,
        message: impl Into<String>,
        iterations_completed: usize,
    ) -> Result<(), ChannelClosed> {
        let payload = EventPayload::UnitFailed {
            message: message.into(),
            stage,
            iterations_completed,
        };
        self.publish(stage, EventStatus::Error, None, payload, false).await
    }

    /// Terminal success. Closes the channel.
    pub async fn complete(&self, payload: EventPayload) -> Result<(), ChannelClosed> {
        self.publish(Stage::Finalize, EventStatus::Complete, Some(100), payload, true)
            .await
    }

    /// Terminal failure. Closes the channel.
    pub async fn fail(&self, error: &EfError) -> Result<(), ChannelClosed> {
        let stage = error.stage();
        let payload = EventPayload::Error {
            message: error.to_string(),
            stage,
        };
        self.publish(stage, EventStatus::Error, None, payload, true).await
    }

    /// `true` once the subscriber has closed or dropped its end, or the
    /// terminal event went out.
    pub async fn is_cancelled(&self) -> bool {
        let state = self.state.lock().await;
        state.sender.as_ref().map_or(true, |sender| sender.is_closed())
    }

    async fn publish(
        &self,
        stage: Stage,
        status: EventStatus,
        progress: Option<u8>,
        payload: EventPayload,
        terminal: bool,
    ) -> Result<(), ChannelClosed> {
        let mut state = self.state.lock().await;
        let sender = state.sender.clone().ok_or(ChannelClosed)?;

        // Progress never moves backwards within a channel.
        let progress = progress.map_or(state.progress, |p| p.max(state.progress));
        let event = ProgressEvent {
            run_id: self.run_id,
            sequence: state.next_sequence,
            stage,
            status,
            progress,
            payload,
            strategy_id: self.scope.strategy,
            point: self.scope.point,
            terminal,
        };

        // Held across the send so delivery order matches sequence order.
        if sender.send(event).await.is_err() {
            debug!(run_id = %self.run_id, "subscriber gone");
            state.sender = None;
            return Err(ChannelClosed);
        }
        state.next_sequence += 1;
        state.progress = progress;
        if terminal {
            state.sender = None;
        }
        Ok(())
    }
}

/// Receiving half of a progress channel.
///
/// Dropping it, or calling [`ProgressChannel::close`], cancels the run.
pub struct ProgressChannel {
    run_id: RunId,
    receiver: mpsc::Receiver<ProgressEvent>,
    task: Option<JoinHandle<RunOutcome>>,
}

impl ProgressChannel {
    pub(crate) fn attach(&mut self, task: JoinHandle<RunOutcome>) {
        self.task = Some(task);
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    /// Next event, or `None` once the channel is drained and closed.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    /// Stop the run. Already buffered events can still be drained.
    pub fn close(&mut self) {
        self.receiver.close();
    }

    /// Drain every remaining event, then wait for the task to finish.
    pub async fn collect(mut self) -> (Vec<ProgressEvent>, RunOutcome) {
        let mut events = Vec::new();
        while let Some(event) = self.receiver.recv().await {
            events.push(event);
        }
        let outcome = match self.task.take() {
            Some(task) => match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(run_id = %self.run_id, error = %e, "run task did not finish cleanly");
                    RunOutcome::Failed
                }
            },
            None => RunOutcome::Cancelled,
        };
        (events, outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ef_types::IterationRecord;
    use uuid::Uuid;

    fn iteration(i: usize) -> EventPayload {
        EventPayload::Iteration(IterationRecord::new(i, -1.0))
    }

    #[tokio::test]
    async fn sequence_and_terminal() {
        let (publisher, mut channel) = channel(Uuid::new_v4(), 4);
        let task = tokio::spawn(async move {
            publisher
                .emit(Stage::Optimize, EventStatus::Running, 40, iteration(0))
                .await
                .unwrap();
            publisher.complete(iteration(1)).await.unwrap();
            // Nothing goes out after the terminal event.
            publisher
                .emit(Stage::Optimize, EventStatus::Running, 50, iteration(2))
                .await
        });
        channel.attach(tokio::spawn(async { RunOutcome::Completed }));

        assert_eq!(task.await.unwrap(), Err(ChannelClosed));
        let (events, outcome) = channel.collect().await;
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].sequence, 0);
        assert_eq!(events[1].sequence, 1);
        assert_eq!(events[1].progress, 100);
        assert!(events[1].is_terminal());
    }

    #[tokio::test]
    async fn scoped_progress_is_mapped_and_monotonic() {
        let (publisher, mut channel) = channel(Uuid::new_v4(), 16);
        let point = PointTag {
            index: 1,
            total: 2,
            parameter_value: 1.0,
        };
        let second_half = publisher.scoped(50, 100).with_point(point);
        second_half
            .emit(Stage::BuildModel, EventStatus::Complete, 20, iteration(0))
            .await
            .unwrap();
        // Lower absolute value is clamped to the high-water mark.
        publisher
            .emit(Stage::Initialize, EventStatus::Complete, 5, iteration(1))
            .await
            .unwrap();

        let first = channel.recv().await.unwrap();
        assert_eq!(first.progress, 60);
        assert_eq!(first.point, Some(point));
        let second = channel.recv().await.unwrap();
        assert_eq!(second.progress, 60);
        assert_eq!(second.point, None);
    }

    #[tokio::test]
    async fn unit_failure_is_tagged_and_not_terminal() {
        let (publisher, mut channel) = channel(Uuid::new_v4(), 4);
        publisher
            .with_strategy(StrategyKind::DerivativeFree)
            .unit_failed(Stage::Optimize, "evaluator timed out", 7)
            .await
            .unwrap();
        let event = channel.recv().await.unwrap();
        assert!(event.is_unit_failure());
        assert_eq!(event.strategy_id, Some(StrategyKind::DerivativeFree));
        assert!(!publisher.is_cancelled().await);
    }

    #[tokio::test]
    async fn closing_the_subscriber_cancels() {
        let (publisher, mut channel) = channel(Uuid::new_v4(), 4);
        channel.close();
        assert!(publisher.is_cancelled().await);
        let sent = publisher
            .emit(Stage::Initialize, EventStatus::Complete, 5, iteration(0))
            .await;
        assert_eq!(sent, Err(ChannelClosed));

        let (dropped_publisher, dropped) = super::channel(Uuid::new_v4(), 4);
        drop(dropped);
        assert!(dropped_publisher.is_cancelled().await);
    }

    #[tokio::test]
    async fn terminal_error_carries_stage() {
        let (publisher, mut channel) = channel(Uuid::new_v4(), 4);
        let error = EfError::Pipeline {
            stage: Stage::BuildModel,
            source: ef_types::EvaluationError::Timeout { timeout_ms: 10 },
        };
        publisher.fail(&error).await.unwrap();
        let event = channel.recv().await.unwrap();
        assert!(event.is_terminal());
        assert_eq!(event.stage, Stage::BuildModel);
        assert!(matches!(
            event.payload,
            EventPayload::Error {
                stage: Stage::BuildModel,
                ..
            }
        ));
        drop(publisher);
        assert!(channel.recv().await.is_none());
    }
}
