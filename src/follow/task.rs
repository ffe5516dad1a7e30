//! Shard Follow Task
//!
//! Owns one leader shard -> follower shard pipeline and its lifecycle:
//!
//! ```text
//! STARTING -> FOLLOWING <-> PAUSED
//!                 |            |
//!                 +-> FAILED <-+
//!                 +-> STOPPED <+
//! ```
//!
//! The pipeline runs on its own tokio task. Pause is graceful: reads stop,
//! in-flight reads land in the buffer and the applier drains it before the
//! state flips. Stop is hard: in-flight work is abandoned and buffered
//! batches are discarded. Either way the checkpoint only reflects writes the
//! follower acknowledged.

use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    Applier, ChangesFetcher, FollowParameters, FollowTaskState, ShardPairing, StatsSnapshot,
    TaskCounters, WriteBuffer,
};
use crate::error::{Error, Result};
use crate::shard::{FollowerCluster, LeaderCluster};
use crate::state::{Checkpoint, CheckpointStore, CheckpointTracker};

/// How a pipeline run ended
#[derive(Debug)]
enum PipelineExit {
    /// Paused and fully drained
    Drained,
    /// Hard-cancelled
    Stopped,
    Failed(String),
}

struct RunHandle {
    pause: CancellationToken,
    stop: CancellationToken,
    join: JoinHandle<PipelineExit>,
}

/// Lifecycle commands serialize on this
struct Control {
    params: FollowParameters,
    run: Option<RunHandle>,
}

/// Follow task of one shard pairing
pub struct ShardFollowTask {
    pairing: ShardPairing,
    state: watch::Sender<FollowTaskState>,
    counters: Arc<TaskCounters>,
    tracker: Arc<CheckpointTracker>,
    leader: Arc<dyn LeaderCluster>,
    follower: Arc<dyn FollowerCluster>,
    buffer: Mutex<Option<Arc<WriteBuffer>>>,
    control: tokio::sync::Mutex<Control>,
}

impl ShardFollowTask {
    /// Create a task in STARTING, positioned at the persisted checkpoint
    pub async fn new(
        pairing: ShardPairing,
        params: FollowParameters,
        leader: Arc<dyn LeaderCluster>,
        follower: Arc<dyn FollowerCluster>,
        store: Arc<CheckpointStore>,
    ) -> Result<Arc<Self>> {
        params.validate()?;
        let tracker = CheckpointTracker::open(pairing.follower.clone(), store).await?;
        let (state, _) = watch::channel(FollowTaskState::Starting);

        Ok(Arc::new(Self {
            pairing,
            state,
            counters: Arc::new(TaskCounters::new()),
            tracker: Arc::new(tracker),
            leader,
            follower,
            buffer: Mutex::new(None),
            control: tokio::sync::Mutex::new(Control { params, run: None }),
        }))
    }

    /// STARTING -> FOLLOWING: spawn the pipeline
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut control = self.control.lock().await;
        self.transition(FollowTaskState::Following, "start")?;
        let checkpoint = self.tracker.checkpoint();
        tracing::info!(
            "Following {} from seq_no {}",
            self.pairing,
            checkpoint.next_seq_no()
        );
        self.spawn_pipeline(&mut control);
        Ok(())
    }

    /// FOLLOWING -> PAUSED. Returns once in-flight reads have landed and
    /// the buffer is drained. A no-op when already paused.
    pub async fn pause(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        match self.state() {
            FollowTaskState::Paused => return Ok(()),
            FollowTaskState::Following => {}
            other => return Err(self.invalid_state(other, "pause")),
        }

        let run = control
            .run
            .take()
            .ok_or_else(|| Error::Internal(format!("{} is following without a pipeline", self.pairing)))?;
        run.pause.cancel();

        match self.join(run).await? {
            PipelineExit::Drained => {
                self.transition(FollowTaskState::Paused, "pause")?;
                tracing::info!(
                    "Paused {} at seq_no {}",
                    self.pairing,
                    self.tracker.checkpoint().seq_no
                );
                Ok(())
            }
            PipelineExit::Failed(_) | PipelineExit::Stopped => {
                Err(self.invalid_state(self.state(), "pause"))
            }
        }
    }

    /// PAUSED -> FOLLOWING, optionally with new parameters. Restarts one
    /// past the persisted checkpoint.
    pub async fn resume(self: &Arc<Self>, params: Option<FollowParameters>) -> Result<()> {
        let mut control = self.control.lock().await;
        let state = self.state();
        if state != FollowTaskState::Paused {
            return Err(self.invalid_state(state, "resume"));
        }

        if let Some(params) = params {
            params.validate()?;
            control.params = params;
        }
        let checkpoint = self.tracker.reload().await?;

        self.transition(FollowTaskState::Following, "resume")?;
        tracing::info!(
            "Resuming {} from seq_no {}",
            self.pairing,
            checkpoint.next_seq_no()
        );
        self.spawn_pipeline(&mut control);
        Ok(())
    }

    /// Hard stop. Idempotent on STOPPED; a FAILED task is released but
    /// stays FAILED.
    pub async fn stop(&self) -> Result<()> {
        let mut control = self.control.lock().await;
        if self.state() == FollowTaskState::Stopped {
            return Ok(());
        }

        if let Some(run) = control.run.take() {
            run.stop.cancel();
            run.pause.cancel();
            self.join(run).await?;
        }

        if self.state() == FollowTaskState::Failed {
            return Ok(());
        }
        self.transition(FollowTaskState::Stopped, "stop")?;
        tracing::info!(
            "Stopped {} at seq_no {}",
            self.pairing,
            self.tracker.checkpoint().seq_no
        );
        Ok(())
    }

    pub fn state(&self) -> FollowTaskState {
        *self.state.borrow()
    }

    pub fn checkpoint(&self) -> Checkpoint {
        self.tracker.checkpoint()
    }

    pub fn pairing(&self) -> &ShardPairing {
        &self.pairing
    }

    pub fn follower_index(&self) -> &str {
        &self.pairing.follower.index
    }

    /// Current parameters
    pub async fn params(&self) -> FollowParameters {
        self.control.lock().await.params.clone()
    }

    /// Progress snapshot
    pub fn stats(&self) -> StatsSnapshot {
        let buffered = self
            .buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|b| (b.batch_count(), b.operation_count()))
            .unwrap_or_default();
        StatsSnapshot::build(self, &self.counters, buffered)
    }

    fn invalid_state(&self, state: FollowTaskState, operation: &'static str) -> Error {
        Error::InvalidState {
            follower_index: self.pairing.follower.index.clone(),
            shard: self.pairing.follower.shard,
            state,
            operation,
        }
    }

    fn transition(&self, next: FollowTaskState, operation: &'static str) -> Result<()> {
        let mut refused = None;
        self.state.send_if_modified(|current| {
            if current.can_transition_to(next) {
                tracing::debug!("{}: {} -> {}", self.pairing, current, next);
                *current = next;
                true
            } else {
                refused = Some(*current);
                false
            }
        });
        match refused {
            Some(current) => Err(self.invalid_state(current, operation)),
            None => Ok(()),
        }
    }

    fn mark_failed(&self, err: &Error) {
        tracing::error!("Follow task {} failed: {}", self.pairing, err);
        self.counters.set_failure(err.to_string());
        if let Err(e) = self.transition(FollowTaskState::Failed, "fail") {
            tracing::warn!("{}", e);
        }
    }

    async fn join(&self, run: RunHandle) -> Result<PipelineExit> {
        run.join
            .await
            .map_err(|e| Error::Internal(format!("follow task {} panicked: {}", self.pairing, e)))
    }

    fn spawn_pipeline(self: &Arc<Self>, control: &mut Control) {
        let params = control.params.clone();
        let buffer = Arc::new(WriteBuffer::new(
            params.max_write_buffer_count,
            params.max_write_buffer_size,
        ));
        *self.buffer.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&buffer));

        let pause = CancellationToken::new();
        let stop = CancellationToken::new();
        let task = Arc::clone(self);
        let (pause_signal, stop_signal) = (pause.clone(), stop.clone());

        let join = tokio::spawn(async move {
            tokio::select! {
                _ = stop_signal.cancelled() => {
                    buffer.close();
                    let dropped = buffer.discard();
                    tracing::debug!(
                        "{}: discarded {} buffered operations on stop",
                        task.pairing,
                        dropped.operations
                    );
                    PipelineExit::Stopped
                }
                result = task.run_pipeline(&params, &buffer, &pause_signal) => match result {
                    Ok(()) => PipelineExit::Drained,
                    Err(e) => {
                        task.mark_failed(&e);
                        PipelineExit::Failed(e.to_string())
                    }
                }
            }
        });

        control.run = Some(RunHandle { pause, stop, join });
    }

    /// Read loop and apply loop, joined. Returns `Ok` once paused and
    /// drained; any error is permanent for this task.
    async fn run_pipeline(
        &self,
        params: &FollowParameters,
        buffer: &WriteBuffer,
        pause: &CancellationToken,
    ) -> Result<()> {
        let halt = pause.child_token();
        let fetcher = ChangesFetcher::new(
            Arc::clone(&self.leader),
            self.pairing.leader.clone(),
            params,
            Arc::clone(&self.counters),
        );
        let applier = Applier::new(
            Arc::clone(&self.follower),
            Arc::clone(&self.tracker),
            params,
            Arc::clone(&self.counters),
        );
        let start = self.tracker.checkpoint().next_seq_no();

        let read_loop = async {
            let result = fetcher.run(start, buffer, &halt).await;
            buffer.close();
            match result {
                Ok(()) | Err(Error::Cancelled) => Ok(()),
                Err(e) => Err(e),
            }
        };

        let apply_loop = async {
            while let Some(batch) = buffer.take().await {
                match applier.apply(batch, pause).await {
                    Ok(_) => {}
                    Err(Error::Cancelled) => {
                        halt.cancel();
                        buffer.close();
                        let dropped = buffer.discard();
                        tracing::debug!(
                            "{}: pause interrupted a write, dropped {} buffered operations",
                            self.pairing,
                            dropped.operations
                        );
                        return Ok(());
                    }
                    Err(e) => {
                        halt.cancel();
                        buffer.close();
                        buffer.discard();
                        return Err(e);
                    }
                }
            }
            Ok(())
        };

        let (read, apply) = tokio::join!(read_loop, apply_loop);
        apply?;
        read
    }
}
