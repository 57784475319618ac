//! Handle to a spawned run.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::core::event_bus::RunEvent;
use crate::core::outcome::RunOutcome;
use crate::error::{WorkflowError, WorkflowResult};

/// A run executing on the tokio runtime.
///
/// Events arrive in causal order on [`next_event`](Self::next_event). The
/// channel is bounded: a consumer that stops reading applies backpressure to
/// the run, and one that drops the handle (or calls [`cancel`](Self::cancel))
/// stops it at the next node boundary with kind `cancelled`.
pub struct RunHandle {
    run_id: String,
    events: mpsc::Receiver<RunEvent>,
    task: JoinHandle<WorkflowResult<RunOutcome>>,
}

impl RunHandle {
    pub(crate) fn new(
        run_id: String,
        events: mpsc::Receiver<RunEvent>,
        task: JoinHandle<WorkflowResult<RunOutcome>>,
    ) -> Self {
        Self {
            run_id,
            events,
            task,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Next event, or `None` once the run has finished and the channel is drained.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        self.events.recv().await
    }

    /// Reads every remaining event, then waits for the outcome.
    pub async fn collect(mut self) -> (Vec<RunEvent>, WorkflowResult<RunOutcome>) {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        (events, join(self.task).await)
    }

    /// Drains events without keeping them and returns the outcome.
    pub async fn outcome(self) -> WorkflowResult<RunOutcome> {
        self.collect().await.1
    }

    /// Stops the run at the next node boundary.
    pub async fn cancel(mut self) -> WorkflowResult<RunOutcome> {
        self.events.close();
        while self.events.recv().await.is_some() {}
        join(self.task).await
    }

    /// Splits the handle into its event receiver and the run task.
    pub fn into_parts(
        self,
    ) -> (
        mpsc::Receiver<RunEvent>,
        JoinHandle<WorkflowResult<RunOutcome>>,
    ) {
        (self.events, self.task)
    }
}

async fn join(task: JoinHandle<WorkflowResult<RunOutcome>>) -> WorkflowResult<RunOutcome> {
    task.await
        .map_err(|e| WorkflowError::InternalError(format!("run task failed: {}", e)))?
}
