use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use super::{Graph, GraphConfig, GraphError, GraphEvent, GraphStream};
use crate::domain::RunUser;
use crate::runtime::context;

/// One scripted action.
#[derive(Debug, Clone)]
pub enum Step {
    Emit(GraphEvent),
    Sleep(Duration),
    Fail(GraphError),
    /// Never completes; only cancellation or a timeout ends the attempt.
    Hang,
}

/// What a scripted graph saw when an attempt started.
#[derive(Debug, Clone)]
pub struct ObservedCall {
    pub input: Value,
    pub config: GraphConfig,
    pub user: Option<RunUser>,
}

/// A graph that replays a fixed list of steps.
///
/// Used to drive deterministic runs: failures on the first attempts,
/// hangs, slow steps and hand-built checkpoints.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGraph {
    steps: Vec<Step>,
    failing_attempts: Option<(u32, GraphError)>,
    calls: Arc<Mutex<Vec<ObservedCall>>>,
}

impl ScriptedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn emit(mut self, event: GraphEvent) -> Self {
        self.steps.push(Step::Emit(event));
        self
    }

    #[must_use]
    pub fn sleep(mut self, duration: Duration) -> Self {
        self.steps.push(Step::Sleep(duration));
        self
    }

    #[must_use]
    pub fn fail(mut self, error: GraphError) -> Self {
        self.steps.push(Step::Fail(error));
        self
    }

    #[must_use]
    pub fn hang(mut self) -> Self {
        self.steps.push(Step::Hang);
        self
    }

    /// Attempts `1..=attempts` fail up front with `error`.
    #[must_use]
    pub fn fail_attempts(mut self, attempts: u32, error: GraphError) -> Self {
        self.failing_attempts = Some((attempts, error));
        self
    }

    pub fn calls(&self) -> Vec<ObservedCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Graph for ScriptedGraph {
    fn step(&self, input: Value, config: GraphConfig) -> GraphStream {
        let steps = self.steps.clone();
        let failing = self.failing_attempts.clone();
        let calls = Arc::clone(&self.calls);

        Box::pin(async_stream::stream! {
            let attempt = config.attempt;
            calls
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(ObservedCall { input, config, user: context::current_user() });

            if let Some((attempts, error)) = failing {
                if attempt <= attempts {
                    yield Err(error);
                    return;
                }
            }

            for step in steps {
                match step {
                    Step::Emit(event) => yield Ok(event),
                    Step::Sleep(duration) => tokio::time::sleep(duration).await,
                    Step::Fail(error) => {
                        yield Err(error);
                        return;
                    }
                    Step::Hang => futures::future::pending::<()>().await,
                }
            }
        })
    }
}
