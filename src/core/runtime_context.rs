use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::capability::ChatMessage;
use crate::error::{BudgetKind, NodeError};

/// Identity and shared state of one run. Cloned into nested dispatches.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    pub team_id: String,
    pub tmb_id: String,
    pub app_id: String,
    pub chat_id: String,
    /// Prior conversation turns, oldest first.
    pub history: Arc<Vec<ChatMessage>>,
    /// Counters shared with every nested dispatch of this run.
    pub budget: Arc<RunBudget>,
    /// Nesting depth of sub-workflow calls. The top-level run is 0.
    pub depth: u32,
    pub time_provider: Arc<dyn TimeProvider>,
    pub id_generator: Arc<dyn IdGenerator>,
}

impl Default for RunContext {
    fn default() -> Self {
        let id_generator: Arc<dyn IdGenerator> = Arc::new(RealIdGenerator);
        Self {
            run_id: id_generator.next_id(),
            team_id: String::new(),
            tmb_id: String::new(),
            app_id: String::new(),
            chat_id: String::new(),
            history: Arc::new(Vec::new()),
            budget: Arc::new(RunBudget::unlimited()),
            depth: 0,
            time_provider: Arc::new(RealTimeProvider::default()),
            id_generator,
        }
    }
}

impl RunContext {
    pub fn with_budget(mut self, budget: RunBudget) -> Self {
        self.budget = Arc::new(budget);
        self
    }

    pub fn with_time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    /// Context for a sub-workflow call: same budget and identity, one level deeper.
    pub fn deeper(&self) -> Self {
        Self {
            depth: self.depth + 1,
            ..self.clone()
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.time_provider.now_millis()
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("app_id", &self.app_id)
            .field("chat_id", &self.chat_id)
            .field("depth", &self.depth)
            .field("budget", &self.budget)
            .finish()
    }
}

/// Run-wide execution budget. Counters are consumed before each dispatch.
#[derive(Debug)]
pub struct RunBudget {
    max_run_times: u32,
    max_loop_times: u32,
    run_times: AtomicU32,
    loop_times: AtomicU32,
    /// Absolute deadline in epoch millis.
    deadline_millis: Option<i64>,
}

impl RunBudget {
    pub fn new(max_run_times: u32, max_loop_times: u32) -> Self {
        Self {
            max_run_times,
            max_loop_times,
            run_times: AtomicU32::new(0),
            loop_times: AtomicU32::new(0),
            deadline_millis: None,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(u32::MAX, u32::MAX)
    }

    pub fn with_deadline(mut self, deadline_millis: i64) -> Self {
        self.deadline_millis = Some(deadline_millis);
        self
    }

    /// Restores counters persisted with a paused run.
    pub fn restore(&self, run_times: u32, loop_times: u32) {
        self.run_times.store(run_times, Ordering::SeqCst);
        self.loop_times.store(loop_times, Ordering::SeqCst);
    }

    fn consume(counter: &AtomicU32, max: u32, kind: BudgetKind) -> Result<u32, NodeError> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                (used < max).then_some(used + 1)
            })
            .map(|used| used + 1)
            .map_err(|_| NodeError::BudgetExceeded { kind, limit: max })
    }

    /// Takes one node execution from the budget.
    pub fn consume_run(&self) -> Result<u32, NodeError> {
        Self::consume(&self.run_times, self.max_run_times, BudgetKind::RunTimes)
    }

    /// Takes one loop iteration from the budget.
    pub fn consume_loop(&self) -> Result<u32, NodeError> {
        Self::consume(&self.loop_times, self.max_loop_times, BudgetKind::LoopTimes)
    }

    /// Gives back one node execution. Used when a paused node will be re-run on resume.
    pub fn refund_run(&self) {
        let _ = self
            .run_times
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| used.checked_sub(1));
    }

    pub fn run_times(&self) -> u32 {
        self.run_times.load(Ordering::SeqCst)
    }

    pub fn loop_times(&self) -> u32 {
        self.loop_times.load(Ordering::SeqCst)
    }

    pub fn check_deadline(&self, now_millis: i64) -> Result<(), NodeError> {
        match self.deadline_millis {
            Some(deadline) if now_millis >= deadline => Err(NodeError::Timeout),
            _ => Ok(()),
        }
    }
}

pub trait TimeProvider: Send + Sync {
    /// Epoch millis.
    fn now_millis(&self) -> i64;
}

pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> String;
}

// --- Real implementations ---

#[derive(Default)]
pub struct RealTimeProvider;

impl TimeProvider for RealTimeProvider {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

#[derive(Default)]
pub struct RealIdGenerator;

impl IdGenerator for RealIdGenerator {
    fn next_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

// --- Fake implementations ---

/// Clock that only moves when told to.
pub struct FakeTimeProvider {
    millis: AtomicI64,
}

impl FakeTimeProvider {
    pub fn new(fixed_timestamp: i64) -> Self {
        Self {
            millis: AtomicI64::new(fixed_timestamp.saturating_mul(1000)),
        }
    }

    pub fn advance_millis(&self, delta: i64) {
        self.millis.fetch_add(delta, Ordering::SeqCst);
    }
}

impl TimeProvider for FakeTimeProvider {
    fn now_millis(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

pub struct FakeIdGenerator {
    pub prefix: String,
    pub counter: AtomicU64,
}

impl FakeIdGenerator {
    pub fn new(prefix: String) -> Self {
        Self {
            prefix,
            counter: AtomicU64::new(0),
        }
    }
}

impl IdGenerator for FakeIdGenerator {
    fn next_id(&self) -> String {
        let id = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", self.prefix, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_budget_blocks_at_limit() {
        let budget = RunBudget::new(2, 1);
        assert_eq!(budget.consume_run().unwrap(), 1);
        assert_eq!(budget.consume_run().unwrap(), 2);
        let err = budget.consume_run().unwrap_err();
        assert!(matches!(
            err,
            NodeError::BudgetExceeded {
                kind: BudgetKind::RunTimes,
                limit: 2
            }
        ));
        assert_eq!(budget.run_times(), 2);

        budget.consume_loop().unwrap();
        assert!(budget.consume_loop().is_err());
    }

    #[test]
    fn test_refund_and_restore() {
        let budget = RunBudget::new(5, 5);
        budget.restore(3, 1);
        budget.refund_run();
        assert_eq!(budget.run_times(), 2);
        assert_eq!(budget.loop_times(), 1);
        RunBudget::new(1, 1).refund_run();
    }

    #[test]
    fn test_deadline() {
        let budget = RunBudget::unlimited().with_deadline(1_000);
        assert!(budget.check_deadline(999).is_ok());
        assert!(matches!(budget.check_deadline(1_000), Err(NodeError::Timeout)));
        assert!(RunBudget::unlimited().check_deadline(i64::MAX).is_ok());
    }

    #[test]
    fn test_fake_time_provider() {
        let clock = FakeTimeProvider::new(1_700_000_000);
        assert_eq!(clock.now_millis(), 1_700_000_000_000);
        clock.advance_millis(2_500);
        assert_eq!(clock.now_millis(), 1_700_000_002_500);
    }

    #[test]
    fn test_fake_id_generator() {
        let ids = FakeIdGenerator::new("run".to_string());
        assert_eq!(ids.next_id(), "run-0");
        assert_eq!(ids.next_id(), "run-1");
    }

    #[test]
    fn test_deeper_shares_budget() {
        let ctx = RunContext::default().with_budget(RunBudget::new(3, 3));
        let child = ctx.deeper();
        child.budget.consume_run().unwrap();
        assert_eq!(ctx.budget.run_times(), 1);
        assert_eq!(child.depth, 1);
    }
}
