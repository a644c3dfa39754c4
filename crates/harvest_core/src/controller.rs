use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

/// Tuning knobs for the feedback controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Lowest parallelism the controller will ever recommend.
    pub min: usize,
    /// Starting parallelism.
    pub initial: usize,
    /// Highest parallelism the controller will ever recommend.
    pub max: usize,
    /// Minimum time between decisions; ticks arriving earlier are ignored.
    pub dwell: Duration,
    /// Number of (target, throughput) samples kept; oldest evicted first.
    pub history_capacity: usize,
    /// Error rate above which the target is cut multiplicatively.
    pub error_rate_threshold: f64,
    /// Multiplier applied to the target on an error-rate cut.
    pub contraction_factor: f64,
    /// Samples gathered before throughput history drives decisions.
    pub warmup_samples: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            min: 1,
            initial: 2,
            max: 8,
            dwell: Duration::from_secs(20),
            history_capacity: 12,
            error_rate_threshold: 0.1,
            contraction_factor: 0.7,
            warmup_samples: 5,
        }
    }
}

impl ControllerConfig {
    /// Builds a config with the given bounds, validating `1 <= min <= initial <= max`.
    pub fn bounded(
        min: usize,
        initial: usize,
        max: usize,
    ) -> Result<Self, ControllerConfigError> {
        if min == 0 || min > initial || initial > max {
            return Err(ControllerConfigError { min, initial, max });
        }
        Ok(Self {
            min,
            initial,
            max,
            ..Self::default()
        })
    }
}

/// Rejected concurrency bounds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfigError {
    pub min: usize,
    pub initial: usize,
    pub max: usize,
}

impl fmt::Display for ControllerConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid concurrency bounds: expected 1 <= min <= initial <= max, got min={} initial={} max={}",
            self.min, self.initial, self.max
        )
    }
}

impl std::error::Error for ControllerConfigError {}

/// Outcome of one controller decision, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// Target unchanged this cycle.
    Unchanged,
    /// Target stepped up by one.
    Raised(usize),
    /// Target stepped down by one.
    Lowered(usize),
    /// Target cut multiplicatively after an elevated error rate.
    Contracted(usize),
}

/// Hill-climbing concurrency controller.
///
/// Success/error counts accumulate between decisions; `tick` periodically
/// converts them into a throughput sample and nudges the target toward the
/// historically best-performing level. Contraction on an elevated error rate
/// is immediate and multiplicative, expansion is linear and exploratory.
///
/// Time is passed in explicitly as elapsed time since controller start, so
/// the whole state machine is deterministic under test.
///
/// The state itself is not synchronized; callers that share it across tasks
/// wrap it in a single mutex.
#[derive(Debug)]
pub struct ConcurrencyController {
    config: ControllerConfig,
    target: usize,
    successes: u64,
    errors: u64,
    last_decision: Duration,
    // Samples are keyed by raw target value, so warm-up and steady-state
    // observations at the same level share a bucket. Known limitation of
    // this control law.
    history: VecDeque<(usize, f64)>,
}

impl ConcurrencyController {
    pub fn new(config: ControllerConfig) -> Self {
        let target = config.initial.clamp(config.min, config.max);
        Self {
            config,
            target,
            successes: 0,
            errors: 0,
            last_decision: Duration::ZERO,
            history: VecDeque::new(),
        }
    }

    /// Current recommended parallelism, always within `[min, max]`.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Records one successfully completed item.
    pub fn record_success(&mut self) {
        self.successes += 1;
    }

    /// Records one item abandoned after its retries were exhausted.
    pub fn record_error(&mut self) {
        self.errors += 1;
    }

    /// Success and error counts accumulated since the last decision.
    pub fn counts_since_decision(&self) -> (u64, u64) {
        (self.successes, self.errors)
    }

    /// Runs the periodic decision function.
    ///
    /// `now` is elapsed time since the controller started. Returns `None`
    /// while the dwell interval since the previous decision has not passed.
    pub fn tick(&mut self, now: Duration) -> Option<Adjustment> {
        let elapsed = now.checked_sub(self.last_decision)?;
        if elapsed < self.config.dwell {
            return None;
        }
        Some(self.decide(now, elapsed))
    }

    fn decide(&mut self, now: Duration, elapsed: Duration) -> Adjustment {
        let total = self.successes + self.errors;
        if total == 0 {
            self.reset(now);
            return Adjustment::Unchanged;
        }

        let error_rate = self.errors as f64 / total as f64;
        if error_rate > self.config.error_rate_threshold {
            // Backpressure takes precedence over optimization: cut hard and
            // skip the hill-climbing step entirely this cycle.
            let cut = (self.target as f64 * self.config.contraction_factor).floor() as usize;
            self.target = cut.max(self.config.min);
            self.reset(now);
            return Adjustment::Contracted(self.target);
        }

        let throughput = self.successes as f64 / elapsed.as_secs_f64().max(f64::EPSILON);
        self.push_sample(self.target, throughput);

        if self.history.len() < self.config.warmup_samples {
            // Too little evidence to compare levels; probe upward.
            let adjustment = self.step_to(self.target + 1);
            self.reset(now);
            return adjustment;
        }

        let best = self.best_target();
        let next = match self.target.cmp(&best) {
            std::cmp::Ordering::Less => self.target + 1,
            std::cmp::Ordering::Greater => self.target - 1,
            // At the known peak, still step up once in a while looking for a
            // higher one.
            std::cmp::Ordering::Equal => self.target + 1,
        };
        let adjustment = self.step_to(next);
        self.reset(now);
        adjustment
    }

    fn step_to(&mut self, next: usize) -> Adjustment {
        let clamped = next.clamp(self.config.min, self.config.max);
        let adjustment = match clamped.cmp(&self.target) {
            std::cmp::Ordering::Greater => Adjustment::Raised(clamped),
            std::cmp::Ordering::Less => Adjustment::Lowered(clamped),
            std::cmp::Ordering::Equal => Adjustment::Unchanged,
        };
        self.target = clamped;
        adjustment
    }

    fn push_sample(&mut self, target: usize, throughput: f64) {
        if self.history.len() == self.config.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back((target, throughput));
    }

    /// Target level with the highest average observed throughput.
    fn best_target(&self) -> usize {
        let mut groups: Vec<(usize, f64, u32)> = Vec::new();
        for &(target, throughput) in &self.history {
            match groups.iter_mut().find(|(t, _, _)| *t == target) {
                Some((_, sum, count)) => {
                    *sum += throughput;
                    *count += 1;
                }
                None => groups.push((target, throughput, 1)),
            }
        }
        groups
            .iter()
            .map(|&(target, sum, count)| (target, sum / count as f64))
            .max_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
            .map(|(target, _)| target)
            .unwrap_or(self.target)
    }

    // Counters and the decision timestamp always reset together.
    fn reset(&mut self, now: Duration) {
        self.successes = 0;
        self.errors = 0;
        self.last_decision = now;
    }
}
