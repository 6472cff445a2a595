//! Placement strategies.
//!
//! A strategy totally reorders the filtered candidates; the scheduler places
//! the task on the first one. The active strategy can be swapped at runtime.

use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::registry::Agent;

/// Orders placement candidates, best first.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Return a permutation of `agents`.
    fn rank_and_sort(&self, agents: Vec<Agent>) -> Vec<Agent>;
}

/// Uniform random order (Fisher-Yates shuffle).
pub struct RandomStrategy {
    rng: Mutex<StdRng>,
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl RandomStrategy {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_os_rng()),
        }
    }

    /// Deterministic order for tests.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Strategy for RandomStrategy {
    fn name(&self) -> &'static str {
        "random"
    }

    fn rank_and_sort(&self, mut agents: Vec<Agent>) -> Vec<Agent> {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        agents.shuffle(&mut *rng);
        agents
    }
}

/// Fill the fullest agent first: least free cpus, then least free memory.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinPackStrategy;

impl Strategy for BinPackStrategy {
    fn name(&self) -> &'static str {
        "binpack"
    }

    fn rank_and_sort(&self, mut agents: Vec<Agent>) -> Vec<Agent> {
        agents.sort_by(|a, b| {
            let (qa, qb) = (a.quantities(), b.quantities());
            qa.cpus
                .total_cmp(&qb.cpus)
                .then(qa.mem.total_cmp(&qb.mem))
                .then_with(|| a.id().cmp(b.id()))
        });
        agents
    }
}

/// Configured strategy name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    #[default]
    Random,
    BinPack,
}

impl StrategyKind {
    pub fn build(self) -> Arc<dyn Strategy> {
        match self {
            Self::Random => Arc::new(RandomStrategy::new()),
            Self::BinPack => Arc::new(BinPackStrategy),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "random" => Ok(Self::Random),
            "binpack" | "bin-pack" => Ok(Self::BinPack),
            other => Err(format!("unknown strategy {other:?}, expected random or binpack")),
        }
    }
}

/// Hot-swappable handle to the active strategy.
pub struct StrategyHandle {
    current: RwLock<Arc<dyn Strategy>>,
}

impl StrategyHandle {
    pub fn new(strategy: Arc<dyn Strategy>) -> Self {
        Self {
            current: RwLock::new(strategy),
        }
    }

    pub fn current(&self) -> Arc<dyn Strategy> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the active strategy. In-flight placements keep the old one.
    pub fn set(&self, strategy: Arc<dyn Strategy>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = strategy;
    }
}
