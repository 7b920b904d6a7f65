/// In-process collective: ranks are threads sharing one rendezvous point
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::Collective;
use crate::{EvalError, Result};

struct Round {
    /// Bumped each time a reduce completes
    generation: u64,
    contributions: Vec<Option<Vec<f64>>>,
    arrived: usize,
    /// Sum produced by the last completed round
    result: Vec<f64>,
    /// Set once the group is broken; every later call fails with it
    failure: Option<String>,
}

struct Shared {
    world_size: usize,
    timeout: Duration,
    round: Mutex<Round>,
    cv: Condvar,
}

/// One member of an in-process collective group
///
/// Used to run several ranks as threads, mainly in tests. Contributions are
/// summed in rank order, so results are identical on every member.
pub struct ThreadGroup {
    rank: usize,
    shared: Arc<Shared>,
}

impl ThreadGroup {
    /// Create all `world_size` members of a group
    pub fn create(world_size: usize, timeout: Duration) -> Result<Vec<ThreadGroup>> {
        if world_size == 0 {
            return Err(EvalError::Configuration(
                "world_size must be >= 1".to_string(),
            ));
        }
        let shared = Arc::new(Shared {
            world_size,
            timeout,
            round: Mutex::new(Round {
                generation: 0,
                contributions: vec![None; world_size],
                arrived: 0,
                result: Vec::new(),
                failure: None,
            }),
            cv: Condvar::new(),
        });
        Ok((0..world_size)
            .map(|rank| ThreadGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Round>> {
        self.shared
            .round
            .lock()
            .map_err(|_| EvalError::Collective("group state poisoned by a panicked rank".to_string()))
    }

    fn fail(&self, mut round: MutexGuard<'_, Round>, reason: String) -> EvalError {
        round.failure = Some(reason.clone());
        drop(round);
        self.shared.cv.notify_all();
        EvalError::Collective(reason)
    }
}

impl Collective for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_sum(&self, values: &mut [f64]) -> Result<()> {
        let mut round = self.lock()?;
        if let Some(reason) = &round.failure {
            return Err(EvalError::Collective(reason.clone()));
        }

        let generation = round.generation;
        round.contributions[self.rank] = Some(values.to_vec());
        round.arrived += 1;

        if round.arrived == self.shared.world_size {
            let mismatch = round
                .contributions
                .iter()
                .enumerate()
                .map(|(rank, c)| (rank, c.as_ref().map_or(0, Vec::len)))
                .find(|&(_, len)| len != values.len());
            if let Some((rank, len)) = mismatch {
                let reason = format!(
                    "rank {} contributed {} values, expected {}",
                    rank,
                    len,
                    values.len()
                );
                return Err(self.fail(round, reason));
            }

            let mut sum = vec![0.0; values.len()];
            for contribution in round.contributions.iter().flatten() {
                for (acc, v) in sum.iter_mut().zip(contribution) {
                    *acc += v;
                }
            }

            values.copy_from_slice(&sum);
            round.result = sum;
            round.contributions.iter_mut().for_each(|c| *c = None);
            round.arrived = 0;
            round.generation += 1;
            drop(round);
            self.shared.cv.notify_all();
            return Ok(());
        }

        let deadline = Instant::now() + self.shared.timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                let reason = format!(
                    "rank {} timed out after {:?} waiting for {} of {} ranks",
                    self.rank,
                    self.shared.timeout,
                    self.shared.world_size - round.arrived,
                    self.shared.world_size
                );
                return Err(self.fail(round, reason));
            }

            let (guard, _) = self
                .shared
                .cv
                .wait_timeout(round, deadline - now)
                .map_err(|_| EvalError::Collective("group state poisoned by a panicked rank".to_string()))?;
            round = guard;

            if let Some(reason) = &round.failure {
                return Err(EvalError::Collective(reason.clone()));
            }
            if round.generation != generation {
                values.copy_from_slice(&round.result);
                return Ok(());
            }
        }
    }
}
