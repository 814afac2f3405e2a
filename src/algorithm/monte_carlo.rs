use std::collections::VecDeque;
use std::time::Duration;

use anyhow::Result;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};

use super::interface::{
    draw, Algorithm, AlgorithmContext, AlgorithmOutput, AlgorithmState, IterationResult, Step,
    TerminationReason,
};
use crate::error::InversionError;
use crate::job_pool::CollectMode;
use crate::math::logaddexp;
use crate::moment_tensor::MomentTensorBatch;
use crate::registry::{Prior, Sampler};
use crate::sample::SampleStore;

/// Stop once the evidence estimate settles.
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceSettings {
    /// Number of iterations the estimate is compared over.
    pub window: usize,
    /// Largest change of the ln evidence over the window that counts as converged.
    pub tolerance: f64,
}

impl Default for ConvergenceSettings {
    fn default() -> Self {
        Self {
            window: 10,
            tolerance: 1e-3,
        }
    }
}

/// Settings for [`RandomMonteCarlo`].
#[derive(Debug, Clone)]
pub struct MonteCarloSettings {
    /// Total number of candidates to evaluate.
    pub max_samples: usize,
    /// Candidates per job.
    pub batch_size: usize,
    /// Number of jobs kept in flight.
    pub parallel_batches: usize,
    /// Registered name of the candidate generator.
    pub sampler: String,
    /// Registered name of the prior.
    pub prior: String,
    pub max_iterations: Option<u64>,
    pub max_time: Option<Duration>,
    pub convergence: Option<ConvergenceSettings>,
    pub seed: u64,
}

impl Default for MonteCarloSettings {
    fn default() -> Self {
        Self {
            max_samples: 100_000,
            batch_size: 1000,
            parallel_batches: 4,
            sampler: "uniform".to_string(),
            prior: "uniform".to_string(),
            max_iterations: None,
            max_time: None,
            convergence: None,
            seed: 0,
        }
    }
}

/// Independent sampling of candidates.
///
/// Batches carry no dependency on each other, so results may arrive in any
/// order. Every aggregate is accumulated with commutative operations only.
pub struct RandomMonteCarlo {
    settings: MonteCarloSettings,
    context: AlgorithmContext,
    state: AlgorithmState,
    rng: ChaCha8Rng,
    capabilities: Option<(Sampler, Prior)>,
    sample: Option<SampleStore>,
    generated: usize,
    evaluated: usize,
    /// `ln Σ exp(ln L + ln prior)` over every evaluated candidate.
    ln_total: f64,
    history: VecDeque<f64>,
}

impl RandomMonteCarlo {
    pub fn new(settings: MonteCarloSettings, context: AlgorithmContext) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(settings.seed);
        Self {
            settings,
            context,
            state: AlgorithmState::default(),
            rng,
            capabilities: None,
            sample: None,
            generated: 0,
            evaluated: 0,
            ln_total: f64::NEG_INFINITY,
            history: VecDeque::new(),
        }
    }

    /// Current evidence estimate `ln Z = ln Σ p − ln N`.
    pub fn ln_evidence(&self) -> f64 {
        if self.evaluated == 0 {
            return f64::NEG_INFINITY;
        }
        self.ln_total - (self.evaluated as f64).ln()
    }

    fn draw(&mut self, n: usize) -> Result<MomentTensorBatch> {
        let (sampler, _) = self
            .capabilities
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("Algorithm was not initialised"))?;
        let batch = draw(sampler, n, self.context.events, &mut self.rng)?;
        self.generated += batch.len();
        Ok(batch)
    }

    fn converged(&self) -> bool {
        let Some(convergence) = self.settings.convergence else {
            return false;
        };
        if self.history.len() <= convergence.window {
            return false;
        }
        let (Some(first), Some(last)) = (self.history.front(), self.history.back()) else {
            return false;
        };
        first.is_finite() && last.is_finite() && (last - first).abs() < convergence.tolerance
    }

    fn check_termination(&self) -> Option<TerminationReason> {
        if self.evaluated >= self.settings.max_samples {
            return Some(TerminationReason::SampleBudget);
        }
        if self.converged() {
            return Some(TerminationReason::Converged);
        }
        self.state
            .exhausted(self.settings.max_iterations, self.settings.max_time)
    }
}

impl Algorithm for RandomMonteCarlo {
    fn name(&self) -> &str {
        "monte_carlo"
    }

    fn collect_mode(&self) -> CollectMode {
        CollectMode::Unordered
    }

    fn chunk_size(&self) -> Option<usize> {
        Some(self.settings.batch_size.max(1))
    }

    fn initialise(&mut self) -> Result<Step> {
        let capabilities = self
            .context
            .capabilities(&self.settings.sampler, &self.settings.prior)?;
        if self.settings.batch_size == 0 || self.settings.parallel_batches == 0 {
            return Err(InversionError::configuration(
                "Monte Carlo batch size and number of parallel batches must be positive",
            )
            .into());
        }
        self.capabilities = Some(capabilities);
        self.sample = Some(SampleStore::from_settings(self.context.storage.as_ref())?);
        self.state.start()?;

        if self.settings.max_samples == 0 {
            self.state.terminate(TerminationReason::SampleBudget);
            return Ok(Step::terminate(self.context.events));
        }
        let first = (self.settings.batch_size * self.settings.parallel_batches)
            .min(self.settings.max_samples);
        Ok(Step::next(self.draw(first)?))
    }

    fn iterate(&mut self, result: IterationResult) -> Result<Step> {
        self.state.ensure_running()?;
        let prior = self
            .capabilities
            .as_ref()
            .map(|(_, prior)| prior.clone())
            .ok_or_else(|| anyhow::anyhow!("Algorithm was not initialised"))?;
        if result.ln_pdf.len() != result.count || result.candidates.len() != result.count {
            return Err(InversionError::SizeMismatch {
                left: result.count,
                right: result.ln_pdf.len(),
            }
            .into());
        }
        self.state.iteration += 1;

        let mut records = Vec::new();
        for (j, ln_likelihood) in result.ln_pdf.iter().enumerate() {
            let candidate = result.candidates.candidate(j);
            let ln_p = ln_likelihood + prior(&candidate);
            let ln_p = if ln_p.is_nan() { f64::NEG_INFINITY } else { ln_p };
            self.ln_total = logaddexp(self.ln_total, ln_p);
            if ln_p.is_finite() {
                records.push(result.record(j, candidate, ln_p));
            }
        }
        let accepted = records.len() as u64;
        self.state.accepted += accepted;
        self.state.rejected += result.count as u64 - accepted;
        self.evaluated += result.count;
        if let Some(sample) = self.sample.as_mut() {
            sample.append(records)?;
            sample.record_acceptance(accepted, result.count as u64);
        }

        if let Some(convergence) = self.settings.convergence {
            self.history.push_back(self.ln_evidence());
            while self.history.len() > convergence.window + 1 {
                self.history.pop_front();
            }
        }

        if let Some(reason) = self.check_termination() {
            self.state.terminate(reason);
            info!(
                iterations = self.state.iteration,
                evaluated = self.evaluated,
                ln_evidence = self.ln_evidence(),
                %reason,
                "monte carlo sampling finished"
            );
            return Ok(Step::terminate(self.context.events));
        }

        let remaining = self.settings.max_samples.saturating_sub(self.generated);
        let replenish = result.count.min(remaining);
        debug!(
            iteration = self.state.iteration,
            evaluated = self.evaluated,
            replenish,
            "monte carlo iteration"
        );
        if replenish == 0 {
            return Ok(Step::wait(self.context.events));
        }
        Ok(Step::next(self.draw(replenish)?))
    }

    fn state(&self) -> &AlgorithmState {
        &self.state
    }

    fn output(mut self: Box<Self>) -> Result<AlgorithmOutput> {
        let termination = self
            .state
            .termination()
            .ok_or(InversionError::NotTerminated)?;
        let mut sample = match self.sample.take() {
            Some(sample) => sample,
            None => SampleStore::from_settings(None)?,
        };
        sample.flush()?;
        let converged = match termination {
            TerminationReason::Converged => true,
            TerminationReason::SampleBudget => self.settings.convergence.is_none(),
            TerminationReason::IterationLimit | TerminationReason::TimeBudget => false,
        };
        Ok(AlgorithmOutput {
            sample,
            termination,
            converged,
            ln_evidence: Some(self.ln_evidence()),
            iterations: self.state.iteration,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::lnpdf::LnPdf;
    use crate::moment_tensor::uniform_batch;
    use crate::registry::RegistryBuilder;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::Rng;

    fn context(data_types: &[&str]) -> AlgorithmContext {
        AlgorithmContext {
            registry: Arc::new(RegistryBuilder::with_builtins().build()),
            data_types: data_types.iter().map(|s| s.to_string()).collect(),
            events: 1,
            storage: None,
        }
    }

    fn settings(max_samples: usize, batch_size: usize) -> MonteCarloSettings {
        MonteCarloSettings {
            max_samples,
            batch_size,
            parallel_batches: 2,
            seed: 11,
            ..Default::default()
        }
    }

    fn ln_likelihood(candidates: &MomentTensorBatch) -> LnPdf {
        candidates
            .candidates()
            .map(|c| if c[0] < -0.5 { f64::NEG_INFINITY } else { -c[1] * c[1] })
            .collect()
    }

    fn evaluate(batch: &MomentTensorBatch) -> IterationResult {
        IterationResult::new(batch.clone(), ln_likelihood(batch)).unwrap()
    }

    #[test]
    fn missing_data_type_fails_initialise() {
        let mut mc = RandomMonteCarlo::new(settings(10, 5), context(&["polarity"]));
        let err = mc.initialise().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InversionError>(),
            Some(InversionError::Configuration(_))
        ));
    }

    #[test]
    fn zero_samples_terminate_immediately() {
        let mut mc = RandomMonteCarlo::new(settings(0, 5), context(&["gaussian_amplitude"]));
        let step = mc.initialise().unwrap();
        assert!(step.terminate);
        assert!(step.candidates.is_empty());
        let output = Box::new(mc).output().unwrap();
        assert_eq!(output.termination, TerminationReason::SampleBudget);
        assert_eq!(output.sample.summary().records, 0);
    }

    #[test]
    fn output_requires_termination() {
        let mut mc = RandomMonteCarlo::new(settings(10, 5), context(&["gaussian_amplitude"]));
        mc.initialise().unwrap();
        let err = Box::new(mc).output().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InversionError>(),
            Some(InversionError::NotTerminated)
        ));
    }

    #[test]
    fn replenishes_until_budget() {
        let mut mc = RandomMonteCarlo::new(settings(23, 5), context(&["gaussian_amplitude"]));
        let mut queue = VecDeque::new();
        let step = mc.initialise().unwrap();
        assert_eq!(step.candidates.len(), 10);
        queue.extend(step.candidates.split(5).into_iter().map(|(_, b)| b));

        let mut evaluated = 0;
        let mut terminated = false;
        while let Some(batch) = queue.pop_front() {
            evaluated += batch.len();
            let step = mc.iterate(evaluate(&batch)).unwrap();
            if step.terminate {
                terminated = true;
                break;
            }
            queue.extend(step.candidates.split(5).into_iter().map(|(_, b)| b));
        }
        assert!(terminated);
        assert_eq!(evaluated, 23);
        let output = Box::new(mc).output().unwrap();
        assert!(output.converged);
        assert_eq!(output.sample.summary().proposed, 23);
    }

    #[test]
    fn order_independent_posterior() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let batches: Vec<MomentTensorBatch> =
            (0..6).map(|_| uniform_batch(&mut rng, 7, 1)).collect();

        let run = |order: &[usize]| {
            let mut mc = RandomMonteCarlo::new(settings(42, 7), context(&["gaussian_amplitude"]));
            mc.initialise().unwrap();
            for &i in order {
                mc.iterate(evaluate(&batches[i])).unwrap();
            }
            let output = Box::new(mc).output().unwrap();
            let mut records = output.sample.resident().into_iter().cloned().collect::<Vec<_>>();
            records.sort_by(|a, b| a.candidate.partial_cmp(&b.candidate).unwrap());
            (output.ln_evidence.unwrap(), output.sample.summary().clone(), records)
        };

        let (evidence, summary, records) = run(&[0, 1, 2, 3, 4, 5]);
        let mut order: Vec<usize> = (0..6).collect();
        for _ in 0..5 {
            for i in (1..order.len()).rev() {
                order.swap(i, rng.random_range(0..=i));
            }
            let (other_evidence, other_summary, other_records) = run(&order);
            assert_relative_eq!(evidence, other_evidence, epsilon = 1e-12);
            assert_relative_eq!(summary.ln_total, other_summary.ln_total, epsilon = 1e-12);
            assert_eq!(summary.accepted, other_summary.accepted);
            assert_eq!(records, other_records);
        }
    }

    #[test]
    fn evidence_of_constant_likelihood() {
        let mut mc = RandomMonteCarlo::new(settings(20, 10), context(&["gaussian_amplitude"]));
        let step = mc.initialise().unwrap();
        let result =
            IterationResult::new(step.candidates.clone(), LnPdf::new(vec![-2.; 20])).unwrap();
        assert!(mc.iterate(result).unwrap().terminate);
        assert_relative_eq!(mc.ln_evidence(), -2., epsilon = 1e-12);
    }

    #[test]
    fn convergence_window() {
        let mut s = settings(1000, 4);
        s.convergence = Some(ConvergenceSettings {
            window: 3,
            tolerance: 1e-9,
        });
        let mut mc = RandomMonteCarlo::new(s, context(&["gaussian_amplitude"]));
        let mut step = mc.initialise().unwrap();
        let mut iterations = 0;
        while !step.terminate {
            let batch = step.candidates.slice(0, 4);
            let result =
                IterationResult::new(batch.clone(), LnPdf::new(vec![-1.; batch.len()])).unwrap();
            step = mc.iterate(result).unwrap();
            iterations += 1;
        }
        assert_eq!(iterations, 4);
        let output = Box::new(mc).output().unwrap();
        assert_eq!(output.termination, TerminationReason::Converged);
        assert!(output.converged);
    }

    #[test]
    fn iteration_limit_is_not_convergence() {
        let mut s = settings(1000, 4);
        s.max_iterations = Some(1);
        let mut mc = RandomMonteCarlo::new(s, context(&["gaussian_amplitude"]));
        let step = mc.initialise().unwrap();
        let batch = step.candidates.slice(0, 4);
        assert!(mc.iterate(evaluate(&batch)).unwrap().terminate);
        let output = Box::new(mc).output().unwrap();
        assert_eq!(output.termination, TerminationReason::IterationLimit);
        assert!(!output.converged);
    }
}
