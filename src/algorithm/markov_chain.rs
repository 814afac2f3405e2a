use std::time::Duration;

use anyhow::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use tracing::{debug, info};

use super::interface::{
    draw, Algorithm, AlgorithmContext, AlgorithmOutput, AlgorithmState, IterationResult, Step,
    TerminationReason,
};
use crate::error::InversionError;
use crate::job_pool::CollectMode;
use crate::moment_tensor::{normalize_candidate, MomentTensorBatch};
use crate::registry::{Prior, Sampler};
use crate::sample::{SampleRecord, SampleStore};

/// Settings for [`MarkovChain`].
#[derive(Debug, Clone)]
pub struct MarkovChainSettings {
    /// Number of chains advanced together, one candidate column each.
    pub number_chains: usize,
    /// Number of states recorded per chain after burn-in.
    pub chain_length: usize,
    /// Iterations during which the step size is tuned and nothing is recorded.
    pub burn_in: usize,
    pub initial_step: f64,
    /// Acceptance rate the step size is tuned towards during burn-in.
    pub target_acceptance: f64,
    pub min_step: f64,
    pub max_step: f64,
    pub adaptation_rate: f64,
    /// Number of draws per chain before giving up on finding a starting
    /// point with non-zero probability.
    pub max_initialisation_attempts: usize,
    pub sampler: String,
    pub prior: String,
    pub max_iterations: Option<u64>,
    pub max_time: Option<Duration>,
    pub seed: u64,
}

impl Default for MarkovChainSettings {
    fn default() -> Self {
        Self {
            number_chains: 4,
            chain_length: 1000,
            burn_in: 500,
            initial_step: 0.1,
            target_acceptance: 0.3,
            min_step: 1e-4,
            max_step: 1.,
            adaptation_rate: 1.,
            max_initialisation_attempts: 500,
            sampler: "uniform".to_string(),
            prior: "uniform".to_string(),
            max_iterations: None,
            max_time: None,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct ChainState {
    position: Vec<f64>,
    ln_pdf: f64,
    scale: f64,
    scale_uncertainty: f64,
    step: f64,
}

/// Metropolis-Hastings chains with a random-walk proposal on the unit sphere.
///
/// Each batch holds one proposal per chain and depends on the states the
/// previous batch left behind, so results must come back in order and all at
/// once. All randomness comes from a single generator seeded from the
/// settings, which makes runs reproducible.
pub struct MarkovChain {
    settings: MarkovChainSettings,
    context: AlgorithmContext,
    state: AlgorithmState,
    rng: ChaCha8Rng,
    capabilities: Option<(Sampler, Prior)>,
    sample: Option<SampleStore>,
    chains: Vec<Option<ChainState>>,
    /// Chains still looking for a starting point, in batch column order.
    pending: Vec<usize>,
    attempts: usize,
    transitions: usize,
    recorded: usize,
}

impl MarkovChain {
    pub fn new(settings: MarkovChainSettings, context: AlgorithmContext) -> Self {
        let rng = ChaCha8Rng::seed_from_u64(settings.seed);
        Self {
            chains: vec![None; settings.number_chains],
            settings,
            context,
            state: AlgorithmState::default(),
            rng,
            capabilities: None,
            sample: None,
            pending: Vec::new(),
            attempts: 0,
            transitions: 0,
            recorded: 0,
        }
    }

    /// Current step size of every chain.
    pub fn step_sizes(&self) -> Vec<f64> {
        self.chains
            .iter()
            .map(|chain| chain.as_ref().map_or(self.settings.initial_step, |c| c.step))
            .collect()
    }

    fn capabilities(&self) -> Result<(Sampler, Prior)> {
        self.capabilities
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Algorithm was not initialised"))
    }

    fn initialisation_step(&mut self, result: IterationResult) -> Result<Step> {
        let (sampler, prior) = self.capabilities()?;
        if result.count != self.pending.len() {
            return Err(InversionError::SizeMismatch {
                left: self.pending.len(),
                right: result.count,
            }
            .into());
        }
        let mut still_pending = Vec::new();
        for (column, &chain) in self.pending.iter().enumerate() {
            let position = result.candidates.candidate(column);
            let ln_pdf = result.ln_pdf[column] + prior(&position);
            if ln_pdf.is_finite() {
                let record = result.record(column, position, ln_pdf);
                self.chains[chain] = Some(ChainState {
                    position: record.candidate,
                    ln_pdf,
                    scale: record.scale,
                    scale_uncertainty: record.scale_uncertainty,
                    step: self.settings.initial_step,
                });
            } else {
                still_pending.push(chain);
            }
        }
        self.pending = still_pending;

        if self.pending.is_empty() {
            debug!(attempts = self.attempts, "all chains initialised");
            return Ok(Step::next(self.propose()?));
        }
        if let Some(reason) = self
            .state
            .exhausted(self.settings.max_iterations, self.settings.max_time)
        {
            self.state.terminate(reason);
            info!(
                iterations = self.state.iteration,
                pending = self.pending.len(),
                %reason,
                "markov chain sampling stopped during initialisation"
            );
            return Ok(Step::terminate(self.context.events));
        }
        if self.attempts >= self.settings.max_initialisation_attempts {
            return Err(InversionError::InitialisationFailed {
                attempts: self.attempts,
            }
            .into());
        }
        self.attempts += 1;
        let batch = draw(&sampler, self.pending.len(), self.context.events, &mut self.rng)?;
        Ok(Step::next(batch))
    }

    fn transition(&mut self, result: IterationResult) -> Result<Step> {
        let (_, prior) = self.capabilities()?;
        let n = self.chains.len();
        if result.count != n {
            return Err(InversionError::SizeMismatch {
                left: n,
                right: result.count,
            }
            .into());
        }
        self.transitions += 1;
        let burning_in = self.transitions <= self.settings.burn_in;
        let rate = self.settings.adaptation_rate / (self.transitions as f64).sqrt();

        let mut accepted = 0u64;
        for (j, slot) in self.chains.iter_mut().enumerate() {
            let Some(chain) = slot.as_mut() else {
                continue;
            };
            let proposal = result.candidates.candidate(j);
            let ln_pdf = result.ln_pdf[j] + prior(&proposal);
            // Drawn for every chain so that the random stream does not
            // depend on the outcome of the evaluation.
            let u: f64 = self.rng.random();
            let accept = ln_pdf.is_finite() && u.ln() < ln_pdf - chain.ln_pdf;
            if accept {
                let record = result.record(j, proposal, ln_pdf);
                chain.position = record.candidate;
                chain.ln_pdf = ln_pdf;
                chain.scale = record.scale;
                chain.scale_uncertainty = record.scale_uncertainty;
                accepted += 1;
            }
            if burning_in {
                let indicator = if accept { 1. } else { 0. };
                let factor = (rate * (indicator - self.settings.target_acceptance)).exp();
                chain.step =
                    (chain.step * factor).clamp(self.settings.min_step, self.settings.max_step);
            }
        }

        if !burning_in {
            self.state.accepted += accepted;
            self.state.rejected += n as u64 - accepted;
            let records: Vec<SampleRecord> = self
                .chains
                .iter()
                .flatten()
                .map(|chain| SampleRecord {
                    candidate: chain.position.clone(),
                    ln_pdf: chain.ln_pdf,
                    scale: chain.scale,
                    scale_uncertainty: chain.scale_uncertainty,
                })
                .collect();
            if let Some(sample) = self.sample.as_mut() {
                sample.append(records)?;
                sample.record_acceptance(accepted, n as u64);
            }
            self.recorded += 1;
        }

        let termination = if self.recorded >= self.settings.chain_length {
            Some(TerminationReason::SampleBudget)
        } else {
            self.state
                .exhausted(self.settings.max_iterations, self.settings.max_time)
        };
        if let Some(reason) = termination {
            self.state.terminate(reason);
            info!(
                iterations = self.state.iteration,
                recorded = self.recorded,
                acceptance_rate = self.state.acceptance_rate(),
                %reason,
                "markov chain sampling finished"
            );
            return Ok(Step::terminate(self.context.events));
        }
        Ok(Step::next(self.propose()?))
    }

    /// Gaussian random-walk proposals, renormalized per event.
    fn propose(&mut self) -> Result<MomentTensorBatch> {
        let mut proposals = Vec::with_capacity(self.chains.len());
        for chain in self.chains.iter().flatten() {
            let mut proposal: Vec<f64> = chain
                .position
                .iter()
                .map(|&value| {
                    let noise: f64 = self.rng.sample(StandardNormal);
                    value + chain.step * noise
                })
                .collect();
            normalize_candidate(&mut proposal);
            proposals.push(proposal);
        }
        Ok(MomentTensorBatch::from_candidates(&proposals)?)
    }
}

impl Algorithm for MarkovChain {
    fn name(&self) -> &str {
        "mcmc"
    }

    fn collect_mode(&self) -> CollectMode {
        CollectMode::Ordered
    }

    fn initialise(&mut self) -> Result<Step> {
        let (sampler, prior) = self
            .context
            .capabilities(&self.settings.sampler, &self.settings.prior)?;
        if self.settings.number_chains == 0 {
            return Err(InversionError::configuration(
                "Markov chain sampling needs at least one chain",
            )
            .into());
        }
        if !(self.settings.min_step > 0. && self.settings.min_step <= self.settings.max_step) {
            return Err(InversionError::configuration(format!(
                "Invalid step size bounds [{}, {}]",
                self.settings.min_step, self.settings.max_step
            ))
            .into());
        }
        self.sample = Some(SampleStore::from_settings(self.context.storage.as_ref())?);
        self.state.start()?;
        if self.settings.chain_length == 0 {
            self.capabilities = Some((sampler, prior));
            self.state.terminate(TerminationReason::SampleBudget);
            return Ok(Step::terminate(self.context.events));
        }

        self.pending = (0..self.settings.number_chains).collect();
        self.attempts = 1;
        let batch = draw(&sampler, self.pending.len(), self.context.events, &mut self.rng)?;
        self.capabilities = Some((sampler, prior));
        Ok(Step::next(batch))
    }

    fn iterate(&mut self, result: IterationResult) -> Result<Step> {
        self.state.ensure_running()?;
        self.state.iteration += 1;
        if self.pending.is_empty() {
            self.transition(result)
        } else {
            self.initialisation_step(result)
        }
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
        Ok(AlgorithmOutput {
            sample,
            termination,
            converged: termination == TerminationReason::SampleBudget,
            ln_evidence: None,
            iterations: self.state.iteration,
        })
    }
}
