use std::fmt::Display;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use rand::RngCore;

use crate::error::InversionError;
use crate::file_sample::FileSampleSettings;
use crate::forward_model::Evaluation;
use crate::job_pool::CollectMode;
use crate::lnpdf::LnPdf;
use crate::moment_tensor::MomentTensorBatch;
use crate::registry::{Prior, Registry, Sampler};
use crate::sample::{SampleRecord, SampleStore};

/// What an algorithm wants evaluated next.
#[derive(Debug, Clone)]
pub struct Step {
    pub candidates: MomentTensorBatch,
    pub terminate: bool,
}

impl Step {
    pub fn next(candidates: MomentTensorBatch) -> Self {
        Self {
            candidates,
            terminate: false,
        }
    }

    /// Nothing new to evaluate, but results are still expected.
    pub fn wait(events: usize) -> Self {
        Self::next(MomentTensorBatch::empty(events))
    }

    pub fn terminate(events: usize) -> Self {
        Self {
            candidates: MomentTensorBatch::empty(events),
            terminate: true,
        }
    }
}

/// Evaluated candidates handed back to [`Algorithm::iterate`].
#[derive(Debug, Clone)]
pub struct IterationResult {
    pub candidates: MomentTensorBatch,
    /// Joint log-likelihood of all data types.
    pub ln_pdf: LnPdf,
    pub scale: Vec<f64>,
    pub scale_uncertainty: Vec<f64>,
    pub count: usize,
}

impl IterationResult {
    /// A result without relative scale estimates.
    pub fn new(candidates: MomentTensorBatch, ln_pdf: LnPdf) -> crate::error::Result<Self> {
        if candidates.len() != ln_pdf.len() {
            return Err(InversionError::SizeMismatch {
                left: candidates.len(),
                right: ln_pdf.len(),
            });
        }
        let count = candidates.len();
        Ok(Self {
            candidates,
            ln_pdf,
            scale: vec![1.; count],
            scale_uncertainty: vec![0.; count],
            count,
        })
    }

    pub fn from_evaluation(candidates: MomentTensorBatch, evaluation: Evaluation) -> Self {
        Self {
            count: candidates.len(),
            candidates,
            ln_pdf: evaluation.ln_pdf,
            scale: evaluation.scale,
            scale_uncertainty: evaluation.scale_uncertainty,
        }
    }

    pub(crate) fn record(&self, index: usize, candidate: Vec<f64>, ln_pdf: f64) -> SampleRecord {
        SampleRecord {
            candidate,
            ln_pdf,
            scale: self.scale.get(index).copied().unwrap_or(1.),
            scale_uncertainty: self.scale_uncertainty.get(index).copied().unwrap_or(0.),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// The requested number of samples was produced.
    SampleBudget,
    IterationLimit,
    TimeBudget,
    /// The convergence criterion was met.
    Converged,
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TerminationReason::SampleBudget => "sample budget reached",
            TerminationReason::IterationLimit => "iteration limit reached",
            TerminationReason::TimeBudget => "time budget exhausted",
            TerminationReason::Converged => "converged",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialised,
    Running,
    Terminated(TerminationReason),
}

/// Bookkeeping owned by a single algorithm instance.
#[derive(Debug, Clone)]
pub struct AlgorithmState {
    pub iteration: u64,
    pub start_time: Instant,
    pub accepted: u64,
    pub rejected: u64,
    pub phase: Phase,
}

impl Default for AlgorithmState {
    fn default() -> Self {
        Self {
            iteration: 0,
            start_time: Instant::now(),
            accepted: 0,
            rejected: 0,
            phase: Phase::Uninitialised,
        }
    }
}

impl AlgorithmState {
    pub(crate) fn start(&mut self) -> Result<()> {
        if self.phase != Phase::Uninitialised {
            anyhow::bail!("Algorithm was already initialised");
        }
        self.start_time = Instant::now();
        self.phase = Phase::Running;
        Ok(())
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        match self.phase {
            Phase::Running => Ok(()),
            Phase::Uninitialised => anyhow::bail!("Algorithm was not initialised"),
            Phase::Terminated(reason) => anyhow::bail!("Algorithm already terminated: {}", reason),
        }
    }

    pub(crate) fn terminate(&mut self, reason: TerminationReason) {
        self.phase = Phase::Terminated(reason);
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn termination(&self) -> Option<TerminationReason> {
        match self.phase {
            Phase::Terminated(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.termination().is_some()
    }

    pub fn acceptance_rate(&self) -> f64 {
        let total = self.accepted + self.rejected;
        if total == 0 {
            return 0.;
        }
        self.accepted as f64 / total as f64
    }

    /// Termination due to the iteration or wall-clock limits, if either is hit.
    pub(crate) fn exhausted(
        &self,
        max_iterations: Option<u64>,
        max_time: Option<Duration>,
    ) -> Option<TerminationReason> {
        if max_iterations.is_some_and(|max| self.iteration >= max) {
            return Some(TerminationReason::IterationLimit);
        }
        if max_time.is_some_and(|max| self.elapsed() >= max) {
            return Some(TerminationReason::TimeBudget);
        }
        None
    }
}

/// The posterior produced by a terminated algorithm.
#[derive(Debug)]
pub struct AlgorithmOutput {
    pub sample: SampleStore,
    pub termination: TerminationReason,
    /// False if a resource limit ended the run before the algorithm's own
    /// stopping criterion was met.
    pub converged: bool,
    pub ln_evidence: Option<f64>,
    pub iterations: u64,
}

/// Everything an algorithm needs to know about the inversion it runs in.
#[derive(Clone)]
pub struct AlgorithmContext {
    pub registry: Arc<Registry>,
    pub data_types: Vec<String>,
    pub events: usize,
    pub storage: Option<FileSampleSettings>,
}

impl AlgorithmContext {
    /// Resolve the sampling capabilities and make sure every data type has a
    /// forward model.
    pub fn capabilities(
        &self,
        sampler: &str,
        prior: &str,
    ) -> crate::error::Result<(Sampler, Prior)> {
        if self.data_types.is_empty() {
            return Err(InversionError::configuration("No data types selected"));
        }
        if let Some(missing) = self.data_types.iter().find(|name| {
            self.registry.data_type(name).is_none()
                && self.registry.relative_data_type(name).is_none()
        }) {
            return Err(InversionError::configuration(format!(
                "No forward model registered for data type {}",
                missing
            )));
        }
        let sampler = self.registry.sampler(sampler).ok_or_else(|| {
            InversionError::configuration(format!("No sampler registered as {}", sampler))
        })?;
        let prior = self.registry.prior(prior).ok_or_else(|| {
            InversionError::configuration(format!("No prior registered as {}", prior))
        })?;
        Ok((sampler, prior))
    }
}

/// Draw `n` candidates and check that the sampler kept to its contract.
pub(crate) fn draw(
    sampler: &Sampler,
    n: usize,
    events: usize,
    rng: &mut dyn RngCore,
) -> crate::error::Result<MomentTensorBatch> {
    if n == 0 {
        return Ok(MomentTensorBatch::empty(events));
    }
    let batch = sampler(n, events, rng);
    if batch.len() != n || batch.events() != events {
        return Err(InversionError::configuration(format!(
            "Sampler returned {} candidates for {} events, expected {} for {}",
            batch.len(),
            batch.events(),
            n,
            events
        )));
    }
    Ok(batch)
}

/// A search strategy over candidate moment tensors.
///
/// The driver calls [`initialise`](Algorithm::initialise) once, then
/// [`iterate`](Algorithm::iterate) with evaluated candidates until a step
/// asks to terminate, and finally [`output`](Algorithm::output).
pub trait Algorithm: Send {
    fn name(&self) -> &str;

    /// How the driver must hand results back.
    ///
    /// With [`CollectMode::Unordered`] `iterate` is called once per finished
    /// job in completion order. With [`CollectMode::Ordered`] the driver waits
    /// for the whole step and calls `iterate` once with all candidates in
    /// their original order.
    fn collect_mode(&self) -> CollectMode;

    /// Preferred number of candidates per job.
    fn chunk_size(&self) -> Option<usize> {
        None
    }

    fn initialise(&mut self) -> Result<Step>;

    fn iterate(&mut self, result: IterationResult) -> Result<Step>;

    fn state(&self) -> &AlgorithmState;

    /// The accumulated posterior. Fails if the algorithm has not terminated.
    fn output(self: Box<Self>) -> Result<AlgorithmOutput>;
}
