//! Runs an inversion from settings to posterior sample.
//!
//! Everything the run needs is looked up and validated in
//! [`InversionDriver::new`], before any worker thread exists. [`InversionDriver::run`]
//! then loops between the algorithm and the job pool until the algorithm
//! terminates.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::algorithm::{
    Algorithm, AlgorithmContext, IterationResult, MarkovChain, MarkovChainSettings,
    MonteCarloSettings, RandomMonteCarlo, TerminationReason,
};
use crate::data::EventData;
use crate::error::InversionError;
use crate::file_sample::FileSampleSettings;
use crate::forward_model::{EvaluatedBatch, ForwardModelEvaluator, JobDescriptor};
use crate::job_pool::{CollectMode, JobHandle, JobPool, PoolSettings, WriteJob};
use crate::lnpdf::LnPdf;
use crate::moment_tensor::{MomentTensorBatch, MT_COMPONENTS};
use crate::registry::{OutputDataFormatter, OutputFormatter, PostInversionHook, Registry};
use crate::sample::SampleStore;

/// Which search algorithm to run.
#[derive(Debug, Clone)]
pub enum AlgorithmKind {
    RandomMonteCarlo(MonteCarloSettings),
    MarkovChain(MarkovChainSettings),
    /// An algorithm factory from the registry, by name.
    Registered(String),
}

impl Default for AlgorithmKind {
    fn default() -> Self {
        AlgorithmKind::RandomMonteCarlo(MonteCarloSettings::default())
    }
}

#[derive(Debug, Clone)]
pub struct LocationPdfSettings {
    pub path: PathBuf,
    /// Number of location samples to draw from the file.
    pub samples: usize,
}

#[derive(Debug, Clone)]
pub struct OutputSettings {
    /// Registered output data format that arranges the results for `format`.
    pub data_format: String,
    /// Registered output format.
    pub format: String,
    pub path: PathBuf,
}

impl OutputSettings {
    /// Write with `format`, using the built-in `records` data format.
    pub fn new<P: AsRef<Path>>(format: &str, path: P) -> Self {
        Self {
            data_format: "records".to_string(),
            format: format.to_string(),
            path: path.as_ref().to_path_buf(),
        }
    }
}

/// Settings of a complete inversion.
#[derive(Debug, Clone, Default)]
pub struct InversionSettings {
    pub algorithm: AlgorithmKind,
    /// Data types whose likelihoods are combined.
    pub data_types: Vec<String>,
    pub pool: PoolSettings,
    /// Spill the sample to this file instead of keeping it in memory.
    pub file_sample: Option<FileSampleSettings>,
    pub location_pdf: Option<LocationPdfSettings>,
    pub output: Option<OutputSettings>,
    /// Registered hooks applied to these settings, in order.
    pub pre_inversion: Vec<String>,
    /// Registered hooks called with the final output, in order.
    pub post_inversion: Vec<String>,
}

/// Where the data of one event comes from.
#[derive(Debug, Clone)]
pub enum EventSource {
    Data(EventData),
    /// Read with a registered parser.
    File(PathBuf),
}

impl From<EventData> for EventSource {
    fn from(data: EventData) -> Self {
        EventSource::Data(data)
    }
}

/// Summary of a finished inversion.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    pub iterations: u64,
    pub elapsed: Duration,
    pub ln_evidence: Option<f64>,
    pub acceptance_rate: f64,
    pub effective_sample_size: f64,
    /// Non-finite forward-model values that were treated as zero probability.
    pub clipped_values: usize,
    pub failed_jobs: usize,
    pub retried_jobs: usize,
    /// Results of jobs still in flight at termination.
    pub discarded_jobs: usize,
    pub converged: bool,
    pub termination: Option<TerminationReason>,
    pub output_log: Option<String>,
    pub output_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct InversionOutput {
    pub sample: SampleStore,
    pub diagnostics: Diagnostics,
}

struct OutputStage {
    data_format: OutputDataFormatter,
    format: OutputFormatter,
    path: PathBuf,
}

pub struct InversionDriver {
    settings: InversionSettings,
    events: Vec<EventData>,
    evaluator: Arc<ForwardModelEvaluator>,
    algorithm: Box<dyn Algorithm>,
    output: Option<OutputStage>,
    post_inversion: Vec<PostInversionHook>,
}

impl InversionDriver {
    /// Resolve and validate every capability the inversion needs.
    pub fn new(
        settings: InversionSettings,
        registry: Arc<Registry>,
        events: Vec<EventSource>,
    ) -> Result<Self> {
        let mut settings = settings;
        for name in settings.pre_inversion.clone() {
            let hook = registry.pre_inversion(&name).ok_or_else(|| {
                InversionError::configuration(format!(
                    "No pre-inversion hook registered as {}",
                    name
                ))
            })?;
            settings =
                hook(settings).with_context(|| format!("Pre-inversion hook {} failed", name))?;
        }

        let mut events = events
            .into_iter()
            .map(|source| match source {
                EventSource::Data(data) => Ok(data),
                EventSource::File(path) => registry.parse_event(&path),
            })
            .collect::<Result<Vec<_>>>()?;
        if let Some(location) = settings.location_pdf.as_ref() {
            let samples = registry.parse_location(&location.path, location.samples)?;
            for event in events.iter_mut().filter(|event| event.location.is_none()) {
                event.location = Some(samples.clone());
            }
        }

        let evaluator = ForwardModelEvaluator::new(&registry, &events, &settings.data_types)?;

        let output = match settings.output.as_ref() {
            Some(output) => {
                let data_format = registry
                    .output_data_format(&output.data_format)
                    .ok_or_else(|| {
                        InversionError::configuration(format!(
                            "No output data format registered as {}",
                            output.data_format
                        ))
                    })?;
                let format = registry.output_format(&output.format).ok_or_else(|| {
                    InversionError::configuration(format!(
                        "No output format registered as {}",
                        output.format
                    ))
                })?;
                Some(OutputStage {
                    data_format,
                    format,
                    path: output.path.clone(),
                })
            }
            None => None,
        };
        let post_inversion = settings
            .post_inversion
            .iter()
            .map(|name| {
                registry.post_inversion(name).ok_or_else(|| {
                    InversionError::configuration(format!(
                        "No post-inversion hook registered as {}",
                        name
                    ))
                })
            })
            .collect::<crate::error::Result<Vec<_>>>()?;

        let context = AlgorithmContext {
            registry: registry.clone(),
            data_types: settings.data_types.clone(),
            events: events.len(),
            storage: settings.file_sample.clone(),
        };
        let algorithm: Box<dyn Algorithm> = match &settings.algorithm {
            AlgorithmKind::RandomMonteCarlo(algorithm) => {
                Box::new(RandomMonteCarlo::new(algorithm.clone(), context))
            }
            AlgorithmKind::MarkovChain(algorithm) => {
                Box::new(MarkovChain::new(algorithm.clone(), context))
            }
            AlgorithmKind::Registered(name) => {
                let factory = registry.algorithm(name).ok_or_else(|| {
                    InversionError::configuration(format!("No algorithm registered as {}", name))
                })?;
                factory(&context).with_context(|| format!("Could not create algorithm {}", name))?
            }
        };

        Ok(Self {
            settings,
            events,
            evaluator: Arc::new(evaluator),
            algorithm,
            output,
            post_inversion,
        })
    }

    /// Build a driver from the process-wide registry.
    pub fn from_global(settings: InversionSettings, events: Vec<EventSource>) -> Result<Self> {
        let registry = Registry::global()
            .ok_or_else(|| InversionError::configuration("No capability registry installed"))?;
        Self::new(settings, registry, events)
    }

    pub fn settings(&self) -> &InversionSettings {
        &self.settings
    }

    pub fn run(self) -> Result<InversionOutput> {
        let Self {
            settings,
            events,
            evaluator,
            mut algorithm,
            output: output_stage,
            post_inversion,
        } = self;
        let start = Instant::now();

        // The algorithm validates its capabilities here, before there are workers.
        let mut step = algorithm
            .initialise()
            .with_context(|| format!("Could not initialise algorithm {}", algorithm.name()))?;

        let mode = algorithm.collect_mode();
        let num_workers = settings.pool.num_workers.max(1);
        let chunk = algorithm
            .chunk_size()
            .unwrap_or_else(|| step.candidates.len().div_ceil(num_workers))
            .max(1);
        let bytes_per_job =
            chunk * (evaluator.events() * MT_COMPONENTS + 1) * std::mem::size_of::<f64>();
        let pool = JobPool::new(&settings.pool, settings.pool.queue_bound(bytes_per_job))?;
        info!(
            algorithm = algorithm.name(),
            workers = num_workers,
            chunk,
            queue_bound = pool.queue_bound(),
            data_types = ?evaluator.data_types(),
            "starting inversion"
        );
        let mut dispatch = Dispatch {
            pool,
            evaluator,
            inflight: HashMap::new(),
            degraded: settings.pool.degraded,
            max_retries: settings.pool.max_retries,
            chunk,
            clipped: 0,
            retried: 0,
        };

        while !step.terminate {
            dispatch.submit(step.candidates)?;
            let result = match mode {
                CollectMode::Unordered => dispatch.next(mode)?.map(|batch| {
                    IterationResult::from_evaluation(batch.candidates, batch.evaluation)
                }),
                CollectMode::Ordered => {
                    let mut parts = Vec::new();
                    while let Some(batch) = dispatch.next(mode)? {
                        parts.push(batch);
                    }
                    assemble(parts)?
                }
            };
            let Some(result) = result else {
                bail!(
                    "Algorithm {} neither requested candidates nor terminated",
                    algorithm.name()
                );
            };
            step = algorithm.iterate(result)?;
        }

        let report = dispatch.pool.shutdown();
        let failed_jobs = dispatch.pool.failed();
        let output = algorithm.output()?;
        if dispatch.clipped > 0 {
            warn!(
                clipped = dispatch.clipped,
                "forward models returned NaN or infinite values, treated as zero probability"
            );
        }
        if !output.converged {
            warn!(
                termination = %output.termination,
                "resources exhausted before the convergence criterion was met"
            );
        }

        let summary = output.sample.summary();
        let diagnostics = Diagnostics {
            iterations: output.iterations,
            elapsed: start.elapsed(),
            ln_evidence: output.ln_evidence,
            acceptance_rate: summary.acceptance_rate(),
            effective_sample_size: summary.effective_sample_size(),
            clipped_values: dispatch.clipped,
            failed_jobs,
            retried_jobs: dispatch.retried,
            discarded_jobs: report.discarded,
            converged: output.converged,
            termination: Some(output.termination),
            output_log: None,
            output_path: None,
        };
        info!(
            iterations = diagnostics.iterations,
            elapsed = ?diagnostics.elapsed,
            samples = summary.records,
            discarded = diagnostics.discarded_jobs,
            "inversion finished"
        );
        let mut inversion = InversionOutput {
            sample: output.sample,
            diagnostics,
        };

        if let Some(stage) = output_stage {
            inversion.sample.flush()?;
            let data = (stage.data_format)(&inversion, events.as_slice())
                .context("Could not arrange the output data")?;
            let mut writers: JobPool<WriteJob> = JobPool::new(&settings.pool, 2 * num_workers)?;
            let (log, written) = (stage.format)(&data, &stage.path, &mut writers)
                .with_context(|| format!("Could not write output to {:?}", stage.path))?;
            while let Some(result) = writers.collect(CollectMode::Unordered)? {
                result.outcome.context("Output write job failed")?;
            }
            writers.shutdown();
            info!(path = ?written, "{}", log);
            inversion.diagnostics.output_log = Some(log);
            inversion.diagnostics.output_path = Some(written);
        }

        for hook in post_inversion {
            hook(&inversion).context("Post-inversion hook failed")?;
        }
        Ok(inversion)
    }
}

struct Inflight {
    offset: usize,
    candidates: MomentTensorBatch,
    attempts: usize,
}

/// Splits steps into jobs and resubmits failed ones in degraded mode.
struct Dispatch {
    pool: JobPool<JobDescriptor>,
    evaluator: Arc<ForwardModelEvaluator>,
    inflight: HashMap<JobHandle, Inflight>,
    degraded: bool,
    max_retries: usize,
    chunk: usize,
    clipped: usize,
    retried: usize,
}

impl Dispatch {
    fn submit(&mut self, candidates: MomentTensorBatch) -> Result<()> {
        for (offset, part) in candidates.split(self.chunk) {
            self.submit_job(offset, part, 1)?;
        }
        Ok(())
    }

    fn submit_job(
        &mut self,
        offset: usize,
        candidates: MomentTensorBatch,
        attempts: usize,
    ) -> Result<()> {
        let retry = self.degraded.then(|| candidates.clone());
        let handle = self
            .pool
            .submit(JobDescriptor::new(offset, candidates, self.evaluator.clone()))?;
        if let Some(candidates) = retry {
            self.inflight.insert(
                handle,
                Inflight {
                    offset,
                    candidates,
                    attempts,
                },
            );
        }
        Ok(())
    }

    /// The next evaluated batch, or `None` when nothing is outstanding.
    fn next(&mut self, mode: CollectMode) -> Result<Option<EvaluatedBatch>> {
        loop {
            let Some(result) = self.pool.collect(mode)? else {
                return Ok(None);
            };
            let job = self.inflight.remove(&result.handle);
            let err = match result.outcome {
                Ok(batch) => {
                    self.clipped += batch.evaluation.clipped;
                    return Ok(Some(batch));
                }
                Err(err) => err,
            };
            let Some(job) = job else {
                return Err(err);
            };
            if job.attempts > self.max_retries {
                return Err(InversionError::WorkerFailure {
                    job: result.handle.id(),
                    cause: err.into(),
                }
                .into());
            }
            warn!(
                job = result.handle.id(),
                attempt = job.attempts,
                error = %err,
                "resubmitting failed job"
            );
            self.retried += 1;
            self.submit_job(job.offset, job.candidates, job.attempts + 1)?;
        }
    }
}

/// Join evaluated sub-batches in the order of their offsets.
fn assemble(mut parts: Vec<EvaluatedBatch>) -> Result<Option<IterationResult>> {
    if parts.is_empty() {
        return Ok(None);
    }
    parts.sort_by_key(|part| part.offset);
    let candidates = MomentTensorBatch::concat(parts.iter().map(|part| &part.candidates))?;
    let ln_pdf = LnPdf::concat(parts.iter().map(|part| &part.evaluation.ln_pdf));
    let scale = parts
        .iter()
        .flat_map(|part| part.evaluation.scale.iter().copied())
        .collect();
    let scale_uncertainty = parts
        .iter()
        .flat_map(|part| part.evaluation.scale_uncertainty.iter().copied())
        .collect();
    Ok(Some(IterationResult {
        count: candidates.len(),
        candidates,
        ln_pdf,
        scale,
        scale_uncertainty,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward_model::Evaluation;
    use pretty_assertions::assert_eq;

    fn part(offset: usize, values: &[f64]) -> EvaluatedBatch {
        let candidates: Vec<[f64; 6]> = values.iter().map(|&v| [v; 6]).collect();
        EvaluatedBatch {
            offset,
            candidates: MomentTensorBatch::from_candidates(&candidates).unwrap(),
            evaluation: Evaluation {
                ln_pdf: LnPdf::new(values.iter().map(|v| -v).collect()),
                scale: values.to_vec(),
                scale_uncertainty: vec![0.; values.len()],
                clipped: 0,
            },
        }
    }

    #[test]
    fn assemble_by_offset() {
        let result = assemble(vec![part(3, &[3., 4.]), part(0, &[0., 1., 2.]), part(5, &[5.])])
            .unwrap()
            .unwrap();
        assert_eq!(result.count, 6);
        assert_eq!(result.ln_pdf.values(), &[-0., -1., -2., -3., -4., -5.]);
        assert_eq!(result.scale, vec![0., 1., 2., 3., 4., 5.]);
        assert_eq!(result.candidates.candidate(4), vec![4.; 6]);
        assert!(assemble(vec![]).unwrap().is_none());
    }
}
