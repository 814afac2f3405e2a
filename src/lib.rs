//! Bayesian inversion of seismic moment tensors.
//!
//! Candidate moment tensors are drawn by a search [`Algorithm`], evaluated
//! against the observed data of every registered data type on a [`JobPool`]
//! and accumulated into a posterior [`SampleStore`]. Forward models, samplers,
//! priors, parsers and output formats are plugged in through a [`Registry`].
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mtinv::{
//!     AlgorithmKind, EventData, InversionDriver, InversionSettings, MonteCarloSettings,
//!     RegistryBuilder, StationData,
//! };
//!
//! # fn main() -> anyhow::Result<()> {
//! let registry = Arc::new(RegistryBuilder::with_builtins().build());
//! let event = EventData::default().with_data_type(
//!     "gaussian_amplitude",
//!     StationData {
//!         stations: vec!["S01".to_string()],
//!         observations: vec![0.8],
//!         errors: vec![0.1],
//!         coefficients: vec![vec![[1., 0., 0., 0., 0., 0.]]],
//!     },
//! );
//! let settings = InversionSettings {
//!     algorithm: AlgorithmKind::RandomMonteCarlo(MonteCarloSettings {
//!         max_samples: 10_000,
//!         ..Default::default()
//!     }),
//!     data_types: vec!["gaussian_amplitude".to_string()],
//!     ..Default::default()
//! };
//! let output = InversionDriver::new(settings, registry, vec![event.into()])?.run()?;
//! println!("ln evidence: {:?}", output.diagnostics.ln_evidence);
//! # Ok(())
//! # }
//! ```

pub(crate) mod math;

mod algorithm;
mod data;
mod driver;
mod error;
mod file_sample;
mod forward_model;
mod job_pool;
mod lnpdf;
mod moment_tensor;
mod output;
mod registry;
mod sample;

pub use algorithm::{
    Algorithm, AlgorithmContext, AlgorithmOutput, AlgorithmState, ConvergenceSettings,
    IterationResult, MarkovChain, MarkovChainSettings, MonteCarloSettings, Phase,
    RandomMonteCarlo, Step, TerminationReason,
};
pub use data::{EventData, LocationSamples, PreparedData, StationAngles, StationData};
pub use driver::{
    AlgorithmKind, Diagnostics, EventSource, InversionDriver, InversionOutput, InversionSettings,
    LocationPdfSettings, OutputSettings,
};
pub use error::InversionError;
pub use file_sample::{FileSample, FileSampleSettings};
pub use forward_model::{
    EvaluatedBatch, Evaluation, ForwardModel, ForwardModelEvaluator, GaussianAmplitude,
    JobDescriptor, RelativeForwardModel, RelativeLikelihood,
};
pub use job_pool::{
    CollectMode, FnJob, Job, JobHandle, JobPool, JobResult, PoolSettings, ShutdownReport, WriteJob,
};
pub use lnpdf::{combine_all, LnPdf};
pub use moment_tensor::{
    normalize_candidate, random_candidate, uniform_batch, MomentTensorBatch, MT_COMPONENTS,
};
pub use output::OutputData;
pub use registry::{
    AlgorithmFactory, DataParser, LocationParser, OutputDataFormatter, OutputFormatter,
    PostInversionHook, PreInversionHook, Preprocessor, Prior, Registry, RegistryBuilder, Sampler,
};
pub use sample::{weighted_resample, PdfSample, SampleRecord, SampleStore, SampleSummary};
