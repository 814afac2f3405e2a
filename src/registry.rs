//! String-keyed capabilities the inversion is assembled from.
//!
//! A [`RegistryBuilder`] validates every registration and is frozen into an
//! immutable [`Registry`]. A registry can be installed once per process and
//! retrieved with [`Registry::global`].

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use anyhow::{Context, Result};
use rand::RngCore;
use tracing::debug;

use crate::algorithm::{
    Algorithm, AlgorithmContext, MarkovChain, MarkovChainSettings, MonteCarloSettings,
    RandomMonteCarlo,
};
use crate::data::{EventData, LocationSamples, PreparedData};
use crate::driver::{InversionOutput, InversionSettings};
use crate::error::InversionError;
use crate::forward_model::{ForwardModel, GaussianAmplitude, RelativeForwardModel};
use crate::job_pool::{JobPool, WriteJob};
use crate::moment_tensor::{uniform_batch, MomentTensorBatch};
use crate::output::{self, OutputData};

pub type DataParser = Arc<dyn Fn(&Path) -> Result<EventData> + Send + Sync>;
pub type LocationParser = Arc<dyn Fn(&Path, usize) -> Result<LocationSamples> + Send + Sync>;
pub type Preprocessor = Arc<dyn Fn(&EventData, &str) -> Result<PreparedData> + Send + Sync>;
/// Draws `n` candidates for the given number of events.
pub type Sampler = Arc<dyn Fn(usize, usize, &mut dyn RngCore) -> MomentTensorBatch + Send + Sync>;
/// Natural log of the prior density of a candidate.
pub type Prior = Arc<dyn Fn(&[f64]) -> f64 + Send + Sync>;
pub type AlgorithmFactory =
    Arc<dyn Fn(&AlgorithmContext) -> Result<Box<dyn Algorithm>> + Send + Sync>;
/// Arranges the inversion output and the event data for an output format.
pub type OutputDataFormatter =
    Arc<dyn Fn(&InversionOutput, &[EventData]) -> Result<OutputData> + Send + Sync>;
/// Writes output data and returns a log message and the path written.
pub type OutputFormatter = Arc<
    dyn Fn(&OutputData, &Path, &mut JobPool<WriteJob>) -> Result<(String, PathBuf)>
        + Send
        + Sync,
>;
pub type PreInversionHook =
    Arc<dyn Fn(InversionSettings) -> Result<InversionSettings> + Send + Sync>;
pub type PostInversionHook = Arc<dyn Fn(&InversionOutput) -> Result<()> + Send + Sync>;

static GLOBAL: OnceLock<Arc<Registry>> = OnceLock::new();

/// Immutable set of named capabilities.
#[derive(Default, Clone)]
pub struct Registry {
    parsers: BTreeMap<String, DataParser>,
    location_parsers: BTreeMap<String, LocationParser>,
    data_types: BTreeMap<String, Arc<dyn ForwardModel>>,
    relative_data_types: BTreeMap<String, Arc<dyn RelativeForwardModel>>,
    preprocessors: BTreeMap<String, Preprocessor>,
    samplers: BTreeMap<String, Sampler>,
    priors: BTreeMap<String, Prior>,
    algorithms: BTreeMap<String, AlgorithmFactory>,
    output_data_formats: BTreeMap<String, OutputDataFormatter>,
    output_formats: BTreeMap<String, OutputFormatter>,
    pre_inversion: BTreeMap<String, PreInversionHook>,
    post_inversion: BTreeMap<String, PostInversionHook>,
}

impl Registry {
    /// Make `registry` the process-wide registry.
    ///
    /// Fails if a registry was already installed.
    pub fn install(registry: Registry) -> crate::error::Result<Arc<Registry>> {
        let registry = Arc::new(registry);
        GLOBAL.set(registry.clone()).map_err(|_| {
            InversionError::configuration("A capability registry is already installed")
        })?;
        Ok(registry)
    }

    pub fn global() -> Option<Arc<Registry>> {
        GLOBAL.get().cloned()
    }

    pub fn data_type(&self, name: &str) -> Option<Arc<dyn ForwardModel>> {
        self.data_types.get(name).cloned()
    }

    pub fn relative_data_type(&self, name: &str) -> Option<Arc<dyn RelativeForwardModel>> {
        self.relative_data_types.get(name).cloned()
    }

    /// Names of all absolute and relative forward models.
    pub fn forward_model_names(&self) -> Vec<&str> {
        self.data_types
            .keys()
            .chain(self.relative_data_types.keys())
            .map(|name| name.as_str())
            .collect()
    }

    pub fn preprocessor(&self, name: &str) -> Option<Preprocessor> {
        self.preprocessors.get(name).cloned()
    }

    pub fn sampler(&self, name: &str) -> Option<Sampler> {
        self.samplers.get(name).cloned()
    }

    pub fn prior(&self, name: &str) -> Option<Prior> {
        self.priors.get(name).cloned()
    }

    pub fn algorithm(&self, name: &str) -> Option<AlgorithmFactory> {
        self.algorithms.get(name).cloned()
    }

    pub fn output_data_format(&self, name: &str) -> Option<OutputDataFormatter> {
        self.output_data_formats.get(name).cloned()
    }

    pub fn output_format(&self, name: &str) -> Option<OutputFormatter> {
        self.output_formats.get(name).cloned()
    }

    pub fn pre_inversion(&self, name: &str) -> Option<PreInversionHook> {
        self.pre_inversion.get(name).cloned()
    }

    pub fn post_inversion(&self, name: &str) -> Option<PostInversionHook> {
        self.post_inversion.get(name).cloned()
    }

    /// Parse an event data file.
    ///
    /// The parser registered for the file extension is used if there is one,
    /// otherwise every parser is tried in key order.
    pub fn parse_event(&self, path: &Path) -> Result<EventData> {
        parse_with(&self.parsers, path, "data", |parser| parser(path))
    }

    /// Parse a location PDF file into `samples` location samples.
    pub fn parse_location(&self, path: &Path, samples: usize) -> Result<LocationSamples> {
        parse_with(&self.location_parsers, path, "location PDF", |parser| {
            parser(path, samples)
        })
    }
}

fn parse_with<P, T>(
    parsers: &BTreeMap<String, P>,
    path: &Path,
    kind: &str,
    parse: impl Fn(&P) -> Result<T>,
) -> Result<T> {
    if parsers.is_empty() {
        return Err(InversionError::configuration(format!("No {} parser registered", kind)).into());
    }
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().to_lowercase());
    if let Some(parser) = extension.as_ref().and_then(|ext| parsers.get(ext)) {
        return parse(parser)
            .with_context(|| format!("Failed to parse {} file {:?}", kind, path));
    }
    let mut failures = Vec::new();
    for (name, parser) in parsers.iter() {
        match parse(parser) {
            Ok(value) => {
                debug!(parser = name.as_str(), ?path, "parsed with fallback parser");
                return Ok(value);
            }
            Err(err) => failures.push(format!("{}: {:#}", name, err)),
        }
    }
    Err(InversionError::configuration(format!(
        "No {} parser could read {:?} ({})",
        kind,
        path,
        failures.join("; ")
    ))
    .into())
}

fn insert<T>(
    map: &mut BTreeMap<String, T>,
    kind: &str,
    name: &str,
    value: T,
) -> crate::error::Result<()> {
    if name.is_empty() {
        return Err(InversionError::configuration(format!("Empty {} name", kind)));
    }
    if map.contains_key(name) {
        return Err(InversionError::configuration(format!(
            "Duplicate {} {}",
            kind, name
        )));
    }
    map.insert(name.to_string(), value);
    Ok(())
}

fn extension_key(extension: &str) -> String {
    extension.trim_start_matches('.').to_lowercase()
}

/// Collects and validates capabilities.
#[derive(Default)]
pub struct RegistryBuilder {
    registry: Registry,
}

impl RegistryBuilder {
    /// A builder without any capabilities.
    pub fn new() -> Self {
        Self::default()
    }

    /// A builder with the built-in samplers, priors, algorithms, the
    /// `records` output data format and the `gaussian_amplitude` forward
    /// model.
    pub fn with_builtins() -> Self {
        let mut registry = Registry::default();
        let uniform_sampler: Sampler = Arc::new(|n: usize, events: usize, rng: &mut dyn RngCore| {
            uniform_batch(rng, n, events)
        });
        let uniform_prior: Prior = Arc::new(|_: &[f64]| 0f64);
        let monte_carlo: AlgorithmFactory =
            Arc::new(|context: &AlgorithmContext| -> Result<Box<dyn Algorithm>> {
                Ok(Box::new(RandomMonteCarlo::new(
                    MonteCarloSettings::default(),
                    context.clone(),
                )) as Box<dyn Algorithm>)
            });
        let mcmc: AlgorithmFactory =
            Arc::new(|context: &AlgorithmContext| -> Result<Box<dyn Algorithm>> {
                Ok(Box::new(MarkovChain::new(
                    MarkovChainSettings::default(),
                    context.clone(),
                )) as Box<dyn Algorithm>)
            });
        let records: OutputDataFormatter = Arc::new(output::records);
        registry.samplers.insert("uniform".to_string(), uniform_sampler);
        registry.priors.insert("uniform".to_string(), uniform_prior);
        registry.algorithms.insert("monte_carlo".to_string(), monte_carlo);
        registry.algorithms.insert("mcmc".to_string(), mcmc);
        registry
            .output_data_formats
            .insert("records".to_string(), records);
        registry
            .data_types
            .insert("gaussian_amplitude".to_string(), Arc::new(GaussianAmplitude));
        Self { registry }
    }

    /// Data file parser for files with the given extension.
    pub fn parser(
        mut self,
        extension: &str,
        parser: impl Fn(&Path) -> Result<EventData> + Send + Sync + 'static,
    ) -> crate::error::Result<Self> {
        let parser: DataParser = Arc::new(parser);
        insert(&mut self.registry.parsers, "parser", &extension_key(extension), parser)?;
        Ok(self)
    }

    pub fn location_parser(
        mut self,
        extension: &str,
        parser: impl Fn(&Path, usize) -> Result<LocationSamples> + Send + Sync + 'static,
    ) -> crate::error::Result<Self> {
        let parser: LocationParser = Arc::new(parser);
        insert(
            &mut self.registry.location_parsers,
            "location PDF parser",
            &extension_key(extension),
            parser,
        )?;
        Ok(self)
    }

    pub fn data_type(
        mut self,
        name: &str,
        model: impl ForwardModel + 'static,
    ) -> crate::error::Result<Self> {
        if self.registry.relative_data_types.contains_key(name) {
            return Err(InversionError::configuration(format!(
                "Duplicate data type {}",
                name
            )));
        }
        let model: Arc<dyn ForwardModel> = Arc::new(model);
        insert(&mut self.registry.data_types, "data type", name, model)?;
        Ok(self)
    }

    /// Forward model of a relative data type. The name must contain `relative`.
    pub fn relative_data_type(
        mut self,
        name: &str,
        model: impl RelativeForwardModel + 'static,
    ) -> crate::error::Result<Self> {
        if !name.contains("relative") {
            return Err(InversionError::configuration(format!(
                "Relative data type {} must contain \"relative\" in its name",
                name
            )));
        }
        if self.registry.data_types.contains_key(name) {
            return Err(InversionError::configuration(format!(
                "Duplicate data type {}",
                name
            )));
        }
        let model: Arc<dyn RelativeForwardModel> = Arc::new(model);
        insert(&mut self.registry.relative_data_types, "relative data type", name, model)?;
        Ok(self)
    }

    pub fn preprocessor(
        mut self,
        data_type: &str,
        preprocessor: impl Fn(&EventData, &str) -> Result<PreparedData> + Send + Sync + 'static,
    ) -> crate::error::Result<Self> {
        let preprocessor: Preprocessor = Arc::new(preprocessor);
        insert(&mut self.registry.preprocessors, "preprocessor", data_type, preprocessor)?;
        Ok(self)
    }

    pub fn sampler(
        mut self,
        name: &str,
        sampler: impl Fn(usize, usize, &mut dyn RngCore) -> MomentTensorBatch
            + Send
            + Sync
            + 'static,
    ) -> crate::error::Result<Self> {
        let sampler: Sampler = Arc::new(sampler);
        insert(&mut self.registry.samplers, "sampler", name, sampler)?;
        Ok(self)
    }

    pub fn prior(
        mut self,
        name: &str,
        prior: impl Fn(&[f64]) -> f64 + Send + Sync + 'static,
    ) -> crate::error::Result<Self> {
        let prior: Prior = Arc::new(prior);
        insert(&mut self.registry.priors, "prior", name, prior)?;
        Ok(self)
    }

    pub fn algorithm(
        mut self,
        name: &str,
        factory: impl Fn(&AlgorithmContext) -> Result<Box<dyn Algorithm>>
            + Send
            + Sync
            + 'static,
    ) -> crate::error::Result<Self> {
        let factory: AlgorithmFactory = Arc::new(factory);
        insert(&mut self.registry.algorithms, "algorithm", name, factory)?;
        Ok(self)
    }

    /// Output data format selected by [`OutputSettings::data_format`].
    ///
    /// [`OutputSettings::data_format`]: crate::OutputSettings::data_format
    pub fn output_data_format(
        mut self,
        name: &str,
        formatter: impl Fn(&InversionOutput, &[EventData]) -> Result<OutputData>
            + Send
            + Sync
            + 'static,
    ) -> crate::error::Result<Self> {
        let formatter: OutputDataFormatter = Arc::new(formatter);
        insert(
            &mut self.registry.output_data_formats,
            "output data format",
            name,
            formatter,
        )?;
        Ok(self)
    }

    pub fn output_format(
        mut self,
        name: &str,
        formatter: impl Fn(&OutputData, &Path, &mut JobPool<WriteJob>) -> Result<(String, PathBuf)>
            + Send
            + Sync
            + 'static,
    ) -> crate::error::Result<Self> {
        let formatter: OutputFormatter = Arc::new(formatter);
        insert(&mut self.registry.output_formats, "output format", name, formatter)?;
        Ok(self)
    }

    pub fn pre_inversion(
        mut self,
        name: &str,
        hook: impl Fn(InversionSettings) -> Result<InversionSettings> + Send + Sync + 'static,
    ) -> crate::error::Result<Self> {
        let hook: PreInversionHook = Arc::new(hook);
        insert(&mut self.registry.pre_inversion, "pre-inversion hook", name, hook)?;
        Ok(self)
    }

    pub fn post_inversion(
        mut self,
        name: &str,
        hook: impl Fn(&InversionOutput) -> Result<()> + Send + Sync + 'static,
    ) -> crate::error::Result<Self> {
        let hook: PostInversionHook = Arc::new(hook);
        insert(&mut self.registry.post_inversion, "post-inversion hook", name, hook)?;
        Ok(self)
    }

    pub fn build(self) -> Registry {
        self.registry
    }
}
