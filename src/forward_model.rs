//! Evaluation of the forward models of all data types for a candidate batch.

use std::f64::consts::PI;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use crate::data::{EventData, PreparedData};
use crate::error::InversionError;
use crate::job_pool::Job;
use crate::lnpdf::LnPdf;
use crate::math::logsumexp;
use crate::moment_tensor::MomentTensorBatch;
use crate::registry::Registry;

/// Log-likelihood of one data type for a batch of candidates.
///
/// Implementations are free to evaluate the batch however they like, but
/// must return exactly one value per candidate column.
pub trait ForwardModel: Send + Sync {
    fn ln_likelihood(&self, candidates: &MomentTensorBatch, data: &PreparedData) -> Result<LnPdf>;
}

impl<F> ForwardModel for F
where
    F: Fn(&MomentTensorBatch, &PreparedData) -> Result<LnPdf> + Send + Sync,
{
    fn ln_likelihood(&self, candidates: &MomentTensorBatch, data: &PreparedData) -> Result<LnPdf> {
        self(candidates, data)
    }
}

/// Output of a relative forward model.
#[derive(Debug, Clone, PartialEq)]
pub struct RelativeLikelihood {
    pub ln_pdf: LnPdf,
    /// Estimated relative moment scale of the second event per candidate.
    pub scale: Vec<f64>,
    pub scale_uncertainty: Vec<f64>,
}

impl RelativeLikelihood {
    /// A result without scale estimate: scale 1 with zero uncertainty.
    pub fn unscaled(ln_pdf: LnPdf) -> Self {
        let n = ln_pdf.len();
        Self {
            ln_pdf,
            scale: vec![1.; n],
            scale_uncertainty: vec![0.; n],
        }
    }
}

/// Forward model of a data type that pairs observations of two events.
///
/// Candidates hold the stacked six-vectors of both events.
pub trait RelativeForwardModel: Send + Sync {
    fn ln_likelihood(
        &self,
        candidates: &MomentTensorBatch,
        first: &PreparedData,
        second: &PreparedData,
    ) -> Result<RelativeLikelihood>;
}

impl<F> RelativeForwardModel for F
where
    F: Fn(&MomentTensorBatch, &PreparedData, &PreparedData) -> Result<RelativeLikelihood>
        + Send
        + Sync,
{
    fn ln_likelihood(
        &self,
        candidates: &MomentTensorBatch,
        first: &PreparedData,
        second: &PreparedData,
    ) -> Result<RelativeLikelihood> {
        self(candidates, first, second)
    }
}

/// Gaussian misfit of linear amplitude predictions.
///
/// The prediction at station `k` is the dot product of its coefficients with
/// the candidate. Location samples are marginalised with their probabilities.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianAmplitude;

impl ForwardModel for GaussianAmplitude {
    fn ln_likelihood(&self, candidates: &MomentTensorBatch, data: &PreparedData) -> Result<LnPdf> {
        let norm: f64 = data
            .errors
            .iter()
            .map(|sigma| -(sigma * (2. * PI).sqrt()).ln())
            .sum();
        let mut per_location = vec![0f64; data.coefficients.len()];
        Ok((0..candidates.len())
            .map(|j| {
                let tensor = candidates.tensor(j, 0);
                for (s, (coefficients, ln_p)) in data
                    .coefficients
                    .iter()
                    .zip(data.location_ln_probabilities.iter())
                    .enumerate()
                {
                    let misfit: f64 = coefficients
                        .iter()
                        .zip(data.observations.iter().zip(data.errors.iter()))
                        .map(|(c, (obs, sigma))| {
                            let predicted: f64 =
                                c.iter().zip(tensor.iter()).map(|(a, b)| a * b).sum();
                            let z = (obs - predicted) / sigma;
                            -0.5 * z * z
                        })
                        .sum();
                    per_location[s] = ln_p + norm + misfit;
                }
                logsumexp(&per_location)
            })
            .collect())
    }
}

enum Term {
    Absolute {
        name: String,
        model: Arc<dyn ForwardModel>,
        prepared: Vec<PreparedData>,
    },
    Relative {
        name: String,
        model: Arc<dyn RelativeForwardModel>,
        first: PreparedData,
        second: PreparedData,
    },
}

impl Term {
    fn name(&self) -> &str {
        match self {
            Term::Absolute { name, .. } | Term::Relative { name, .. } => name,
        }
    }
}

/// Combined result of all data types for one batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub ln_pdf: LnPdf,
    pub scale: Vec<f64>,
    pub scale_uncertainty: Vec<f64>,
    /// Number of NaN or positive infinite values replaced by negative infinity.
    pub clipped: usize,
}

/// Computes the joint log-likelihood of all configured data types.
///
/// Contributions of different data types are summed in log space, which
/// assumes the data types are independent.
pub struct ForwardModelEvaluator {
    terms: Vec<Term>,
    events: usize,
}

impl ForwardModelEvaluator {
    /// Look up the forward models and prepare the data of every data type.
    ///
    /// Fails with a configuration error if a data type has no registered
    /// forward model or an event lacks its data.
    pub fn new(registry: &Registry, events: &[EventData], data_types: &[String]) -> Result<Self> {
        if events.is_empty() {
            return Err(InversionError::configuration("No events to invert").into());
        }
        if data_types.is_empty() {
            return Err(InversionError::configuration("No data types selected").into());
        }

        let mut terms = Vec::with_capacity(data_types.len());
        for name in data_types {
            if let Some(model) = registry.relative_data_type(name) {
                if events.len() != 2 {
                    return Err(InversionError::configuration(format!(
                        "Relative data type {} needs exactly two events, got {}",
                        name,
                        events.len()
                    ))
                    .into());
                }
                let first = prepare(registry, &events[0], name)?;
                let second = prepare(registry, &events[1], name)?;
                first
                    .shared_stations(&second)
                    .with_context(|| format!("Invalid station data for {}", name))?;
                terms.push(Term::Relative {
                    name: name.clone(),
                    model,
                    first,
                    second,
                });
            } else if let Some(model) = registry.data_type(name) {
                let prepared = events
                    .iter()
                    .map(|event| prepare(registry, event, name))
                    .collect::<Result<Vec<_>>>()?;
                terms.push(Term::Absolute {
                    name: name.clone(),
                    model,
                    prepared,
                });
            } else {
                return Err(InversionError::configuration(format!(
                    "No forward model registered for data type {} (available: {})",
                    name,
                    registry.forward_model_names().join(", ")
                ))
                .into());
            }
        }

        Ok(Self {
            terms,
            events: events.len(),
        })
    }

    /// Number of events a candidate describes.
    pub fn events(&self) -> usize {
        self.events
    }

    pub fn data_types(&self) -> Vec<&str> {
        self.terms.iter().map(|term| term.name()).collect()
    }

    pub fn evaluate(&self, candidates: &MomentTensorBatch) -> Result<Evaluation> {
        if candidates.events() != self.events {
            return Err(InversionError::configuration(format!(
                "Candidates describe {} events, the data {}",
                candidates.events(),
                self.events
            ))
            .into());
        }
        let n = candidates.len();
        let mut total = LnPdf::zeros(n);
        let mut scales: Option<(Vec<f64>, Vec<f64>)> = None;
        let mut clipped = 0;

        for term in self.terms.iter() {
            let ln_pdf = match term {
                Term::Absolute {
                    name,
                    model,
                    prepared,
                } => {
                    let mut joint = LnPdf::zeros(n);
                    for (event, data) in prepared.iter().enumerate() {
                        let batch = if self.events == 1 {
                            candidates.clone()
                        } else {
                            candidates.event_batch(event)
                        };
                        let ln_pdf = model
                            .ln_likelihood(&batch, data)
                            .with_context(|| format!("Forward model {} failed", name))?;
                        joint = joint.combine(&ln_pdf)?;
                    }
                    joint
                }
                Term::Relative {
                    name,
                    model,
                    first,
                    second,
                } => {
                    let result = model
                        .ln_likelihood(candidates, first, second)
                        .with_context(|| format!("Relative forward model {} failed", name))?;
                    if result.scale.len() != n || result.scale_uncertainty.len() != n {
                        return Err(InversionError::SizeMismatch {
                            left: n,
                            right: result.scale.len().min(result.scale_uncertainty.len()),
                        }
                        .into());
                    }
                    if scales.is_none() {
                        scales = Some((result.scale, result.scale_uncertainty));
                    }
                    result.ln_pdf
                }
            };
            let (ln_pdf, term_clipped) = ln_pdf.sanitize();
            if term_clipped > 0 {
                debug!(
                    data_type = term.name(),
                    clipped = term_clipped,
                    "clipped non-finite ln pdf values"
                );
            }
            clipped += term_clipped;
            total = total.combine(&ln_pdf)?;
        }

        let (scale, scale_uncertainty) = scales.unwrap_or_else(|| (vec![1.; n], vec![0.; n]));
        Ok(Evaluation {
            ln_pdf: total,
            scale,
            scale_uncertainty,
            clipped,
        })
    }
}

fn prepare(registry: &Registry, event: &EventData, data_type: &str) -> Result<PreparedData> {
    if let Some(preprocessor) = registry.preprocessor(data_type) {
        return preprocessor(event, data_type).map_err(|err| {
            InversionError::configuration(format!(
                "Preprocessing of {} failed: {:#}",
                data_type, err
            ))
            .into()
        });
    }
    let data = event.data.get(data_type).ok_or_else(|| {
        InversionError::configuration(format!("Event has no data for data type {}", data_type))
    })?;
    Ok(PreparedData::from_station_data(data, event.location.as_ref())?)
}

/// A sub-batch of candidates to evaluate on a pool worker.
pub struct JobDescriptor {
    pub offset: usize,
    pub candidates: MomentTensorBatch,
    evaluator: Arc<ForwardModelEvaluator>,
}

impl JobDescriptor {
    pub fn new(
        offset: usize,
        candidates: MomentTensorBatch,
        evaluator: Arc<ForwardModelEvaluator>,
    ) -> Self {
        Self {
            offset,
            candidates,
            evaluator,
        }
    }
}

/// An evaluated sub-batch, tagged with its column offset in the full batch.
#[derive(Debug, Clone)]
pub struct EvaluatedBatch {
    pub offset: usize,
    pub candidates: MomentTensorBatch,
    pub evaluation: Evaluation,
}

impl Job for JobDescriptor {
    type Output = EvaluatedBatch;

    fn run(self) -> Result<EvaluatedBatch> {
        let evaluation = self.evaluator.evaluate(&self.candidates)?;
        if evaluation.ln_pdf.len() != self.candidates.len() {
            return Err(InversionError::SizeMismatch {
                left: self.candidates.len(),
                right: evaluation.ln_pdf.len(),
            }
            .into());
        }
        Ok(EvaluatedBatch {
            offset: self.offset,
            candidates: self.candidates,
            evaluation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StationData;
    use crate::registry::RegistryBuilder;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;

    fn station_data(names: &[&str]) -> StationData {
        StationData {
            stations: names.iter().map(|s| s.to_string()).collect(),
            observations: vec![1.; names.len()],
            errors: vec![0.5; names.len()],
            coefficients: vec![vec![[1., 0., 0., 0., 0., 0.]; names.len()]],
        }
    }

    fn event(names: &[&str]) -> EventData {
        EventData::default()
            .with_data_type("amplitude", station_data(names))
            .with_data_type("polarity", station_data(names))
            .with_data_type("relative_amplitude", station_data(names))
    }

    fn constant(value: f64) -> impl Fn(&MomentTensorBatch, &PreparedData) -> Result<LnPdf> {
        move |candidates: &MomentTensorBatch, _: &PreparedData| {
            Ok(LnPdf::new(vec![value; candidates.len()]))
        }
    }

    fn candidates(n: usize, events: usize) -> MomentTensorBatch {
        let candidate = vec![1.; 6 * events];
        MomentTensorBatch::from_candidates(&vec![candidate; n]).unwrap()
    }

    #[test]
    fn sums_data_types() {
        let registry = RegistryBuilder::new()
            .data_type("amplitude", constant(-1.))
            .unwrap()
            .data_type("polarity", |c: &MomentTensorBatch, _: &PreparedData| -> Result<LnPdf> {
                Ok((0..c.len()).map(|j| if j == 1 { f64::NAN } else { -2. }).collect())
            })
            .unwrap()
            .build();
        let evaluator = ForwardModelEvaluator::new(
            &registry,
            &[event(&["A"])],
            &["amplitude".to_string(), "polarity".to_string()],
        )
        .unwrap();
        let result = evaluator.evaluate(&candidates(3, 1)).unwrap();
        assert_eq!(result.ln_pdf.values(), &[-3., f64::NEG_INFINITY, -3.]);
        assert_eq!(result.clipped, 1);
        assert_eq!(result.scale, vec![1.; 3]);
        assert_eq!(result.scale_uncertainty, vec![0.; 3]);
    }

    #[test]
    fn impossible_event_is_not_clipped() {
        // The second event reports +inf where the first one rules a candidate out
        let registry = RegistryBuilder::new()
            .data_type(
                "amplitude",
                |c: &MomentTensorBatch, data: &PreparedData| -> Result<LnPdf> {
                    let first = if data.stations.len() == 1 {
                        f64::NEG_INFINITY
                    } else {
                        f64::INFINITY
                    };
                    Ok((0..c.len()).map(|j| if j == 0 { first } else { -1. }).collect())
                },
            )
            .unwrap()
            .build();
        let evaluator = ForwardModelEvaluator::new(
            &registry,
            &[event(&["A"]), event(&["A", "B"])],
            &["amplitude".to_string()],
        )
        .unwrap();
        let result = evaluator.evaluate(&candidates(2, 2)).unwrap();
        assert_eq!(result.ln_pdf.values(), &[f64::NEG_INFINITY, -2.]);
        assert_eq!(result.clipped, 0);
    }

    #[test]
    fn missing_forward_model() {
        let registry = RegistryBuilder::new()
            .data_type("amplitude", constant(0.))
            .unwrap()
            .build();
        let err = ForwardModelEvaluator::new(
            &registry,
            &[event(&["A"])],
            &["polarity".to_string()],
        )
        .err()
        .unwrap();
        assert!(matches!(
            err.downcast_ref::<InversionError>(),
            Some(InversionError::Configuration(_))
        ));
    }

    #[test]
    fn missing_event_data() {
        let registry = RegistryBuilder::new()
            .data_type("amplitude", constant(0.))
            .unwrap()
            .build();
        let err = ForwardModelEvaluator::new(
            &registry,
            &[EventData::default()],
            &["amplitude".to_string()],
        )
        .err()
        .unwrap();
        assert!(matches!(
            err.downcast_ref::<InversionError>(),
            Some(InversionError::Configuration(_))
        ));
    }

    #[test]
    fn relative_scale_and_order() {
        let registry = RegistryBuilder::new()
            .relative_data_type(
                "relative_amplitude",
                |c: &MomentTensorBatch,
                 _: &PreparedData,
                 _: &PreparedData|
                 -> Result<RelativeLikelihood> {
                    assert_eq!(c.events(), 2);
                    let mut result = RelativeLikelihood::unscaled(LnPdf::zeros(c.len()));
                    result.scale = vec![2.; c.len()];
                    Ok(result)
                },
            )
            .unwrap()
            .data_type("amplitude", constant(-1.))
            .unwrap()
            .build();
        let data_types = vec!["relative_amplitude".to_string(), "amplitude".to_string()];

        let evaluator = ForwardModelEvaluator::new(
            &registry,
            &[event(&["A", "B"]), event(&["A", "C", "B"])],
            &data_types,
        )
        .unwrap();
        let result = evaluator.evaluate(&candidates(2, 2)).unwrap();
        // The absolute term contributes once per event
        assert_eq!(result.ln_pdf.values(), &[-2., -2.]);
        assert_eq!(result.scale, vec![2., 2.]);

        let err = ForwardModelEvaluator::new(
            &registry,
            &[event(&["A", "B"]), event(&["B", "A"])],
            &data_types,
        )
        .err()
        .unwrap();
        assert!(matches!(
            err.downcast_ref::<InversionError>(),
            Some(InversionError::Configuration(_))
        ));

        assert!(ForwardModelEvaluator::new(&registry, &[event(&["A"])], &data_types).is_err());
    }

    #[test]
    fn gaussian_amplitude() {
        let data = PreparedData::from_station_data(&station_data(&["A", "B"]), None).unwrap();
        let batch = MomentTensorBatch::from_candidates(&[
            [1., 0., 0., 0., 0., 0.],
            [0., 1., 0., 0., 0., 0.],
        ])
        .unwrap();
        let ln_pdf = GaussianAmplitude.ln_likelihood(&batch, &data).unwrap();
        let norm = -2. * (0.5 * (2. * PI).sqrt()).ln();
        assert_relative_eq!(ln_pdf[0], norm, epsilon = 1e-12);
        assert_relative_eq!(ln_pdf[1], norm - 2. * 0.5 * 4., epsilon = 1e-12);
    }
}
