//! Output data handed from the data format stage to the output format.

use std::collections::BTreeMap;

use anyhow::Result;
use itertools::Itertools;

use crate::data::EventData;
use crate::driver::InversionOutput;
use crate::moment_tensor::MT_COMPONENTS;

/// Inversion results arranged for an output format.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OutputData {
    /// Named values describing the run.
    pub metadata: BTreeMap<String, String>,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

impl OutputData {
    pub fn with_metadata(mut self, key: &str, value: impl ToString) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// One row per sample record and the run diagnostics as metadata.
///
/// Rows have the columns `ln_pdf`, `scale`, `scale_uncertainty` followed by
/// the six components of every event.
pub fn records(output: &InversionOutput, events: &[EventData]) -> Result<OutputData> {
    let diagnostics = &output.diagnostics;
    let stations = events
        .iter()
        .flat_map(|event| event.data.values())
        .flat_map(|data| data.stations.iter())
        .sorted()
        .dedup()
        .join(",");

    let mut data = OutputData::default()
        .with_metadata("events", events.len())
        .with_metadata("stations", stations)
        .with_metadata("records", output.sample.summary().records)
        .with_metadata("iterations", diagnostics.iterations)
        .with_metadata("acceptance_rate", diagnostics.acceptance_rate)
        .with_metadata("effective_sample_size", diagnostics.effective_sample_size)
        .with_metadata("converged", diagnostics.converged);
    if let Some(ln_evidence) = diagnostics.ln_evidence {
        data = data.with_metadata("ln_evidence", ln_evidence);
    }
    if let Some(termination) = diagnostics.termination {
        data = data.with_metadata("termination", termination);
    }

    data.columns = ["ln_pdf", "scale", "scale_uncertainty"]
        .into_iter()
        .map(String::from)
        .chain((0..events.len() * MT_COMPONENTS).map(|i| format!("m{}", i)))
        .collect();
    data.rows = output
        .sample
        .stored_records()?
        .into_iter()
        .map(|record| {
            [record.ln_pdf, record.scale, record.scale_uncertainty]
                .into_iter()
                .chain(record.candidate)
                .collect()
        })
        .collect();
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::TerminationReason;
    use crate::data::StationData;
    use crate::driver::Diagnostics;
    use crate::sample::{PdfSample, SampleRecord, SampleStore};
    use pretty_assertions::assert_eq;

    fn event(stations: &[&str]) -> EventData {
        EventData::default().with_data_type(
            "amplitude",
            StationData {
                stations: stations.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        )
    }

    #[test]
    fn records_with_diagnostics() -> Result<()> {
        let mut sample = PdfSample::new();
        sample.append(vec![
            SampleRecord::new(vec![1., 0., 0., 0., 0., 0.], -1.),
            SampleRecord::new(vec![0., 1., 0., 0., 0., 0.], -2.),
        ]);
        let output = InversionOutput {
            sample: SampleStore::Memory(sample),
            diagnostics: Diagnostics {
                iterations: 4,
                converged: true,
                termination: Some(TerminationReason::SampleBudget),
                ..Default::default()
            },
        };

        let data = records(&output, &[event(&["S2", "S1"]), event(&["S1", "S3"])])?;
        assert_eq!(data.metadata["events"], "2");
        assert_eq!(data.metadata["stations"], "S1,S2,S3");
        assert_eq!(data.metadata["records"], "2");
        assert_eq!(data.metadata["termination"], "sample budget reached");
        assert!(!data.metadata.contains_key("ln_evidence"));
        assert_eq!(data.columns.len(), 3 + 12);
        assert_eq!(data.rows[1], vec![-2., 1., 0., 0., 1., 0., 0., 0., 0.]);
        Ok(())
    }
}
