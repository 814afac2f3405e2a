//! Accumulated posterior samples.

use anyhow::Result;
use rand::Rng;

use crate::file_sample::{FileSample, FileSampleSettings};
use crate::lnpdf::LnPdf;
use crate::math::logaddexp;

/// One accepted candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    pub candidate: Vec<f64>,
    pub ln_pdf: f64,
    /// Relative moment scale, 1.0 unless a relative forward model estimated it.
    pub scale: f64,
    pub scale_uncertainty: f64,
}

impl SampleRecord {
    pub fn new(candidate: Vec<f64>, ln_pdf: f64) -> Self {
        Self {
            candidate,
            ln_pdf,
            scale: 1.,
            scale_uncertainty: 0.,
        }
    }
}

/// Running aggregates over every record ever appended.
///
/// Sums are kept in log space and only updated through `logaddexp`, so the
/// result does not depend on the order in which records arrive.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleSummary {
    pub records: u64,
    /// `ln Σ p`
    pub ln_total: f64,
    /// `ln Σ p²`
    pub ln_total_squared: f64,
    pub max_ln_pdf: f64,
    pub accepted: u64,
    pub proposed: u64,
}

impl Default for SampleSummary {
    fn default() -> Self {
        Self {
            records: 0,
            ln_total: f64::NEG_INFINITY,
            ln_total_squared: f64::NEG_INFINITY,
            max_ln_pdf: f64::NEG_INFINITY,
            accepted: 0,
            proposed: 0,
        }
    }
}

impl SampleSummary {
    pub fn observe(&mut self, ln_pdf: f64) {
        self.records += 1;
        self.ln_total = logaddexp(self.ln_total, ln_pdf);
        self.ln_total_squared = logaddexp(self.ln_total_squared, 2. * ln_pdf);
        self.max_ln_pdf = self.max_ln_pdf.max(ln_pdf);
    }

    pub fn merge(&mut self, other: &SampleSummary) {
        self.records += other.records;
        self.ln_total = logaddexp(self.ln_total, other.ln_total);
        self.ln_total_squared = logaddexp(self.ln_total_squared, other.ln_total_squared);
        self.max_ln_pdf = self.max_ln_pdf.max(other.max_ln_pdf);
        self.accepted += other.accepted;
        self.proposed += other.proposed;
    }

    pub fn acceptance_rate(&self) -> f64 {
        if self.proposed == 0 {
            return 0.;
        }
        self.accepted as f64 / self.proposed as f64
    }

    /// Kish effective sample size of the probability weights.
    pub fn effective_sample_size(&self) -> f64 {
        if self.ln_total == f64::NEG_INFINITY {
            return 0.;
        }
        (2. * self.ln_total - self.ln_total_squared).exp()
    }
}

/// In-memory posterior sample.
#[derive(Debug, Clone, Default)]
pub struct PdfSample {
    records: Vec<SampleRecord>,
    summary: SampleSummary,
}

impl PdfSample {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, records: Vec<SampleRecord>) {
        for record in records.iter() {
            self.summary.observe(record.ln_pdf);
        }
        self.records.extend(records);
    }

    pub fn records(&self) -> &[SampleRecord] {
        &self.records
    }

    pub fn summary(&self) -> &SampleSummary {
        &self.summary
    }
}

/// Where an algorithm keeps its accepted samples.
#[derive(Debug)]
pub enum SampleStore {
    Memory(PdfSample),
    File(FileSample),
}

impl SampleStore {
    pub fn from_settings(settings: Option<&FileSampleSettings>) -> Result<Self> {
        match settings {
            Some(settings) => Ok(SampleStore::File(FileSample::open(settings.clone())?)),
            None => Ok(SampleStore::Memory(PdfSample::new())),
        }
    }

    pub fn append(&mut self, records: Vec<SampleRecord>) -> Result<()> {
        match self {
            SampleStore::Memory(sample) => {
                sample.append(records);
                Ok(())
            }
            SampleStore::File(sample) => sample.append(records),
        }
    }

    pub fn record_acceptance(&mut self, accepted: u64, proposed: u64) {
        let summary = self.summary_mut();
        summary.accepted += accepted;
        summary.proposed += proposed;
    }

    pub fn summary(&self) -> &SampleSummary {
        match self {
            SampleStore::Memory(sample) => &sample.summary,
            SampleStore::File(sample) => sample.summary(),
        }
    }

    fn summary_mut(&mut self) -> &mut SampleSummary {
        match self {
            SampleStore::Memory(sample) => &mut sample.summary,
            SampleStore::File(sample) => sample.summary_mut(),
        }
    }

    /// Records currently held in memory.
    pub fn resident(&self) -> Vec<&SampleRecord> {
        match self {
            SampleStore::Memory(sample) => sample.records.iter().collect(),
            SampleStore::File(sample) => sample.resident().collect(),
        }
    }

    /// Every record, reading spilled records back from disk if needed.
    pub fn all_records(&mut self) -> Result<Vec<SampleRecord>> {
        match self {
            SampleStore::Memory(sample) => Ok(sample.records.clone()),
            SampleStore::File(sample) => sample.read_all(),
        }
    }

    /// Records that can be read without writing anything: all of them for an
    /// in-memory sample, the spilled ones for a file sample.
    pub fn stored_records(&self) -> Result<Vec<SampleRecord>> {
        match self {
            SampleStore::Memory(sample) => Ok(sample.records.clone()),
            SampleStore::File(sample) => sample.read_written(),
        }
    }

    pub fn flush(&mut self) -> Result<()> {
        match self {
            SampleStore::Memory(_) => Ok(()),
            SampleStore::File(sample) => sample.flush(),
        }
    }

    /// Draw `n` records with replacement, weighted by their probability.
    pub fn resample<R: Rng + ?Sized>(
        &mut self,
        n: usize,
        rng: &mut R,
    ) -> Result<Vec<SampleRecord>> {
        let records = self.all_records()?;
        Ok(weighted_resample(&records, n, rng)?)
    }
}

/// Multinomial resampling of `records` according to `exp(ln_pdf)`.
pub fn weighted_resample<R: Rng + ?Sized>(
    records: &[SampleRecord],
    n: usize,
    rng: &mut R,
) -> crate::error::Result<Vec<SampleRecord>> {
    let weights: LnPdf = records.iter().map(|record| record.ln_pdf).collect();
    let probabilities = weights.normalize()?;
    let mut cumulative = Vec::with_capacity(probabilities.len());
    let mut total = 0f64;
    for p in probabilities {
        total += p;
        cumulative.push(total);
    }
    let last = cumulative.len() - 1;
    Ok((0..n)
        .map(|_| {
            let u: f64 = rng.random::<f64>() * total;
            let index = cumulative.partition_point(|&c| c <= u).min(last);
            records[index].clone()
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InversionError;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn record(value: f64, ln_pdf: f64) -> SampleRecord {
        SampleRecord::new(vec![value; 6], ln_pdf)
    }

    #[test]
    fn summary_is_order_independent() {
        let values = [0.5, -1., -3., 2., f64::NEG_INFINITY];
        let mut forward = SampleSummary::default();
        values.iter().for_each(|&v| forward.observe(v));
        let mut backward = SampleSummary::default();
        values.iter().rev().for_each(|&v| backward.observe(v));
        assert_eq!(forward.records, backward.records);
        assert_relative_eq!(forward.ln_total, backward.ln_total, epsilon = 1e-12);

        let mut left = SampleSummary::default();
        values[..2].iter().for_each(|&v| left.observe(v));
        let mut right = SampleSummary::default();
        values[2..].iter().for_each(|&v| right.observe(v));
        left.merge(&right);
        assert_relative_eq!(left.ln_total, forward.ln_total, epsilon = 1e-12);
    }

    #[test]
    fn effective_sample_size() {
        let mut summary = SampleSummary::default();
        for _ in 0..10 {
            summary.observe(-2.);
        }
        assert_relative_eq!(summary.effective_sample_size(), 10., epsilon = 1e-9);

        let mut skewed = SampleSummary::default();
        skewed.observe(0.);
        skewed.observe(-100.);
        assert_relative_eq!(skewed.effective_sample_size(), 1., epsilon = 1e-9);
        assert_eq!(SampleSummary::default().effective_sample_size(), 0.);
    }

    #[test]
    fn acceptance_rate() {
        let mut store = SampleStore::from_settings(None).unwrap();
        assert_eq!(store.summary().acceptance_rate(), 0.);
        store.record_acceptance(3, 4);
        store.record_acceptance(0, 4);
        assert_relative_eq!(store.summary().acceptance_rate(), 3. / 8.);
    }

    #[test]
    fn resample_follows_weights() {
        let mut store = SampleStore::from_settings(None).unwrap();
        store
            .append(vec![
                record(0., 0.),
                record(1., f64::NEG_INFINITY),
                record(2., 3f64.ln()),
            ])
            .unwrap();
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let draws = store.resample(4000, &mut rng).unwrap();
        let first = draws.iter().filter(|r| r.candidate[0] == 0.).count();
        assert!(draws.iter().all(|r| r.candidate[0] != 1.));
        assert!((800..1200).contains(&first), "{} draws of the first record", first);
    }

    #[test]
    fn resample_without_mass() {
        let records = vec![record(0., f64::NEG_INFINITY)];
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        assert!(matches!(
            weighted_resample(&records, 3, &mut rng),
            Err(InversionError::NoProbabilityMass)
        ));
        assert!(matches!(
            weighted_resample(&[], 3, &mut rng),
            Err(InversionError::NoProbabilityMass)
        ));
    }
}
