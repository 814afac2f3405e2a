//! Observed event data and its prepared form.

use std::collections::BTreeMap;
use std::f64::consts::SQRT_2;

use crate::error::{InversionError, Result};
use crate::moment_tensor::MT_COMPONENTS;

/// Station geometry for one location sample, angles in degrees.
#[derive(Debug, Clone, PartialEq)]
pub struct StationAngles {
    pub name: String,
    pub azimuth: f64,
    pub takeoff_angle: f64,
}

impl StationAngles {
    /// P-wave amplitude coefficients of the ray leaving towards this station.
    ///
    /// The components match the six-vector ordering
    /// `[Mxx, Myy, Mzz, sqrt(2)Mxy, sqrt(2)Mxz, sqrt(2)Myz]`.
    pub fn p_coefficients(&self) -> [f64; MT_COMPONENTS] {
        let (sin_az, cos_az) = self.azimuth.to_radians().sin_cos();
        let (sin_toa, cos_toa) = self.takeoff_angle.to_radians().sin_cos();
        let x = cos_az * sin_toa;
        let y = sin_az * sin_toa;
        let z = cos_toa;
        [
            x * x,
            y * y,
            z * z,
            SQRT_2 * x * y,
            SQRT_2 * x * z,
            SQRT_2 * y * z,
        ]
    }
}

/// Samples of the event location PDF with their relative probabilities.
///
/// `samples` may be left empty when the station data already carries its
/// coefficients.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct LocationSamples {
    pub samples: Vec<Vec<StationAngles>>,
    pub probabilities: Vec<f64>,
}

impl LocationSamples {
    /// Coefficients of `stations` for every location sample.
    pub fn coefficients(&self, stations: &[String]) -> Result<Vec<Vec<[f64; MT_COMPONENTS]>>> {
        if self.samples.len() != self.len() {
            return Err(InversionError::configuration(format!(
                "{} location samples but {} station angle sets",
                self.len(),
                self.samples.len()
            )));
        }
        self.samples
            .iter()
            .map(|angles| {
                stations
                    .iter()
                    .map(|station| {
                        angles
                            .iter()
                            .find(|angle| &angle.name == station)
                            .map(StationAngles::p_coefficients)
                            .ok_or_else(|| {
                                InversionError::configuration(format!(
                                    "No angles for station {} in location sample",
                                    station
                                ))
                            })
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.probabilities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probabilities.is_empty()
    }
}

/// Observations of one data type for one event.
///
/// `coefficients[s][k]` holds the station coefficients of station `k` for
/// location sample `s`, so that the predicted observation for a candidate is
/// the dot product with its six-vector.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StationData {
    pub stations: Vec<String>,
    pub observations: Vec<f64>,
    pub errors: Vec<f64>,
    pub coefficients: Vec<Vec<[f64; MT_COMPONENTS]>>,
}

/// All observations of one event, keyed by data type.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventData {
    pub data: BTreeMap<String, StationData>,
    pub location: Option<LocationSamples>,
}

impl EventData {
    pub fn with_data_type(mut self, name: impl Into<String>, data: StationData) -> Self {
        self.data.insert(name.into(), data);
        self
    }
}

/// Data of one data type in the form the forward models consume.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PreparedData {
    pub stations: Vec<String>,
    pub observations: Vec<f64>,
    pub errors: Vec<f64>,
    pub coefficients: Vec<Vec<[f64; MT_COMPONENTS]>>,
    /// Natural log of the normalized probability of each location sample.
    pub location_ln_probabilities: Vec<f64>,
}

impl PreparedData {
    /// Validate station data and attach normalized location probabilities.
    ///
    /// Station data without coefficients takes them from the station angles
    /// of the location samples.
    pub fn from_station_data(
        data: &StationData,
        location: Option<&LocationSamples>,
    ) -> Result<Self> {
        let n = data.stations.len();
        if data.observations.len() != n || data.errors.len() != n {
            return Err(InversionError::configuration(format!(
                "{} stations but {} observations and {} errors",
                n,
                data.observations.len(),
                data.errors.len()
            )));
        }
        let coefficients = if !data.coefficients.is_empty() {
            data.coefficients.clone()
        } else if let Some(location) = location {
            location.coefficients(&data.stations)?
        } else {
            Vec::new()
        };
        if coefficients.is_empty() {
            return Err(InversionError::configuration(
                "Station data without coefficients",
            ));
        }
        if let Some(row) = coefficients.iter().find(|row| row.len() != n) {
            return Err(InversionError::configuration(format!(
                "{} stations but {} station coefficients in a location sample",
                n,
                row.len()
            )));
        }

        let samples = coefficients.len();
        let location_ln_probabilities = match location {
            Some(location) if location.len() == samples => {
                let total: f64 = location.probabilities.iter().sum();
                if !(total > 0.) {
                    return Err(InversionError::configuration(
                        "Location probabilities do not sum to a positive value",
                    ));
                }
                location
                    .probabilities
                    .iter()
                    .map(|p| (p / total).ln())
                    .collect()
            }
            Some(location) => {
                return Err(InversionError::configuration(format!(
                    "{} location samples but {} coefficient sets",
                    location.len(),
                    samples
                )))
            }
            None => vec![-(samples as f64).ln(); samples],
        };

        Ok(Self {
            stations: data.stations.clone(),
            observations: data.observations.clone(),
            errors: data.errors.clone(),
            coefficients,
            location_ln_probabilities,
        })
    }

    /// Index pairs of stations present in both datasets.
    ///
    /// Shared stations must appear in the same relative order in both lists,
    /// otherwise paired observations would be matched to the wrong station.
    pub fn shared_stations(&self, other: &PreparedData) -> Result<Vec<(usize, usize)>> {
        let pairs: Vec<(usize, usize)> = self
            .stations
            .iter()
            .enumerate()
            .filter_map(|(i, name)| {
                other
                    .stations
                    .iter()
                    .position(|other_name| other_name == name)
                    .map(|j| (i, j))
            })
            .collect();
        if pairs.windows(2).any(|w| w[1].1 <= w[0].1) {
            return Err(InversionError::configuration(
                "Shared stations of paired events are not in matching order",
            ));
        }
        Ok(pairs)
    }
}
