//! Forecast model seam.
//!
//! The pipeline treats the model as a pure function `[1, N, F] → [1, N, F]` over normalized
//! `f32` values. Training, file formats and loading live outside this crate; anything that
//! implements `ForecastModel` can be plugged into the engine.

use crate::errors::ModelError;

/// Dense row-major `[batch, time, feature]` tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor3 {
    shape: [usize; 3],
    data: Vec<f32>,
}

impl Tensor3 {
    pub fn zeros(shape: [usize; 3]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.iter().product()],
        }
    }

    pub fn from_vec(shape: [usize; 3], data: Vec<f32>) -> Result<Self, ModelError> {
        let expected = shape.iter().product::<usize>();
        if data.len() != expected {
            return Err(ModelError::Runtime(format!(
                "tensor buffer holds {} values, shape {:?} needs {}",
                data.len(),
                shape,
                expected
            )));
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    fn offset(&self, b: usize, t: usize, f: usize) -> usize {
        (b * self.shape[1] + t) * self.shape[2] + f
    }

    pub fn get(&self, b: usize, t: usize, f: usize) -> f32 {
        self.data[self.offset(b, t, f)]
    }

    pub fn set(&mut self, b: usize, t: usize, f: usize, value: f32) {
        let idx = self.offset(b, t, f);
        self.data[idx] = value;
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }
}

/// A pre-trained, fixed-topology multivariate regression model.
pub trait ForecastModel: Send + Sync {
    fn name(&self) -> &str;

    fn predict(&self, input: &Tensor3) -> Result<Tensor3, ModelError>;
}

/// Returns its input unchanged. Steady-state reference and test double.
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityModel;

impl ForecastModel for IdentityModel {
    fn name(&self) -> &str {
        "identity"
    }

    fn predict(&self, input: &Tensor3) -> Result<Tensor3, ModelError> {
        Ok(input.clone())
    }
}

/// Per-feature least-squares trend over the window, extrapolated from the last sample.
///
/// Output timestep `i` holds the value `i + 1` sampling periods after the newest reading,
/// so with 10-minute readings indices 5/11/17/23 land on +1h/+2h/+3h/+4h.
#[derive(Debug, Clone, Copy)]
pub struct LinearTrendModel {
    /// Fraction of the fitted slope carried forward, in `[0, 1]`.
    pub damping: f32,
}

impl Default for LinearTrendModel {
    fn default() -> Self {
        Self { damping: 0.5 }
    }
}

impl ForecastModel for LinearTrendModel {
    fn name(&self) -> &str {
        "linear-trend"
    }

    fn predict(&self, input: &Tensor3) -> Result<Tensor3, ModelError> {
        let [batch, steps, features] = input.shape();
        if steps == 0 {
            return Err(ModelError::Runtime("empty input window".into()));
        }
        let mut out = Tensor3::zeros(input.shape());
        let damping = self.damping.clamp(0.0, 1.0);

        for b in 0..batch {
            for f in 0..features {
                let series: Vec<f32> = (0..steps).map(|t| input.get(b, t, f)).collect();
                let slope = least_squares_slope(&series) * damping;
                let last = series[steps - 1];
                for t in 0..steps {
                    out.set(b, t, f, last + slope * (t as f32 + 1.0));
                }
            }
        }
        Ok(out)
    }
}

fn least_squares_slope(series: &[f32]) -> f32 {
    let n = series.len() as f32;
    if series.len() < 2 {
        return 0.0;
    }
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = series.iter().sum::<f32>() / n;
    let (mut num, mut den) = (0.0f32, 0.0f32);
    for (i, y) in series.iter().enumerate() {
        let dx = i as f32 - mean_x;
        num += dx * (y - mean_y);
        den += dx * dx;
    }
    if den <= f32::EPSILON { 0.0 } else { num / den }
}
