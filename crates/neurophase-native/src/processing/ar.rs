//! Autoregressive modeling via Burg's maximum-entropy method
//!
//! Fits an AR(p) model to a history window by minimizing the combined
//! forward and backward prediction error, building the model up one order at
//! a time. The fitted coefficients feed the forward predictor used to
//! compensate the Hilbert transformer's group delay.

use neurophase_core::error::{ConfigError, ConfigResult};

/// Burg-method AR model fitter.
///
/// Supports a configurable stride so the same fitter can operate on a
/// decimated view of a longer buffer without copying. Each call to
/// [`fit`](ArModeler::fit) is a pure function of the input window; the
/// forward (`pef`) and backward (`per`) prediction-error sequences are reset
/// at the start of every fit.
#[derive(Clone, Debug)]
pub struct ArModeler {
    order: usize,
    input_len: usize,
    stride: usize,
    strided_len: usize,
    per: Vec<f64>,
    pef: Vec<f64>,
    h: Vec<f64>,
}

impl ArModeler {
    /// Create a fitter for windows of `input_len` samples viewed at `stride`.
    ///
    /// # Errors
    ///
    /// Fails if `stride` is zero or the strided view is too short for the
    /// requested order (`order + 1` strided samples are required).
    pub fn new(order: usize, input_len: usize, stride: usize) -> ConfigResult<Self> {
        let mut modeler = Self {
            order: 0,
            input_len: 0,
            stride: 1,
            strided_len: 0,
            per: Vec::new(),
            pef: Vec::new(),
            h: Vec::new(),
        };
        modeler.set_params(order, input_len, stride)?;
        Ok(modeler)
    }

    /// Reconfigure order, window length, and stride.
    ///
    /// # Errors
    ///
    /// Fails without modifying the current configuration if the new
    /// combination is invalid.
    pub fn set_params(&mut self, order: usize, input_len: usize, stride: usize) -> ConfigResult<()> {
        if stride == 0 {
            return Err(ConfigError::InvalidStride { stride });
        }
        let strided_len = Self::strided_length(input_len, stride);
        if order < 1 || strided_len < order + 1 {
            return Err(ConfigError::InvalidArOrder {
                order,
                required: order + 1,
                available: strided_len,
            });
        }

        self.order = order;
        self.input_len = input_len;
        self.stride = stride;
        self.strided_len = strided_len;
        self.h.resize(order - 1, 0.0);
        self.per.resize(strided_len, 0.0);
        self.pef.resize(strided_len, 0.0);
        Ok(())
    }

    /// The configured model order.
    #[must_use]
    pub fn order(&self) -> usize {
        self.order
    }

    /// The configured input window length (before striding).
    #[must_use]
    pub fn input_len(&self) -> usize {
        self.input_len
    }

    /// Fit AR coefficients to `series`, writing `order` values into `coef`.
    ///
    /// Deterministic; does not depend on any previous fit. A degenerate
    /// (flat, zero-variance) input drives the error-sum denominator toward
    /// zero and yields unstable coefficients; the caller is expected to feed
    /// real signal.
    pub fn fit(&mut self, series: &[f64], coef: &mut [f64]) {
        assert_eq!(series.len(), self.input_len, "window length mismatch");
        assert_eq!(coef.len(), self.order, "coefficient length mismatch");

        self.reset_prediction_error();

        for n in 1..=self.order {
            let mut sn = 0.0;
            let mut sd = 0.0;
            let mut jj = self.strided_len - n;

            for j in 0..jj {
                let t1 = series[self.stride * (j + n)] + self.pef[j];
                let t2 = series[self.stride * j] + self.per[j];
                sn -= 2.0 * t1 * t2;
                sd += t1 * t1 + t2 * t2;
            }

            let t1 = sn / sd;
            coef[n - 1] = t1;
            if n != 1 {
                for j in 1..n {
                    self.h[j - 1] = coef[j - 1] + t1 * coef[n - j - 1];
                }
                coef[..(n - 1)].copy_from_slice(&self.h[..(n - 1)]);
                jj -= 1;
            }

            for j in 0..jj {
                self.per[j] += t1 * self.pef[j] + t1 * series[self.stride * (j + n)];
                self.pef[j] = self.pef[j + 1]
                    + t1 * self.per[j + 1]
                    + t1 * series[self.stride * (j + 1)];
            }
        }
    }

    fn reset_prediction_error(&mut self) {
        self.per.iter_mut().for_each(|v| *v = 0.0);
        self.pef.iter_mut().for_each(|v| *v = 0.0);
    }

    fn strided_length(input_len: usize, stride: usize) -> usize {
        (input_len + stride - 1) / stride
    }
}

/// Extrapolate a series forward using fitted AR coefficients.
///
/// `history` is the tail of the modeled series (most recent sample last) at
/// the same stride the model was fitted with; it must hold at least
/// `params.len()` samples. Each predicted sample is a linear combination of
/// the `order` values preceding it, reading from `history` until predictions
/// take over.
pub fn ar_predict(history: &[f64], params: &[f64], out: &mut [f64]) {
    let order = params.len();
    let n = history.len() as isize;
    assert!(history.len() >= order, "history shorter than model order");

    for s in 0..out.len() {
        let mut acc = 0.0;
        for (k, &p) in params.iter().enumerate() {
            let ind = s as isize - 1 - k as isize;
            let prev = if ind < 0 {
                history[(n + ind) as usize]
            } else {
                out[ind as usize]
            };
            acc -= p * prev;
        }
        out[s] = acc;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-noise in [-0.5, 0.5)
    fn noise(seed: &mut u64) -> f64 {
        *seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        ((*seed >> 33) as f64 / f64::from(1u32 << 31)) - 0.5
    }

    #[test]
    fn test_rejects_bad_params() {
        assert!(matches!(
            ArModeler::new(0, 100, 1),
            Err(ConfigError::InvalidArOrder { .. })
        ));
        assert!(matches!(
            ArModeler::new(20, 10, 1),
            Err(ConfigError::InvalidArOrder { .. })
        ));
        assert!(matches!(
            ArModeler::new(2, 100, 0),
            Err(ConfigError::InvalidStride { .. })
        ));
        // 100 samples at stride 8 leaves 13 strided samples: order 12 is the limit
        assert!(ArModeler::new(12, 100, 8).is_ok());
        assert!(ArModeler::new(13, 100, 8).is_err());
    }

    #[test]
    fn test_recovers_ar2_coefficients() {
        // x[n] = 0.5 x[n-1] - 0.3 x[n-2] + small noise
        let (phi1, phi2) = (0.5, -0.3);
        let mut seed = 12345u64;
        let mut series = vec![0.0f64; 2000];
        series[0] = noise(&mut seed);
        series[1] = noise(&mut seed);
        for i in 2..series.len() {
            series[i] = phi1 * series[i - 1] + phi2 * series[i - 2] + noise(&mut seed);
        }

        let mut modeler = ArModeler::new(2, series.len(), 1).unwrap();
        let mut coef = vec![0.0; 2];
        modeler.fit(&series, &mut coef);

        // The predictor convention is x[n] = -sum(coef[k] * x[n-1-k])
        assert!(
            (coef[0] + phi1).abs() < 0.05 * phi1.abs().max(1.0),
            "coef[0] = {}",
            coef[0]
        );
        assert!(
            (coef[1] + phi2).abs() < 0.05 * phi2.abs().max(1.0),
            "coef[1] = {}",
            coef[1]
        );
    }

    #[test]
    fn test_fit_is_pure() {
        let series: Vec<f64> = (0..200)
            .map(|i| (0.1 * i as f64).sin() + 0.3 * (0.37 * i as f64).cos())
            .collect();
        let mut modeler = ArModeler::new(8, series.len(), 1).unwrap();

        let mut first = vec![0.0; 8];
        let mut second = vec![0.0; 8];
        modeler.fit(&series, &mut first);
        modeler.fit(&series, &mut second);
        assert_eq!(first, second);
    }

    #[test]
    fn test_predicts_sinusoid_forward() {
        let fs = 500.0;
        let freq = 6.0;
        let n = 1000;
        let series: Vec<f64> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin())
            .collect();

        let mut modeler = ArModeler::new(20, n, 1).unwrap();
        let mut coef = vec![0.0; 20];
        modeler.fit(&series, &mut coef);

        let mut predicted = vec![0.0; 10];
        ar_predict(&series, &coef, &mut predicted);

        for (s, &p) in predicted.iter().enumerate() {
            let expected =
                (2.0 * std::f64::consts::PI * freq * (n + s) as f64 / fs).sin();
            assert!(
                (p - expected).abs() < 0.05,
                "sample {s}: predicted {p}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_strided_fit_matches_decimated_fit() {
        let fs = 1000.0;
        let freq = 6.0;
        let n = 1000;
        let series: Vec<f64> = (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * freq * i as f64 / fs).sin())
            .collect();
        let decimated: Vec<f64> = series.iter().copied().step_by(2).collect();

        let mut strided = ArModeler::new(10, n, 2).unwrap();
        let mut plain = ArModeler::new(10, decimated.len(), 1).unwrap();

        let mut coef_strided = vec![0.0; 10];
        let mut coef_plain = vec![0.0; 10];
        strided.fit(&series, &mut coef_strided);
        plain.fit(&decimated, &mut coef_plain);

        for (a, b) in coef_strided.iter().zip(&coef_plain) {
            assert!((a - b).abs() < 1e-9);
        }
    }
}
