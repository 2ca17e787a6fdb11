//! Discrete-Gamma rate heterogeneity across alignment sites.
//!
//! Site rates are modeled as a Gamma(alpha, alpha) distribution with
//! mean 1, discretized into `K` equal-probability categories (Yang
//! 1994b). The break points come from the inverse CDF of the chi-squared
//! distribution with `2 * alpha` degrees of freedom, and the
//! representative rate of each category is its conditional mean, so the
//! mean of the `K` rates is 1 by construction.

use serde::{Deserialize, Serialize};

//-----------------------------------------------------------------------------

/// A discretized Gamma(alpha, alpha) rate model with `K` categories.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DiscreteGamma {
    alpha: f64,
    k: usize,
    // Break points between categories; breaks[0] = 0 and breaks[k] is
    // infinite.
    breaks: Vec<f64>,
    // Conditional mean rate of each category.
    rates: Vec<f64>,
}

impl DiscreteGamma {
    /// Creates a model with `k` categories and shape `alpha`.
    pub fn new(k: usize, alpha: f64) -> Result<Self, String> {
        if k == 0 {
            return Err(String::from("The number of rate categories must be positive"));
        }
        if !(alpha > 0.0) {
            return Err(format!("Invalid shape parameter: {}", alpha));
        }
        let mut model = DiscreteGamma { alpha, k, breaks: Vec::new(), rates: Vec::new() };
        model.set_breaks();
        model.set_rates();
        Ok(model)
    }

    /// Returns the number of categories.
    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Returns the shape parameter.
    #[inline]
    pub fn shape(&self) -> f64 {
        self.alpha
    }

    /// Replaces the shape parameter and recomputes the categories.
    pub fn set_shape(&mut self, alpha: f64) -> Result<(), String> {
        if !(alpha > 0.0) {
            return Err(format!("Invalid shape parameter: {}", alpha));
        }
        self.alpha = alpha;
        self.set_breaks();
        self.set_rates();
        Ok(())
    }

    /// Returns the rate of the given category.
    #[inline]
    pub fn rate(&self, category: usize) -> f64 {
        self.rates[category]
    }

    /// Returns all category rates.
    pub fn rates(&self) -> &[f64] {
        &self.rates
    }

    // Category boundaries via the chi-squared approximation: the p-th
    // quantile of Gamma(alpha, alpha) is chi2_quantile(p, 2 alpha) over
    // 2 alpha.
    fn set_breaks(&mut self) {
        self.breaks.clear();
        self.breaks.push(0.0);
        for i in 1..self.k {
            let p = i as f64 / self.k as f64;
            self.breaks.push(chi2_quantile(p, 2.0 * self.alpha) / (2.0 * self.alpha));
        }
        self.breaks.push(f64::INFINITY);
    }

    // The conditional mean of Gamma(a, a) over (b1, b2) relative to the
    // category probability 1/K telescopes through the regularized
    // incomplete gamma at shape a + 1.
    fn set_rates(&mut self) {
        self.rates.clear();
        let a = self.alpha;
        for i in 0..self.k {
            let lower = regularized_gamma_lower(a + 1.0, a * self.breaks[i]);
            let upper = if self.breaks[i + 1].is_infinite() {
                1.0
            } else {
                regularized_gamma_lower(a + 1.0, a * self.breaks[i + 1])
            };
            self.rates.push(self.k as f64 * (upper - lower));
        }
    }
}

/// Estimates the shape parameter from a sample of per-site observed
/// changes using the named method.
///
/// With `"moment"`, the counts are treated as draws from a
/// negative-binomial distribution and the method-of-moments estimator
/// `mean^2 / (variance - mean)` is returned; an under-dispersed sample
/// yields infinity (no detectable rate variation). Unrecognized methods
/// return `0.0` as a sentinel.
pub fn estimate_shape(sample: &[f64], method: &str) -> f64 {
    if method == "moment" {
        estimate_shape_moment(sample)
    } else {
        0.0
    }
}

fn estimate_shape_moment(sample: &[f64]) -> f64 {
    if sample.len() < 2 {
        return f64::INFINITY;
    }
    let n = sample.len() as f64;
    let mean = sample.iter().sum::<f64>() / n;
    let variance = sample.iter().map(|&x| (x - mean) * (x - mean)).sum::<f64>() / (n - 1.0);
    if variance <= mean {
        return f64::INFINITY;
    }
    mean * mean / (variance - mean)
}

//-----------------------------------------------------------------------------

// Special functions. Only what the rate model needs; shapes below 1e-3
// or above 1e3 are outside the useful range of the estimator anyway.

// Lanczos approximation of ln(Gamma(x)) for x > 0.
pub(crate) fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 6] = [
        76.18009172947146,
        -86.50532032941677,
        24.01409824083091,
        -1.231739572450155,
        0.1208650973866179e-2,
        -0.5395239384953e-5,
    ];
    let mut sum = 1.000000000190015;
    for (i, &c) in COEFFS.iter().enumerate() {
        sum += c / (x + 1.0 + i as f64);
    }
    let tmp = x + 5.5;
    let tmp = tmp - (x + 0.5) * tmp.ln();
    -tmp + (2.5066282746310005 * sum / x).ln()
}

/// The regularized lower incomplete gamma function `P(a, x)`.
///
/// Series expansion for `x < a + 1`, continued fraction otherwise.
pub(crate) fn regularized_gamma_lower(a: f64, x: f64) -> f64 {
    if x <= 0.0 {
        return 0.0;
    }
    let log_scale = a * x.ln() - x - ln_gamma(a);
    if x < a + 1.0 {
        // Series: P(a, x) = exp(log_scale) * sum_n x^n / (a)_(n+1).
        let mut term = 1.0 / a;
        let mut sum = term;
        for n in 1..500 {
            term *= x / (a + n as f64);
            sum += term;
            if term.abs() < sum.abs() * 1e-15 {
                break;
            }
        }
        (sum * log_scale.exp()).clamp(0.0, 1.0)
    } else {
        // Modified Lentz continued fraction for Q(a, x).
        const TINY: f64 = 1e-300;
        let mut b = x + 1.0 - a;
        let mut c = 1.0 / TINY;
        let mut d = 1.0 / b;
        let mut h = d;
        for i in 1..500 {
            let an = -(i as f64) * (i as f64 - a);
            b += 2.0;
            d = an * d + b;
            if d.abs() < TINY {
                d = TINY;
            }
            c = b + an / c;
            if c.abs() < TINY {
                c = TINY;
            }
            d = 1.0 / d;
            let delta = d * c;
            h *= delta;
            if (delta - 1.0).abs() < 1e-15 {
                break;
            }
        }
        (1.0 - log_scale.exp() * h).clamp(0.0, 1.0)
    }
}

// Inverse CDF of the chi-squared distribution by bisection on the
// regularized incomplete gamma. Monotonicity makes this robust for the
// full range of shapes the rate model sees.
pub(crate) fn chi2_quantile(p: f64, df: f64) -> f64 {
    debug_assert!((0.0..1.0).contains(&p) && df > 0.0);
    if p <= 0.0 {
        return 0.0;
    }
    let cdf = |x: f64| regularized_gamma_lower(df / 2.0, x / 2.0);
    let mut high = 1.0;
    while cdf(high) < p && high < 1e12 {
        high *= 2.0;
    }
    let mut low = 0.0;
    for _ in 0..200 {
        let mid = 0.5 * (low + high);
        if cdf(mid) < p {
            low = mid;
        } else {
            high = mid;
        }
    }
    0.5 * (low + high)
}

//-----------------------------------------------------------------------------


//-----------------------------------------------------------------------------
