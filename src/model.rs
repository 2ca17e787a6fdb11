//! DNA substitution models.
//!
//! The likelihood engine consumes a narrow capability interface: the
//! stationary distribution `pi`, the transition matrix `Pr(t)`, and a
//! model-corrected sequence distance. Exactly three reversible models
//! implement it: GTR, HKY85, and F81. The set is closed, so the
//! interface is an enum rather than a trait object.
//!
//! Models serialize to a line-oriented text form whose first line is the
//! model type; [`read_model`] restores them. `Pr(t)` is numerically
//! stable for `t` in `[0, 100]`; behavior outside that range is the
//! caller's responsibility.

use crate::alphabet::DigitalSeq;

use std::fmt::Write as _;

//-----------------------------------------------------------------------------

/// A stationary distribution or a per-state column.
pub type Vector4 = [f64; 4];

/// A row-stochastic 4x4 transition matrix; rows are source states.
pub type Matrix4 = [[f64; 4]; 4];

//-----------------------------------------------------------------------------

/// A DNA substitution model.
#[derive(Clone, Debug, PartialEq)]
pub enum SubModel {
    /// General time-reversible model.
    Gtr(Gtr),
    /// Hasegawa-Kishino-Yano 1985 with a transition/transversion ratio.
    Hky85(Hky85),
    /// Felsenstein 1981, unequal base frequencies.
    F81(F81),
}

impl SubModel {
    /// Returns the name of the model type.
    pub fn model_type(&self) -> &'static str {
        match self {
            SubModel::Gtr(_) => "GTR",
            SubModel::Hky85(_) => "HKY85",
            SubModel::F81(_) => "F81",
        }
    }

    /// Returns the stationary distribution.
    pub fn pi(&self) -> Vector4 {
        match self {
            SubModel::Gtr(model) => model.pi,
            SubModel::Hky85(model) => model.pi,
            SubModel::F81(model) => model.pi,
        }
    }

    /// Returns the transition matrix at time `t`.
    pub fn pr(&self, t: f64) -> Matrix4 {
        match self {
            SubModel::Gtr(model) => model.pr(t),
            SubModel::Hky85(model) => model.pr(t),
            SubModel::F81(model) => model.pr(t),
        }
    }

    /// Returns the model-corrected distance between two aligned
    /// sequences over the window `[start, end]`.
    pub fn sub_dist(&self, a: &DigitalSeq, b: &DigitalSeq, start: usize, end: usize) -> f64 {
        match self {
            SubModel::Gtr(model) => model.sub_dist(a, b, start, end),
            SubModel::Hky85(model) => model.sub_dist(a, b, start, end),
            SubModel::F81(model) => model.sub_dist(a, b, start, end),
        }
    }

    /// Serializes the model into its text form.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{}", self.model_type());
        let pi = self.pi();
        let _ = writeln!(out, "pi: {:.10} {:.10} {:.10} {:.10}", pi[0], pi[1], pi[2], pi[3]);
        match self {
            SubModel::Gtr(model) => {
                let r = &model.rates;
                let _ = writeln!(
                    out, "rate: {:.10} {:.10} {:.10} {:.10} {:.10} {:.10}",
                    r[0], r[1], r[2], r[3], r[4], r[5]
                );
            }
            SubModel::Hky85(model) => {
                let _ = writeln!(out, "kappa: {:.10}", model.kappa);
            }
            SubModel::F81(_) => {}
        }
        out
    }
}

/// Creates a model of the given type with default parameters (uniform
/// base frequencies, unit exchange rates).
///
/// Unknown model types are a hard error.
pub fn create_model(model_type: &str) -> Result<SubModel, String> {
    let uniform = [0.25; 4];
    match model_type {
        "GTR" => Ok(SubModel::Gtr(Gtr::new(uniform, [1.0; 6])?)),
        "HKY85" => Ok(SubModel::Hky85(Hky85::new(uniform, 1.0)?)),
        "F81" => Ok(SubModel::F81(F81::new(uniform)?)),
        _ => Err(format!("Unknown DNA substitution model type: {}", model_type)),
    }
}

/// Parses a model from its text form.
pub fn read_model(text: &str) -> Result<SubModel, String> {
    let mut lines = text.lines().filter(|line| !line.trim().is_empty());
    let model_type = lines.next().ok_or("Empty model description")?.trim();
    let mut pi = [0.25; 4];
    let mut rates = [1.0; 6];
    let mut kappa = 1.0;
    for line in lines {
        let (key, values) = line.split_once(':').ok_or_else(|| {
            format!("Invalid model line: {}", line)
        })?;
        let values: Vec<f64> = values.split_whitespace().map(|v| {
            v.parse().map_err(|_| format!("Invalid model value: {}", v))
        }).collect::<Result<_, String>>()?;
        match key.trim() {
            "pi" => {
                if values.len() != 4 {
                    return Err(format!("Expected 4 base frequencies, got {}", values.len()));
                }
                pi.copy_from_slice(&values);
            }
            "rate" => {
                if values.len() != 6 {
                    return Err(format!("Expected 6 exchange rates, got {}", values.len()));
                }
                rates.copy_from_slice(&values);
            }
            "kappa" => {
                if values.len() != 1 {
                    return Err(String::from("Expected a single kappa value"));
                }
                kappa = values[0];
            }
            key => return Err(format!("Unknown model field: {}", key)),
        }
    }
    match model_type {
        "GTR" => Ok(SubModel::Gtr(Gtr::new(pi, rates)?)),
        "HKY85" => Ok(SubModel::Hky85(Hky85::new(pi, kappa)?)),
        "F81" => Ok(SubModel::F81(F81::new(pi)?)),
        _ => Err(format!("Unknown DNA substitution model type: {}", model_type)),
    }
}

//-----------------------------------------------------------------------------

/// Returns the raw p-distance between two aligned sequences over the
/// window `[start, end]`: the fraction of shared non-gap sites where the
/// residues differ. Returns `0.0` when no sites are shared.
pub fn p_dist(a: &DigitalSeq, b: &DigitalSeq, start: usize, end: usize) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut shared = 0;
    let mut different = 0;
    for j in start..=end.min(a.len().min(b.len()) - 1) {
        if a.get(j) >= 0 && b.get(j) >= 0 {
            shared += 1;
            if a.get(j) != b.get(j) {
                different += 1;
            }
        }
    }
    if shared == 0 { 0.0 } else { different as f64 / shared as f64 }
}

fn validate_pi(pi: &Vector4) -> Result<Vector4, String> {
    let sum: f64 = pi.iter().sum();
    if pi.iter().any(|&p| p <= 0.0) || sum <= 0.0 {
        return Err(format!("Invalid base frequencies: {:?}", pi));
    }
    let mut normalized = *pi;
    for p in normalized.iter_mut() {
        *p /= sum;
    }
    Ok(normalized)
}

// The Tajima-Nei style correction shared by F81 and GTR distances:
// d = -B ln(1 - p / B), with B = 1 - sum(pi^2).
fn pi_corrected_dist(pi: &Vector4, p: f64) -> f64 {
    let b = 1.0 - pi.iter().map(|&x| x * x).sum::<f64>();
    let arg = 1.0 - p / b;
    if arg <= 0.0 { f64::INFINITY } else { -b * arg.ln() }
}

//-----------------------------------------------------------------------------

/// The F81 model: unequal base frequencies, a single exchange rate.
#[derive(Clone, Debug, PartialEq)]
pub struct F81 {
    pi: Vector4,
    // Rate scaling so that the expected substitution rate is 1.
    beta: f64,
}

impl F81 {
    /// Creates the model; the frequencies are normalized to sum to 1.
    pub fn new(pi: Vector4) -> Result<Self, String> {
        let pi = validate_pi(&pi)?;
        let beta = 1.0 / (1.0 - pi.iter().map(|&x| x * x).sum::<f64>());
        Ok(F81 { pi, beta })
    }

    fn pr(&self, t: f64) -> Matrix4 {
        let decay = (-self.beta * t).exp();
        let mut result = [[0.0; 4]; 4];
        for (i, row) in result.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (1.0 - decay) * self.pi[j];
                if i == j {
                    *cell += decay;
                }
            }
        }
        result
    }

    fn sub_dist(&self, a: &DigitalSeq, b: &DigitalSeq, start: usize, end: usize) -> f64 {
        pi_corrected_dist(&self.pi, p_dist(a, b, start, end))
    }
}

//-----------------------------------------------------------------------------

/// The HKY85 model: unequal base frequencies with a transition versus
/// transversion rate ratio `kappa`.
#[derive(Clone, Debug, PartialEq)]
pub struct Hky85 {
    pi: Vector4,
    kappa: f64,
    beta: f64,
}

impl Hky85 {
    /// Creates the model; the frequencies are normalized to sum to 1.
    pub fn new(pi: Vector4, kappa: f64) -> Result<Self, String> {
        if kappa <= 0.0 {
            return Err(format!("Invalid transition/transversion ratio: {}", kappa));
        }
        let pi = validate_pi(&pi)?;
        // A = 0, C = 1, G = 2, T = 3; purines pair A/G, pyrimidines C/T.
        let purines = pi[0] + pi[2];
        let pyrimidines = pi[1] + pi[3];
        let mean_rate = 2.0 * kappa * (pi[0] * pi[2] + pi[1] * pi[3])
            + 2.0 * purines * pyrimidines;
        let beta = 1.0 / mean_rate;
        Ok(Hky85 { pi, kappa, beta })
    }

    fn pr(&self, t: f64) -> Matrix4 {
        let pi = &self.pi;
        let alpha = self.kappa * self.beta;
        let purines = pi[0] + pi[2];
        let pyrimidines = pi[1] + pi[3];
        let decay_tv = (-self.beta * t).exp();
        let decay_r = (-(purines * alpha + pyrimidines * self.beta) * t).exp();
        let decay_y = (-(pyrimidines * alpha + purines * self.beta) * t).exp();

        let is_purine = |state: usize| state == 0 || state == 2;
        let mut result = [[0.0; 4]; 4];
        for (i, row) in result.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                if is_purine(i) == is_purine(j) {
                    let (group, decay) = if is_purine(i) {
                        (purines, decay_r)
                    } else {
                        (pyrimidines, decay_y)
                    };
                    let other = 1.0 - group;
                    let same = if i == j { 1.0 } else { 0.0 };
                    *cell = pi[j] + pi[j] * (other / group) * decay_tv
                        + (same - pi[j] / group) * decay;
                } else {
                    *cell = pi[j] * (1.0 - decay_tv);
                }
            }
        }
        result
    }

    // Kimura-style two-parameter correction from the observed transition
    // and transversion proportions.
    fn sub_dist(&self, a: &DigitalSeq, b: &DigitalSeq, start: usize, end: usize) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let mut shared = 0;
        let mut transitions = 0;
        let mut transversions = 0;
        let is_purine = |code: i8| code == 0 || code == 2;
        for j in start..=end.min(a.len().min(b.len()) - 1) {
            let (x, y) = (a.get(j), b.get(j));
            if x < 0 || y < 0 {
                continue;
            }
            shared += 1;
            if x != y {
                if is_purine(x) == is_purine(y) {
                    transitions += 1;
                } else {
                    transversions += 1;
                }
            }
        }
        if shared == 0 {
            return 0.0;
        }
        let p = transitions as f64 / shared as f64;
        let q = transversions as f64 / shared as f64;
        let first = 1.0 - 2.0 * p - q;
        let second = 1.0 - 2.0 * q;
        if first <= 0.0 || second <= 0.0 {
            return f64::INFINITY;
        }
        -0.5 * first.ln() - 0.25 * second.ln()
    }
}

//-----------------------------------------------------------------------------

/// The general time-reversible model.
///
/// Parameterized by base frequencies and the six exchangeabilities
/// `(AC, AG, AT, CG, CT, GT)`. The transition matrix is computed through
/// the eigendecomposition of the symmetrized rate matrix, so `pr(t)` is
/// a table lookup plus two 4x4 products.
#[derive(Clone, Debug, PartialEq)]
pub struct Gtr {
    pi: Vector4,
    rates: [f64; 6],
    // Eigendecomposition of the symmetrized, normalized rate matrix.
    eigenvalues: Vector4,
    eigenvectors: Matrix4,
    sqrt_pi: Vector4,
}

impl Gtr {
    /// Creates the model; the frequencies are normalized to sum to 1.
    pub fn new(pi: Vector4, rates: [f64; 6]) -> Result<Self, String> {
        if rates.iter().any(|&r| r <= 0.0) {
            return Err(format!("Invalid exchange rates: {:?}", rates));
        }
        let pi = validate_pi(&pi)?;

        // Assemble the rate matrix: q_ij = r_ij * pi_j off the diagonal.
        let mut q = [[0.0; 4]; 4];
        let pair = |i: usize, j: usize| {
            // Upper-triangle order (AC, AG, AT, CG, CT, GT).
            match (i.min(j), i.max(j)) {
                (0, 1) => 0,
                (0, 2) => 1,
                (0, 3) => 2,
                (1, 2) => 3,
                (1, 3) => 4,
                _ => 5,
            }
        };
        for i in 0..4 {
            let mut row_sum = 0.0;
            for j in 0..4 {
                if i != j {
                    q[i][j] = rates[pair(i, j)] * pi[j];
                    row_sum += q[i][j];
                }
            }
            q[i][i] = -row_sum;
        }

        // Normalize the expected substitution rate to 1.
        let scale: f64 = -(0..4).map(|i| pi[i] * q[i][i]).sum::<f64>();
        for row in q.iter_mut() {
            for cell in row.iter_mut() {
                *cell /= scale;
            }
        }

        // Symmetrize with the square roots of the frequencies and
        // decompose; reversibility makes the result exact.
        let mut sqrt_pi = [0.0; 4];
        for (value, &p) in sqrt_pi.iter_mut().zip(pi.iter()) {
            *value = p.sqrt();
        }
        let mut symmetric = [[0.0; 4]; 4];
        for i in 0..4 {
            for j in 0..4 {
                symmetric[i][j] = sqrt_pi[i] * q[i][j] / sqrt_pi[j];
            }
        }
        let (eigenvalues, eigenvectors) = jacobi_eigen(symmetric);

        Ok(Gtr { pi, rates, eigenvalues, eigenvectors, sqrt_pi })
    }

    /// Returns the exchange rates `(AC, AG, AT, CG, CT, GT)`.
    pub fn rates(&self) -> &[f64; 6] {
        &self.rates
    }

    fn pr(&self, t: f64) -> Matrix4 {
        let mut decay = [0.0; 4];
        for (value, &lambda) in decay.iter_mut().zip(self.eigenvalues.iter()) {
            *value = (lambda * t).exp();
        }
        let u = &self.eigenvectors;
        let mut result = [[0.0; 4]; 4];
        for i in 0..4 {
            for j in 0..4 {
                let mut sum = 0.0;
                for k in 0..4 {
                    sum += u[i][k] * u[j][k] * decay[k];
                }
                // Small negative values can appear from round-off.
                result[i][j] = (sum * self.sqrt_pi[j] / self.sqrt_pi[i]).max(0.0);
            }
        }
        result
    }

    fn sub_dist(&self, a: &DigitalSeq, b: &DigitalSeq, start: usize, end: usize) -> f64 {
        pi_corrected_dist(&self.pi, p_dist(a, b, start, end))
    }
}

// Cyclic Jacobi eigendecomposition of a symmetric 4x4 matrix. Returns
// the eigenvalues and the matrix of eigenvectors as columns.
fn jacobi_eigen(mut a: Matrix4) -> (Vector4, Matrix4) {
    let mut v = [[0.0; 4]; 4];
    for (i, row) in v.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    for _ in 0..64 {
        let mut off_diagonal = 0.0;
        for i in 0..4 {
            for j in (i + 1)..4 {
                off_diagonal += a[i][j] * a[i][j];
            }
        }
        if off_diagonal < 1e-30 {
            break;
        }
        for p in 0..4 {
            for q in (p + 1)..4 {
                if a[p][q].abs() < 1e-300 {
                    continue;
                }
                let theta = (a[q][q] - a[p][p]) / (2.0 * a[p][q]);
                let t = theta.signum() / (theta.abs() + (theta * theta + 1.0).sqrt());
                let c = 1.0 / (t * t + 1.0).sqrt();
                let s = t * c;
                for k in 0..4 {
                    let akp = a[k][p];
                    let akq = a[k][q];
                    a[k][p] = c * akp - s * akq;
                    a[k][q] = s * akp + c * akq;
                }
                for k in 0..4 {
                    let apk = a[p][k];
                    let aqk = a[q][k];
                    a[p][k] = c * apk - s * aqk;
                    a[q][k] = s * apk + c * aqk;
                }
                for k in 0..4 {
                    let vkp = v[k][p];
                    let vkq = v[k][q];
                    v[k][p] = c * vkp - s * vkq;
                    v[k][q] = s * vkp + c * vkq;
                }
            }
        }
    }
    let mut eigenvalues = [0.0; 4];
    for (value, i) in eigenvalues.iter_mut().zip(0..4) {
        *value = a[i][i];
    }
    (eigenvalues, v)
}

//-----------------------------------------------------------------------------


//-----------------------------------------------------------------------------
