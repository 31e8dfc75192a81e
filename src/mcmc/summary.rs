use nalgebra::{DMatrix, DVector};

/// Weighted running accumulator for posterior state summaries.
///
/// Feeds on per-sample smoothed means and covariances; the finished
/// covariance is the within-sample mean plus the between-sample spread
/// (law of total variance). Visit counts and importance weights enter as the
/// weight of each sample, so all sampler variants share this accumulator.
pub struct RunningSummary {
    weight: f64,
    alphahat: DMatrix<f64>,
    vt: Vec<DMatrix<f64>>,
    valpha: Vec<DMatrix<f64>>,
}

impl RunningSummary {
    pub fn new(m: usize, n: usize) -> Self {
        Self {
            weight: 0.0,
            alphahat: DMatrix::zeros(m, n),
            vt: vec![DMatrix::zeros(m, m); n],
            valpha: vec![DMatrix::zeros(m, m); n],
        }
    }

    pub fn update(&mut self, alphahat_i: &DMatrix<f64>, vt_i: &[DMatrix<f64>], weight: f64) {
        if weight <= 0.0 {
            return;
        }
        self.weight += weight;
        let ratio = weight / self.weight;
        let n = self.alphahat.ncols();
        for t in 0..n {
            let old_diff: DVector<f64> =
                alphahat_i.column(t).clone_owned() - self.alphahat.column(t).clone_owned();
            let updated = self.alphahat.column(t) + &old_diff * ratio;
            self.alphahat.set_column(t, &updated);
            let new_diff: DVector<f64> =
                alphahat_i.column(t).clone_owned() - self.alphahat.column(t).clone_owned();
            self.valpha[t] += &old_diff * new_diff.transpose() * weight;
            if !vt_i.is_empty() {
                let vt_diff = &vt_i[t] - &self.vt[t];
                self.vt[t] += vt_diff * ratio;
            }
        }
    }

    /// Weighted mean trajectory and total covariance per time step.
    pub fn finish(self) -> (DMatrix<f64>, Vec<DMatrix<f64>>) {
        let weight = if self.weight > 0.0 { self.weight } else { 1.0 };
        let vt = self
            .vt
            .into_iter()
            .zip(self.valpha)
            .map(|(within, between)| within + between / weight)
            .collect();
        (self.alphahat, vt)
    }
}
