#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    n: usize,
    data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(n: usize) -> Self {
        Self {
            n,
            data: vec![0.0; n * n],
        }
    }

    pub fn size(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    pub fn add(&mut self, i: usize, j: usize, value: f64) {
        self.data[i * self.n + j] += value;
    }

    pub fn plus_scaled(&self, other: &Matrix, scale: f64) -> Matrix {
        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a + scale * b)
            .collect();
        Matrix { n: self.n, data }
    }

    pub fn quadratic_form(&self, x: &[f64]) -> f64 {
        let mut total = 0.0;
        for i in 0..self.n {
            let row = &self.data[i * self.n..(i + 1) * self.n];
            let dot: f64 = row.iter().zip(x).map(|(a, b)| a * b).sum();
            total += x[i] * dot;
        }
        total
    }
}

#[derive(Debug, Clone)]
pub struct Cholesky {
    l: Matrix,
}

impl Cholesky {
    pub fn factor(a: &Matrix) -> Option<Self> {
        let n = a.size();
        let mut l = Matrix::zeros(n);

        for i in 0..n {
            for j in 0..=i {
                let mut sum = a.get(i, j);
                for k in 0..j {
                    sum -= l.get(i, k) * l.get(j, k);
                }

                if i == j {
                    if sum <= 0.0 || !sum.is_finite() {
                        return None;
                    }
                    l.data[i * n + j] = sum.sqrt();
                } else {
                    l.data[i * n + j] = sum / l.get(j, j);
                }
            }
        }

        Some(Self { l })
    }

    pub fn forward(&self, b: &[f64]) -> Vec<f64> {
        let n = self.l.size();
        let mut y = vec![0.0; n];
        for i in 0..n {
            let mut sum = b[i];
            for j in 0..i {
                sum -= self.l.get(i, j) * y[j];
            }
            y[i] = sum / self.l.get(i, i);
        }
        y
    }

    // Entries before the first non-zero of `b` stay zero.
    pub fn forward_sparse(&self, b: &[(usize, f64)]) -> Vec<f64> {
        let n = self.l.size();
        let mut y = vec![0.0; n];
        let Some(start) = b.iter().map(|(idx, _)| *idx).min() else {
            return y;
        };
        for &(idx, value) in b {
            y[idx] += value;
        }
        for i in start..n {
            let mut sum = y[i];
            for j in start..i {
                sum -= self.l.get(i, j) * y[j];
            }
            y[i] = sum / self.l.get(i, i);
        }
        y
    }

    pub fn solve(&self, b: &[f64]) -> Vec<f64> {
        let n = self.l.size();
        let y = self.forward(b);
        let mut x = vec![0.0; n];
        for i in (0..n).rev() {
            let mut sum = y[i];
            for j in (i + 1)..n {
                sum -= self.l.get(j, i) * x[j];
            }
            x[i] = sum / self.l.get(i, i);
        }
        x
    }

    pub fn log_det(&self) -> f64 {
        (0..self.l.size()).map(|i| self.l.get(i, i).ln()).sum::<f64>() * 2.0
    }
}
