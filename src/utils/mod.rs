use num_traits::Float;

/// Column-wise standardization to zero mean and unit sample variance.
pub trait Standardize<T: Float> {
    /// Standardizes in place and returns the `(means, standard deviations)` that were removed.
    fn standardize(&mut self) -> anyhow::Result<(Vec<T>, Vec<T>)>;
}

pub trait ZeroVec {
    fn zero_len(&mut self, len: usize);
}

impl<T: Default + Clone> ZeroVec for Vec<T> {
    fn zero_len(&mut self, len: usize) {
        self.clear();
        self.reserve(len);
        self.extend(std::iter::repeat_n(T::default(), len));
    }
}

pub fn mean<T: Float>(values: impl IntoIterator<Item = T>) -> T {
    let mut sum = T::zero();
    let mut n = 0usize;
    for v in values {
        sum = sum + v;
        n += 1;
    }
    if n == 0 {
        return T::nan();
    }
    sum / T::from(n).unwrap_or_else(T::nan)
}

/// Mean and sample standard deviation (`n - 1` denominator).
pub fn mean_and_sd<T: Float>(values: &[T]) -> (T, T) {
    let m = mean(values.iter().copied());
    if values.len() < 2 {
        return (m, T::nan());
    }
    let ss = values
        .iter()
        .fold(T::zero(), |acc, &v| acc + (v - m) * (v - m));
    let denom = T::from(values.len() - 1).unwrap_or_else(T::nan);
    (m, (ss / denom).sqrt())
}

pub fn min_max<T: Float>(values: &[T]) -> Option<(T, T)> {
    let mut iter = values.iter().copied();
    let first = iter.next()?;
    Some(iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v))))
}

pub fn all_finite<T: Float>(values: &[T]) -> bool {
    values.iter().all(|v| v.is_finite())
}

/// Average (1-based) ranks, ties share the mean of the positions they occupy.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = Vec::new();
    ranks.zero_len(values.len());
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && values[order[j + 1]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j) as f64 / 2.0 + 1.0;
        for &idx in &order[i..=j] {
            ranks[idx] = rank;
        }
        i = j + 1;
    }
    ranks
}

/// Golden-section search for the maximizer of a unimodal function on `[lo, hi]`.
pub fn golden_section_max(f: impl Fn(f64) -> f64, lo: f64, hi: f64, tol: f64) -> f64 {
    let ratio = (5f64.sqrt() - 1.0) / 2.0;
    let (mut a, mut b) = (lo, hi);
    let mut c = b - ratio * (b - a);
    let mut d = a + ratio * (b - a);
    let mut fc = f(c);
    let mut fd = f(d);

    while (b - a).abs() > tol {
        if fc >= fd {
            b = d;
            d = c;
            fd = fc;
            c = b - ratio * (b - a);
            fc = f(c);
        } else {
            a = c;
            c = d;
            fc = fd;
            d = a + ratio * (b - a);
            fd = f(d);
        }
    }
    (a + b) / 2.0
}
