use nalgebra::DMatrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    None,
    #[default]
    Varimax,
}

impl Rotation {
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Varimax => "varimax",
        }
    }
}

pub struct RotationResult {
    pub loadings: DMatrix<f64>,
    pub rotation_matrix: DMatrix<f64>,
}

/// Kaiser-normalized varimax.
///
/// Rows are scaled to unit length, the orthogonal matrix is updated from the
/// SVD of the varimax criterion gradient until the criterion stops improving
/// by a relative `eps`, then the row lengths are restored.
pub fn varimax(loadings: &DMatrix<f64>, normalize: bool, eps: f64, max_iter: usize) -> RotationResult {
    let (p, k) = loadings.shape();
    if k < 2 {
        return RotationResult {
            loadings: loadings.clone(),
            rotation_matrix: DMatrix::identity(k, k),
        };
    }

    let scale: Vec<f64> = (0..p)
        .map(|i| {
            let norm = loadings.row(i).norm();
            if normalize && norm > 0.0 {
                norm
            } else {
                1.0
            }
        })
        .collect();
    let x = DMatrix::from_fn(p, k, |i, j| loadings[(i, j)] / scale[i]);

    let mut rotation = DMatrix::<f64>::identity(k, k);
    let mut d = 0.0;
    for _ in 0..max_iter {
        let z = &x * &rotation;
        let col_ss: Vec<f64> = (0..k).map(|j| z.column(j).norm_squared()).collect();
        let target = DMatrix::from_fn(p, k, |i, j| {
            let zij = z[(i, j)];
            zij.powi(3) - zij * col_ss[j] / p as f64
        });
        let b = x.transpose() * target;

        let svd = b.svd(true, true);
        let (Some(u), Some(v_t)) = (svd.u, svd.v_t) else {
            break;
        };
        rotation = u * v_t;

        let d_past = d;
        d = svd.singular_values.sum();
        if d < d_past * (1.0 + eps) {
            break;
        }
    }

    let rotated = &x * &rotation;
    RotationResult {
        loadings: DMatrix::from_fn(p, k, |i, j| rotated[(i, j)] * scale[i]),
        rotation_matrix: rotation,
    }
}

/// Orders factors by decreasing sum of squared loadings and flips each factor
/// so that its loadings sum to a positive value. The same permutation and
/// signs are applied to the columns of `rotation_matrix`.
pub fn sort_and_orient(result: RotationResult) -> RotationResult {
    let RotationResult {
        loadings,
        rotation_matrix,
    } = result;
    let k = loadings.ncols();

    let mut order: Vec<usize> = (0..k).collect();
    let ss: Vec<f64> = (0..k).map(|j| loadings.column(j).norm_squared()).collect();
    order.sort_by(|&a, &b| ss[b].total_cmp(&ss[a]));

    let sign: Vec<f64> = order
        .iter()
        .map(|&j| if loadings.column(j).sum() < 0.0 { -1.0 } else { 1.0 })
        .collect();

    RotationResult {
        loadings: DMatrix::from_fn(loadings.nrows(), k, |i, c| {
            loadings[(i, order[c])] * sign[c]
        }),
        rotation_matrix: DMatrix::from_fn(rotation_matrix.nrows(), k, |i, c| {
            rotation_matrix[(i, order[c])] * sign[c]
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn unrotated() -> DMatrix<f64> {
        // two clusters of variables mixed by a 30 degree rotation
        let simple = DMatrix::from_row_slice(
            6,
            2,
            &[
                0.8, 0.0, 0.7, 0.1, 0.75, 0.05, 0.0, 0.8, 0.1, 0.7, 0.05, 0.75,
            ],
        );
        let angle = std::f64::consts::PI / 6.0;
        let mix = DMatrix::from_row_slice(
            2,
            2,
            &[angle.cos(), -angle.sin(), angle.sin(), angle.cos()],
        );
        simple * mix
    }

    #[test]
    fn test_varimax_preserves_communalities() {
        let l = unrotated();
        let result = varimax(&l, true, 1e-5, 1000);

        for i in 0..l.nrows() {
            assert_abs_diff_eq!(
                l.row(i).norm_squared(),
                result.loadings.row(i).norm_squared(),
                epsilon = 1e-10
            );
        }
        let t = &result.rotation_matrix;
        let identity = t.transpose() * t;
        assert_abs_diff_eq!(identity, DMatrix::identity(2, 2), epsilon = 1e-10);
    }

    #[test]
    fn test_varimax_recovers_simple_structure() {
        let result = sort_and_orient(varimax(&unrotated(), true, 1e-5, 1000));
        let l = &result.loadings;

        // every variable loads mostly on a single factor
        for i in 0..l.nrows() {
            let (big, small) = if l[(i, 0)].abs() > l[(i, 1)].abs() {
                (l[(i, 0)].abs(), l[(i, 1)].abs())
            } else {
                (l[(i, 1)].abs(), l[(i, 0)].abs())
            };
            assert!(small < 0.15, "row {} cross loading {}", i, small);
            assert!(big > 0.65);
        }
        assert!(l.column(0).sum() > 0.0);
        assert!(l.column(1).sum() > 0.0);
    }

    #[test]
    fn test_single_factor_is_untouched() {
        let l = DMatrix::from_column_slice(3, 1, &[0.5, 0.6, 0.7]);
        let result = varimax(&l, true, 1e-5, 1000);
        assert_eq!(result.loadings, l);
        assert_eq!(result.rotation_matrix, DMatrix::identity(1, 1));
    }

    #[test]
    fn test_sort_and_orient() {
        let l = DMatrix::from_row_slice(3, 2, &[0.1, -0.9, 0.2, -0.8, 0.3, 0.0]);
        let result = sort_and_orient(RotationResult {
            loadings: l,
            rotation_matrix: DMatrix::identity(2, 2),
        });

        assert_abs_diff_eq!(result.loadings[(0, 0)], 0.9, epsilon = 1e-12);
        assert_abs_diff_eq!(result.loadings[(0, 1)], 0.1, epsilon = 1e-12);
        assert_abs_diff_eq!(result.rotation_matrix[(1, 0)], -1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(result.rotation_matrix[(0, 1)], 1.0, epsilon = 1e-12);
    }
}
