use nalgebra::{DMatrix, DVector};

/// Everything one layer produced during the last [`Kan::forward`](crate::kan::Kan::forward).
///
/// Per-edge batch matrices are `[batch, out_dim * in_dim]` with edge `(i, j)` at column `j * in_dim + i`.
/// Per-edge statistics are `[out_dim, in_dim]` matrices.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerActivations {
    /// the input value seen by each edge
    pub preacts: DMatrix<f64>,
    /// combined numeric + symbolic output of each edge
    pub postacts: DMatrix<f64>,
    /// numeric output of each edge
    pub postacts_numeric: DMatrix<f64>,
    /// raw spline output of each edge, before masking and scaling
    pub postspline: DMatrix<f64>,
    /// per-output sums of the edge outputs, before the multiplication neurons pair them. `[batch, width_out]`
    pub premult: DMatrix<f64>,
    /// `std(preacts) + 0.1` per edge
    pub input_range: DMatrix<f64>,
    /// `std(postacts) / input_range` per edge
    pub acts_scale: DMatrix<f64>,
    /// `std(postacts_numeric) / input_range` per edge; the regularizer's input
    pub acts_scale_spline: DMatrix<f64>,
}

/// The activations recorded by the last forward pass.
///
/// The cache describes the parameters and masks at the time of that pass; it goes stale as soon as either changes.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivationCache {
    /// the input to the network followed by the output of every layer (after multiplication and bias), `depth + 1` entries
    pub acts: Vec<DMatrix<f64>>,
    /// per-layer detail, `depth` entries
    pub layers: Vec<LayerActivations>,
}

impl ActivationCache {
    /// the per-edge combined scales of every layer
    pub fn acts_scale(&self) -> Vec<&DMatrix<f64>> {
        self.layers.iter().map(|l| &l.acts_scale).collect()
    }

    /// the per-edge numeric scales of every layer
    pub fn acts_scale_spline(&self) -> Vec<&DMatrix<f64>> {
        self.layers.iter().map(|l| &l.acts_scale_spline).collect()
    }
}

/// unbiased standard deviation of every column; zero when there are fewer than two rows
pub(crate) fn column_std(x: &DMatrix<f64>) -> DVector<f64> {
    let n = x.nrows();
    if n < 2 {
        return DVector::zeros(x.ncols());
    }
    DVector::from_fn(x.ncols(), |c, _| {
        let column = x.column(c);
        let mean = column.mean();
        let squares: f64 = column.iter().map(|v| (v - mean) * (v - mean)).sum();
        (squares / (n - 1) as f64).sqrt()
    })
}

/// reshape a flat per-edge vector (index `j * in_dim + i`) into an `[out_dim, in_dim]` matrix
pub(crate) fn edge_matrix(flat: &DVector<f64>, in_dim: usize, out_dim: usize) -> DMatrix<f64> {
    DMatrix::from_fn(out_dim, in_dim, |j, i| flat[j * in_dim + i])
}

impl LayerActivations {
    pub(crate) fn new(
        preacts: DMatrix<f64>,
        postacts: DMatrix<f64>,
        postacts_numeric: DMatrix<f64>,
        postspline: DMatrix<f64>,
        premult: DMatrix<f64>,
        in_dim: usize,
    ) -> Self {
        let out_dim = if in_dim == 0 {
            0
        } else {
            preacts.ncols() / in_dim
        };
        let input_range = edge_matrix(&column_std(&preacts).add_scalar(0.1), in_dim, out_dim);
        let acts_scale =
            edge_matrix(&column_std(&postacts), in_dim, out_dim).component_div(&input_range);
        let acts_scale_spline = edge_matrix(&column_std(&postacts_numeric), in_dim, out_dim)
            .component_div(&input_range);
        LayerActivations {
            preacts,
            postacts,
            postacts_numeric,
            postspline,
            premult,
            input_range,
            acts_scale,
            acts_scale_spline,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use statrs::assert_almost_eq;
    use test_log::test;

    #[test]
    fn test_column_std_is_unbiased() {
        let x = DMatrix::from_column_slice(4, 1, &[1.0, 2.0, 3.0, 4.0]);
        assert_almost_eq!(column_std(&x)[0], (5.0f64 / 3.0).sqrt(), 1e-12);
    }

    #[test]
    fn test_column_std_single_row() {
        let x = DMatrix::from_row_slice(1, 3, &[1.0, 5.0, -2.0]);
        assert!(column_std(&x).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_scales() {
        // one input, two outputs: edge 0 doubles its input, edge 1 is constant
        let preacts = DMatrix::from_row_slice(3, 2, &[0.0, 0.0, 1.0, 1.0, 2.0, 2.0]);
        let postacts = DMatrix::from_row_slice(3, 2, &[0.0, 5.0, 2.0, 5.0, 4.0, 5.0]);
        let activations = LayerActivations::new(
            preacts,
            postacts.clone(),
            postacts,
            DMatrix::zeros(3, 2),
            DMatrix::zeros(3, 2),
            1,
        );
        assert_eq!(activations.acts_scale.shape(), (2, 1));
        assert_almost_eq!(activations.input_range[(0, 0)], 1.1, 1e-12);
        assert_almost_eq!(activations.acts_scale[(0, 0)], 2.0 / 1.1, 1e-12);
        assert_eq!(activations.acts_scale[(1, 0)], 0.0);
        assert_eq!(activations.acts_scale, activations.acts_scale_spline);
    }
}
