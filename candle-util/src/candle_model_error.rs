use candle_core::{DType, Tensor};
use thiserror::Error;

/// Errors raised while composing the stacked model's objective.
///
/// Network collaborators speak `candle_core::Result`; anything they
/// raise is carried through `Candle`.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("shape mismatch for {name}: expected {expected}, got {actual}")]
    ShapeMismatch {
        name: &'static str,
        expected: String,
        actual: String,
    },

    #[error("invalid distribution parameter {name}: {message}")]
    InvalidDistributionParameter { name: &'static str, message: String },

    #[error("invalid label {label}: must be an integer in [0, {n_labels})")]
    InvalidLabel { label: f64, n_labels: usize },

    #[error("invalid input {name}: {message}")]
    InvalidInput { name: &'static str, message: String },

    #[error("non-finite value in {name}")]
    NumericInstability { name: &'static str },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type ModelResult<T> = std::result::Result<T, ModelError>;

fn host_values(x: &Tensor) -> candle_core::Result<Vec<f64>> {
    x.flatten_all()?.to_dtype(DType::F64)?.to_vec1::<f64>()
}

fn host_scalar(x: &Tensor) -> candle_core::Result<f64> {
    x.to_dtype(DType::F64)?.to_scalar::<f64>()
}

/// Reduced on the device; only these scalars are read back
struct Summary {
    nan: f64,
    min: f64,
    max: f64,
}

fn summarize(x: &Tensor) -> candle_core::Result<Option<Summary>> {
    if x.elem_count() == 0 {
        return Ok(None);
    }
    let x = x.flatten_all()?;
    let nan = host_scalar(&x.ne(&x)?.to_dtype(DType::F32)?.sum_all()?)?;
    if nan > 0. {
        return Ok(Some(Summary {
            nan,
            min: f64::NAN,
            max: f64::NAN,
        }));
    }
    Ok(Some(Summary {
        nan,
        min: host_scalar(&x.min_all()?)?,
        max: host_scalar(&x.max_all()?)?,
    }))
}

/// Check the leading (row) dimension of `x`
pub fn check_rows(name: &'static str, x: &Tensor, nrows: usize) -> ModelResult<()> {
    let rows = x.dims().first().copied().unwrap_or(0);
    if x.rank() == 0 || rows != nrows {
        return Err(ModelError::ShapeMismatch {
            name,
            expected: format!("{} rows", nrows),
            actual: format!("{:?}", x.dims()),
        });
    }
    Ok(())
}

/// Check that `x` is `(n, d)`
pub fn check_dims2(name: &'static str, x: &Tensor, n: usize, d: usize) -> ModelResult<()> {
    match x.dims() {
        [a, b] if *a == n && *b == d => Ok(()),
        dims => Err(ModelError::ShapeMismatch {
            name,
            expected: format!("[{}, {}]", n, d),
            actual: format!("{:?}", dims),
        }),
    }
}

/// A per-observation column vector is either `(n,)` or `(n, 1)`;
/// returns it as `(n, 1)`
pub fn as_column(name: &'static str, x: &Tensor, n: usize) -> ModelResult<Tensor> {
    match x.dims() {
        [a] if *a == n => Ok(x.reshape((n, 1))?),
        [a, 1] if *a == n => Ok(x.clone()),
        dims => Err(ModelError::ShapeMismatch {
            name,
            expected: format!("[{}] or [{}, 1]", n, n),
            actual: format!("{:?}", dims),
        }),
    }
}

/// Counts must be finite and non-negative
pub fn validate_counts(name: &'static str, x_nd: &Tensor) -> ModelResult<()> {
    let Some(stat) = summarize(x_nd)? else {
        return Ok(());
    };
    if stat.nan > 0. {
        return Err(ModelError::InvalidInput {
            name,
            message: format!("found {} NaN values", stat.nan),
        });
    }
    if !stat.min.is_finite() || !stat.max.is_finite() {
        return Err(ModelError::InvalidInput {
            name,
            message: format!("found infinite values in [{}, {}]", stat.min, stat.max),
        });
    }
    if stat.min < 0. {
        return Err(ModelError::InvalidInput {
            name,
            message: format!("found negative count {}", stat.min),
        });
    }
    Ok(())
}

/// Every variance entry must be finite and strictly positive before
/// a standard deviation is taken from it
pub fn validate_variance(name: &'static str, var: &Tensor) -> ModelResult<()> {
    let Some(stat) = summarize(var)? else {
        return Ok(());
    };
    if stat.nan > 0. || !(stat.min > 0.) || !stat.max.is_finite() {
        return Err(ModelError::InvalidDistributionParameter {
            name,
            message: format!(
                "variance must be finite and positive, found range [{}, {}]",
                stat.min, stat.max
            ),
        });
    }
    Ok(())
}

/// Losses are surfaced as they are; a NaN or Inf is an error
pub fn validate_finite(name: &'static str, x: &Tensor) -> ModelResult<()> {
    if let Some(stat) = summarize(x)? {
        if stat.nan > 0. || !stat.min.is_finite() || !stat.max.is_finite() {
            return Err(ModelError::NumericInstability { name });
        }
    }
    Ok(())
}

/// Convert categorical indices of shape `(n,)` or `(n, 1)` to a `u32`
/// vector of shape `(n,)`, rejecting anything outside `[0, n_cat)`
pub fn categorical_indices(
    name: &'static str,
    y: &Tensor,
    n: usize,
    n_cat: usize,
) -> ModelResult<Tensor> {
    let y = as_column(name, y, n)?.flatten_all()?;
    for v in host_values(&y)? {
        if !(v.is_finite() && v >= 0. && v.fract() == 0. && (v as usize) < n_cat) {
            return Err(ModelError::InvalidLabel {
                label: v,
                n_labels: n_cat,
            });
        }
    }
    Ok(y.to_dtype(DType::U32)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn rejects_negative_and_nan_counts() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1f32, 0.], [2., -1.]], &dev)?;
        assert!(matches!(
            validate_counts("x", &x),
            Err(ModelError::InvalidInput { .. })
        ));

        let x = Tensor::new(&[[1f32, f32::NAN]], &dev)?;
        assert!(matches!(
            validate_counts("x", &x),
            Err(ModelError::InvalidInput { .. })
        ));

        let x = Tensor::new(&[[1f32, 3.]], &dev)?;
        assert!(validate_counts("x", &x).is_ok());
        Ok(())
    }

    #[test]
    fn rejects_non_positive_variance() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let v = Tensor::new(&[[1f32, 0.]], &dev)?;
        assert!(matches!(
            validate_variance("v", &v),
            Err(ModelError::InvalidDistributionParameter { .. })
        ));
        Ok(())
    }

    #[test]
    fn infinite_values_are_caught() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let v = Tensor::new(&[0.5f32, f32::INFINITY], &dev)?;
        assert!(validate_variance("v", &v).is_err());
        assert!(matches!(
            validate_finite("loss", &v),
            Err(ModelError::NumericInstability { name: "loss" })
        ));

        let v = Tensor::new(&[[1f32, f32::NEG_INFINITY]], &dev)?;
        assert!(matches!(
            validate_counts("x", &v),
            Err(ModelError::InvalidInput { .. })
        ));

        let v = Tensor::new(&[0.5f64, f64::NAN, 2.], &dev)?;
        assert!(validate_variance("v", &v).is_err());
        assert!(validate_finite("loss", &v).is_err());

        let v = Tensor::new(&[-3f32, 0., 2.], &dev)?;
        assert!(validate_finite("loss", &v).is_ok());
        Ok(())
    }

    #[test]
    fn label_range_is_enforced() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let y = Tensor::new(&[0u32, 2, 1], &dev)?;
        let y = categorical_indices("y", &y, 3, 3)?;
        assert_eq!(y.to_vec1::<u32>()?, vec![0, 2, 1]);

        let y = Tensor::new(&[0u32, 3, 1], &dev)?;
        assert!(matches!(
            categorical_indices("y", &y, 3, 3),
            Err(ModelError::InvalidLabel { n_labels: 3, .. })
        ));

        let y = Tensor::new(&[[0f32], [1.5]], &dev)?;
        assert!(categorical_indices("y", &y, 2, 3).is_err());
        Ok(())
    }

    #[test]
    fn column_shape_is_checked() -> anyhow::Result<()> {
        let dev = Device::Cpu;
        let l = Tensor::zeros(4, DType::F32, &dev)?;
        assert_eq!(as_column("l", &l, 4)?.dims(), &[4, 1]);
        assert!(matches!(
            as_column("l", &l, 3),
            Err(ModelError::ShapeMismatch { .. })
        ));
        Ok(())
    }
}
