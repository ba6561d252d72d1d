//! Dense enumeration over a small discrete latent.
//!
//! When a label is unobserved, every observation is paired with each
//! of the `n_labels` candidate labels so label-conditioned networks
//! can be evaluated in one batched call. Rows are label-major: row
//! `k * n + i` is observation `i` with label `k`.

use candle_core::{DType, Result, Tensor};

/// Enumerate candidate labels
///
/// * `y` - observed labels (n); returned unchanged with `z_nk` if given
/// * `z_nk` - per-observation latent states (n x k)
/// * `n_labels` - number of labels
///
/// Returns `(labels, z)` where, without `y`, `labels` is a `u32`
/// vector `[0]*n ++ [1]*n ++ ...` and `z` is `z_nk` stacked
/// `n_labels` times
pub fn broadcast_labels(
    y: Option<&Tensor>,
    z_nk: &Tensor,
    n_labels: usize,
) -> Result<(Tensor, Tensor)> {
    if let Some(y) = y {
        return Ok((y.clone(), z_nk.clone()));
    }

    let nn = z_nk.dim(0)?;
    let labels = (0..n_labels as u32)
        .flat_map(|k| std::iter::repeat(k).take(nn))
        .collect::<Vec<u32>>();
    let labels = Tensor::from_vec(labels, nn * n_labels, z_nk.device())?;

    let z_rep = Tensor::cat(&vec![z_nk; n_labels], 0)?;
    Ok((labels, z_rep))
}

/// `(n_labels * n,)` label-major values to `(n, n_labels)`
pub fn unbroadcast(values: &Tensor, n_labels: usize) -> Result<Tensor> {
    let ntot = values.elem_count();
    if n_labels == 0 || ntot % n_labels != 0 {
        candle_core::bail!(
            "{} values cannot be split into {} label groups",
            ntot,
            n_labels
        );
    }
    values
        .reshape((n_labels, ntot / n_labels))?
        .t()?
        .contiguous()
}

/// Expectation of label-enumerated values under per-observation
/// label probabilities
///
/// `E[v](i) = sum_k probs(i,k) * v(k * n + i)`
pub fn enumeration_expectation(
    values: &Tensor,
    probs_nk: &Tensor,
    n_labels: usize,
) -> Result<Tensor> {
    unbroadcast(values, n_labels)?.mul(probs_nk)?.sum(1)
}

/// Argmax label per row of a probability matrix, as `u32`
pub fn argmax_labels(probs_nk: &Tensor) -> Result<Tensor> {
    probs_nk.argmax(1)?.to_dtype(DType::U32)
}
