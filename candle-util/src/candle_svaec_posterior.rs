use crate::candle_data_loader::CountData;
use crate::candle_label_broadcast::argmax_labels;
use crate::candle_model_svaec::Svaec;
use crate::candle_model_traits::*;

use candle_core::{Device, Tensor};
use log::debug;

fn blocks(ntot: usize, block_size: usize) -> impl Iterator<Item = Vec<usize>> {
    let block_size = block_size.max(1);
    (0..ntot)
        .step_by(block_size)
        .map(move |lb| (lb..(lb + block_size).min(ntot)).collect())
}

/// Classifier output `q(y | z1)` for every cell (n x n_labels),
/// evaluation mode
pub fn label_probabilities<V, Enc, Dec, Cls>(
    model: &Svaec<'_, V, Enc, Dec, Cls>,
    data: &CountData,
    device: &Device,
    block_size: usize,
) -> anyhow::Result<Tensor>
where
    V: VaeModuleT,
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
    Cls: ClassifierT,
{
    let mut probs = vec![];
    for rows in blocks(data.num_cells(), block_size) {
        let mb = data.take_rows(&rows, false, device)?;
        probs.push(model.classify(&mb.x, false)?.to_device(&Device::Cpu)?);
    }
    Ok(Tensor::cat(&probs, 0)?)
}

/// Posterior means `(z1, z2)` for every cell, evaluation mode
///
/// `z2` is conditioned on the observed label where there is one and
/// on the most probable label otherwise.
pub fn latent_states<V, Enc, Dec, Cls>(
    model: &Svaec<'_, V, Enc, Dec, Cls>,
    data: &CountData,
    device: &Device,
    block_size: usize,
) -> anyhow::Result<(Tensor, Tensor)>
where
    V: VaeModuleT,
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
    Cls: ClassifierT,
{
    let (mut z1_vec, mut z2_vec) = (vec![], vec![]);
    for rows in blocks(data.num_cells(), block_size) {
        let mb = data.take_rows(&rows, false, device)?;
        let guess = argmax_labels(&model.classify(&mb.x, false)?)?.to_vec1::<u32>()?;
        let y = rows
            .iter()
            .zip(guess)
            .map(|(&r, k)| data.labels()[r].unwrap_or(k))
            .collect::<Vec<_>>();
        let y = Tensor::from_vec(y, rows.len(), device)?;
        let [z1, z2] = model.get_latents(&mb.x, Some(&y), false)?;
        debug!("latent states of {} cells", rows.len());
        z1_vec.push(z1.to_device(&Device::Cpu)?);
        z2_vec.push(z2.to_device(&Device::Cpu)?);
    }
    Ok((Tensor::cat(&z1_vec, 0)?, Tensor::cat(&z2_vec, 0)?))
}

/// Most probable label of each row
pub fn predicted_labels(probs_nk: &Tensor) -> anyhow::Result<Vec<u32>> {
    Ok(argmax_labels(probs_nk)?.to_vec1::<u32>()?)
}

/// Fraction of labelled cells predicted correctly; `None` without
/// labelled cells
pub fn accuracy(predicted: &[u32], labels: &[Option<u32>]) -> Option<f32> {
    let (hit, tot) = predicted
        .iter()
        .zip(labels)
        .filter_map(|(p, y)| y.map(|y| (*p == y) as usize))
        .fold((0, 0), |(hit, tot), h| (hit + h, tot + 1));
    (tot > 0).then(|| hit as f32 / tot as f32)
}
