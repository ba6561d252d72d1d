use crate::candle_aux_layers::one_hot;
use crate::candle_data_loader::*;
use crate::candle_inference::TrainConfig;
use crate::candle_model_svaec::*;
use crate::candle_model_traits::*;

use candle_core::{Result, Tensor};
use candle_nn::AdamW;
use candle_nn::Optimizer;
use indicatif::{ProgressBar, ProgressDrawTarget};
use log::info;

/// Per-epoch averages over the minibatches of all cells
#[derive(Default)]
pub struct TrainScores {
    pub elbo: Vec<f32>,
    pub reconstruction: Vec<f32>,
    pub kl: Vec<f32>,
    pub classification: Vec<f32>,
}

pub trait SemiSupervisedT {
    /// Train the stacked model jointly on all and labelled cells
    ///
    /// Each step takes a minibatch of all cells with labels hidden;
    /// with labelled cells, a labelled minibatch adds its own negative
    /// ELBO and `classification_ratio` times the cross entropy of
    /// `q(y | z1)`.
    ///
    /// * `all_cells` - data loader over every cell, labels hidden
    /// * `labelled_cells` - data loader feeding labels
    /// * `variable_map` - parameters to optimize
    /// * `train_config` - training configuration
    fn train_semisupervised<DataL>(
        &self,
        all_cells: &mut DataL,
        labelled_cells: Option<&mut DataL>,
        variable_map: &candle_nn::VarMap,
        train_config: &TrainConfig,
    ) -> anyhow::Result<TrainScores>
    where
        DataL: DataLoader;
}

/// `-mean(sum_k 1{y = k} log q(k | z1))`
pub fn classification_loss(probs_nk: &Tensor, y_n: &Tensor) -> Result<Tensor> {
    let n_labels = probs_nk.dim(1)?;
    let y_nk = one_hot(y_n, n_labels, probs_nk.dtype())?;
    let log_p = probs_nk.clamp(1e-8, 1.)?.log()?;
    y_nk.mul(&log_p)?.sum(1)?.neg()?.mean_all()
}

impl<V, Enc, Dec, Cls> SemiSupervisedT for Svaec<'_, V, Enc, Dec, Cls>
where
    V: VaeModuleT,
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
    Cls: ClassifierT,
{
    fn train_semisupervised<DataL>(
        &self,
        all_cells: &mut DataL,
        mut labelled_cells: Option<&mut DataL>,
        variable_map: &candle_nn::VarMap,
        train_config: &TrainConfig,
    ) -> anyhow::Result<TrainScores>
    where
        DataL: DataLoader,
    {
        let device = &train_config.device;
        let mut adam = AdamW::new_lr(
            variable_map.all_vars(),
            train_config.learning_rate.into(),
        )?;

        let pb = ProgressBar::new(train_config.num_epochs as u64);

        if !train_config.show_progress || train_config.verbose {
            pb.set_draw_target(ProgressDrawTarget::hidden());
        }

        let ratio = train_config.classification_ratio as f64;
        let mut scores = TrainScores::default();

        for epoch in 0..train_config.num_epochs {
            all_cells.shuffle_minibatch(train_config.batch_size)?;
            if let Some(lab) = labelled_cells.as_mut() {
                lab.shuffle_minibatch(train_config.batch_size)?;
            }

            let kl_weight = train_config.kl_weight(epoch);
            let (mut recon_tot, mut kl_tot, mut class_tot) = (0f32, 0f32, 0f32);
            let num_minibatch = all_cells.num_minibatch();

            for b in 0..num_minibatch {
                let mb = all_cells.minibatch_data(b, device)?;
                let out = self.forward(&mb.as_input(), true)?;
                let recon = out.reconstruction.mean_all()?;
                let kl = out.kl_divergence.mean_all()?;
                let mut loss = (&recon + (&kl * kl_weight)?)?;

                if let Some(lab) = labelled_cells.as_mut() {
                    let lb = lab.minibatch_data(b % lab.num_minibatch(), device)?;
                    let out_l = self.forward(&lb.as_input(), true)?;
                    let loss_l = (out_l.reconstruction + (out_l.kl_divergence * kl_weight)?)?
                        .mean_all()?;

                    let y_n = lb
                        .labels
                        .as_ref()
                        .ok_or(anyhow::anyhow!("labelled minibatch without labels"))?;
                    let probs_nk = self.classify(&lb.x, true)?;
                    let class_loss = classification_loss(&probs_nk, y_n)?;
                    class_tot += class_loss.to_scalar::<f32>()?;

                    loss = ((loss + loss_l)? + (class_loss * ratio)?)?;
                }

                adam.backward_step(&loss)?;
                recon_tot += recon.to_scalar::<f32>()?;
                kl_tot += kl.to_scalar::<f32>()?;
            }

            let denom = num_minibatch.max(1) as f32;
            scores.reconstruction.push(recon_tot / denom);
            scores.kl.push(kl_tot / denom);
            scores.elbo.push(-(recon_tot + kl_tot) / denom);
            scores.classification.push(class_tot / denom);
            pb.inc(1);

            if train_config.verbose {
                info!(
                    "[{}] elbo: {}, reconstruction: {}, kl: {} (weight {:.2}), classification: {}",
                    epoch + 1,
                    scores.elbo.last().ok_or(anyhow::anyhow!("elbo"))?,
                    recon_tot / denom,
                    kl_tot / denom,
                    kl_weight,
                    class_tot / denom,
                );
            }
        } // each epoch

        pb.finish_and_clear();
        Ok(scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn cross_entropy_of_confident_predictions() -> Result<()> {
        let dev = Device::Cpu;
        let probs = Tensor::new(&[[1f32, 0.], [0.5, 0.5]], &dev)?;
        let y = Tensor::new(&[0u32, 1], &dev)?;
        let ce = classification_loss(&probs, &y)?.to_scalar::<f32>()?;
        approx::assert_abs_diff_eq!(ce, 0.5 * 2f32.ln(), epsilon = 1e-6);
        Ok(())
    }
}
