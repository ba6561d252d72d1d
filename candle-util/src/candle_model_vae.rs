use crate::candle_aux_layers::one_hot;
use crate::candle_decoder_count::*;
use crate::candle_encoder_gaussian::*;
use crate::candle_loss_functions::{log_nb_positive, log_zinb_positive};
use crate::candle_model_traits::*;
use candle_core::{DType, Result, Tensor};
use candle_nn::VarBuilder;

pub struct VaeArgs {
    pub n_input: usize,
    pub n_batch: usize,
    pub n_labels: usize,
    pub n_hidden: usize,
    pub n_latent: usize,
    pub n_layers: usize,
    pub dropout_rate: f32,
    pub dispersion: Dispersion,
    pub reconstruction_loss: ReconstructionLoss,
}

/// First-level VAE on counts
///
/// * `q(z1 | x)` - `z_encoder` on `log1p(x)`
/// * `q(l | x)` - `l_encoder` on `log1p(x)`, one-dimensional
/// * `p(x | z1, l, s)` - ZINB or NB with rate `exp(l) * scale(z1, s)`
///   for batch `s`
pub struct Vae {
    n_input: usize,
    n_latent: usize,
    n_batch: usize,
    n_labels: usize,
    dispersion: Dispersion,
    reconstruction_loss: ReconstructionLoss,
    z_encoder: GaussianEncoder,
    l_encoder: GaussianEncoder,
    decoder: CountDecoder,
    px_r: Option<Tensor>,
}

impl Vae {
    /// Will create these variables:
    /// * `z_encoder.*`, `l_encoder.*`, `decoder.*`
    /// * `px_r` - log inverse dispersion (`gene`: d, `gene-batch`:
    ///   n_batch x d, `gene-label`: n_labels x d)
    pub fn new(args: VaeArgs, vs: VarBuilder) -> Result<Self> {
        let z_encoder = GaussianEncoder::new(
            GaussianEncoderArgs {
                n_input: args.n_input,
                n_output: args.n_latent,
                n_cat_list: &[],
                n_layers: args.n_layers,
                n_hidden: args.n_hidden,
                dropout_rate: args.dropout_rate,
            },
            vs.pp("z_encoder"),
        )?;

        let l_encoder = GaussianEncoder::new(
            GaussianEncoderArgs {
                n_input: args.n_input,
                n_output: 1,
                n_cat_list: &[],
                n_layers: 1,
                n_hidden: args.n_hidden,
                dropout_rate: args.dropout_rate,
            },
            vs.pp("l_encoder"),
        )?;

        let decoder = CountDecoder::new(
            CountDecoderArgs {
                n_latent: args.n_latent,
                n_output: args.n_input,
                n_cat_list: &[args.n_batch],
                n_layers: args.n_layers,
                n_hidden: args.n_hidden,
                dispersion: args.dispersion,
            },
            vs.pp("decoder"),
        )?;

        let init_r = candle_nn::Init::Randn {
            mean: 0.,
            stdev: 1.,
        };

        let px_r = match args.dispersion {
            Dispersion::Gene => Some(vs.get_with_hints((1, args.n_input), "px_r", init_r)?),
            Dispersion::GeneBatch => {
                Some(vs.get_with_hints((args.n_batch.max(1), args.n_input), "px_r", init_r)?)
            }
            Dispersion::GeneLabel => {
                Some(vs.get_with_hints((args.n_labels, args.n_input), "px_r", init_r)?)
            }
            Dispersion::GeneCell => None,
        };

        Ok(Self {
            n_input: args.n_input,
            n_latent: args.n_latent,
            n_batch: args.n_batch,
            n_labels: args.n_labels,
            dispersion: args.dispersion,
            reconstruction_loss: args.reconstruction_loss,
            z_encoder,
            l_encoder,
            decoder,
            px_r,
        })
    }

    pub fn dispersion(&self) -> Dispersion {
        self.dispersion
    }

    /// log inverse dispersion per cell and gene (n x d)
    ///
    /// In `gene-label` mode the weights may be soft, e.g., `q(y | z1)` of
    /// unlabelled cells. Then `exp(w @ px_r)` is a plug-in dispersion at
    /// the probability-weighted log inverse dispersion; the likelihood
    /// evaluated with it is not `E_y[log p(x | z1, l, y)]`.
    fn log_dispersion(
        &self,
        px: &CountParams,
        batch_n: &Tensor,
        label_weights: Option<&Tensor>,
    ) -> Result<Tensor> {
        let shape = px.rate.shape();
        let dtype = px.rate.dtype();
        let nn = px.rate.dim(0)?;
        match (self.dispersion, self.px_r.as_ref()) {
            (Dispersion::Gene, Some(px_r)) => px_r.broadcast_as(shape),
            (Dispersion::GeneBatch, Some(px_r)) => {
                let w_ns = one_hot(batch_n, self.n_batch.max(1), dtype)?;
                w_ns.matmul(px_r)
            }
            (Dispersion::GeneLabel, Some(px_r)) => match label_weights {
                Some(w_nk) if w_nk.dims() == [nn, self.n_labels] => {
                    w_nk.to_dtype(dtype)?.matmul(px_r)
                }
                Some(w_nk) => candle_core::bail!(
                    "label weights {:?} do not match {} cells x {} labels",
                    w_nk.dims(),
                    nn,
                    self.n_labels
                ),
                None => candle_core::bail!("gene-label dispersion needs label weights"),
            },
            (Dispersion::GeneCell, _) => match px.log_dispersion.as_ref() {
                Some(log_r) => Ok(log_r.clone()),
                None => candle_core::bail!("decoder did not produce gene-cell dispersion"),
            },
            (d, None) => candle_core::bail!("missing dispersion parameters for {:?}", d),
        }
    }

    /// Decode count parameters (`scale`, `rate`, `dropout`) and the
    /// resolved inverse dispersion `theta`
    pub fn generative(
        &self,
        z_nk: &Tensor,
        library_n1: &Tensor,
        batch_index: Option<&Tensor>,
        label_weights: Option<&Tensor>,
        train: bool,
    ) -> Result<(CountParams, Tensor)> {
        let batch_n = match batch_index {
            Some(b) => b.flatten_all()?,
            None => Tensor::zeros(z_nk.dim(0)?, DType::U32, z_nk.device())?,
        };
        let px = self
            .decoder
            .forward_t(z_nk, library_n1, &[&batch_n], train)?;
        let theta = self.log_dispersion(&px, &batch_n, label_weights)?.exp()?;
        Ok((px, theta))
    }
}

impl VaeModuleT for Vae {
    fn dim_obs(&self) -> usize {
        self.n_input
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }

    fn n_batch(&self) -> usize {
        self.n_batch
    }

    fn encode_z(&self, x_log1p_nd: &Tensor, train: bool) -> Result<GaussianLatent> {
        self.z_encoder.forward_t(x_log1p_nd, &[], train)
    }

    fn encode_library(&self, x_log1p_nd: &Tensor, train: bool) -> Result<GaussianLatent> {
        self.l_encoder.forward_t(x_log1p_nd, &[], train)
    }

    fn reconstruction_loss(
        &self,
        x_nd: &Tensor,
        z_nk: &Tensor,
        library_n1: &Tensor,
        batch_index: Option<&Tensor>,
        label_weights: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (px, theta) = self.generative(z_nk, library_n1, batch_index, label_weights, train)?;
        let llik = match self.reconstruction_loss {
            ReconstructionLoss::Zinb => log_zinb_positive(x_nd, &px.rate, &theta, &px.dropout)?,
            ReconstructionLoss::Nb => log_nb_positive(x_nd, &px.rate, &theta)?,
        };
        llik.neg()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn build(dispersion: Dispersion, vb: VarBuilder) -> Result<Vae> {
        Vae::new(
            VaeArgs {
                n_input: 12,
                n_batch: 2,
                n_labels: 3,
                n_hidden: 16,
                n_latent: 4,
                n_layers: 1,
                dropout_rate: 0.1,
                dispersion,
                reconstruction_loss: ReconstructionLoss::Zinb,
            },
            vb,
        )
    }

    #[test]
    fn reconstruction_loss_per_observation() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::randn(0f32, 2f32, (5, 12), &dev)?.abs()?.round()?;
        let z = Tensor::randn(0f32, 1f32, (5, 4), &dev)?;
        let lib = Tensor::ones((5, 1), DType::F32, &dev)?;
        let batch = Tensor::new(&[0u32, 1, 1, 0, 1], &dev)?;
        let y = Tensor::new(&[0u32, 2, 1, 1, 0], &dev)?;
        let w = one_hot(&y, 3, DType::F32)?;

        for dispersion in [
            Dispersion::Gene,
            Dispersion::GeneBatch,
            Dispersion::GeneLabel,
            Dispersion::GeneCell,
        ] {
            let varmap = VarMap::new();
            let vae = build(dispersion, VarBuilder::from_varmap(&varmap, DType::F32, &dev))?;
            let loss = vae.reconstruction_loss(&x, &z, &lib, Some(&batch), Some(&w), false)?;
            assert_eq!(loss.dims(), &[5]);
            for v in loss.to_vec1::<f32>()? {
                assert!(v.is_finite(), "{:?}: {}", dispersion, v);
            }
        }
        Ok(())
    }

    #[test]
    fn gene_label_dispersion_requires_weights() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vae = build(
            Dispersion::GeneLabel,
            VarBuilder::from_varmap(&varmap, DType::F32, &dev),
        )?;
        let x = Tensor::zeros((2, 12), DType::F32, &dev)?;
        let z = Tensor::zeros((2, 4), DType::F32, &dev)?;
        let lib = Tensor::zeros((2, 1), DType::F32, &dev)?;
        assert!(vae
            .reconstruction_loss(&x, &z, &lib, None, None, false)
            .is_err());

        let w_wide = Tensor::ones((2, 4), DType::F32, &dev)?;
        assert!(vae
            .reconstruction_loss(&x, &z, &lib, None, Some(&w_wide), false)
            .is_err());

        let w = Tensor::new(&[[0.2f32, 0.3, 0.5], [1., 0., 0.]], &dev)?;
        let loss = vae.reconstruction_loss(&x, &z, &lib, None, Some(&w), false)?;
        assert_eq!(loss.dims(), &[2]);
        Ok(())
    }
}
