use crate::candle_aux_layers::FcLayers;
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{ops, Linear, ModuleT, VarBuilder};

/// How the negative binomial inverse dispersion is parameterized
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispersion {
    /// one value per gene
    Gene,
    /// one value per gene and batch
    GeneBatch,
    /// one value per gene and label
    GeneLabel,
    /// one value per gene and cell, decoded from the latent state
    GeneCell,
}

/// Count likelihood used for reconstruction
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconstructionLoss {
    /// zero-inflated negative binomial
    Zinb,
    /// negative binomial
    Nb,
}

pub struct CountDecoderArgs<'a> {
    pub n_latent: usize,
    pub n_output: usize,
    pub n_cat_list: &'a [usize],
    pub n_layers: usize,
    pub n_hidden: usize,
    pub dispersion: Dispersion,
}

/// Decoder for counts
///
/// ```text
/// h     = fc(z, c)
/// scale = softmax(W_s h)
/// rate  = exp(library) * scale
/// pi    = W_pi h                 (zero-inflation logits)
/// log r = W_r h                  (gene-cell dispersion only)
/// ```
pub struct CountDecoder {
    n_latent: usize,
    n_output: usize,
    fc: FcLayers,
    px_scale: Linear,
    px_dropout: Linear,
    px_r: Option<Linear>,
}

impl CountDecoder {
    /// Will create these variables:
    /// * `fc.{}.weight` where {} is the layer index
    /// * `px.scale.weight`
    /// * `px.dropout.weight`
    /// * `px.r.weight` (gene-cell dispersion)
    pub fn new(args: CountDecoderArgs, vs: VarBuilder) -> Result<Self> {
        let fc = FcLayers::new(
            args.n_latent,
            args.n_hidden,
            args.n_cat_list,
            args.n_layers,
            0.,
            vs.clone(),
        )?;

        let px_scale = candle_nn::linear(args.n_hidden, args.n_output, vs.pp("px.scale"))?;
        let px_dropout = candle_nn::linear(args.n_hidden, args.n_output, vs.pp("px.dropout"))?;
        let px_r = match args.dispersion {
            Dispersion::GeneCell => Some(candle_nn::linear(
                args.n_hidden,
                args.n_output,
                vs.pp("px.r"),
            )?),
            _ => None,
        };

        Ok(Self {
            n_latent: args.n_latent,
            n_output: args.n_output,
            fc,
            px_scale,
            px_dropout,
            px_r,
        })
    }
}

impl CountDecoderT for CountDecoder {
    fn forward_t(
        &self,
        z_nk: &Tensor,
        library_n1: &Tensor,
        cats: &[&Tensor],
        train: bool,
    ) -> Result<CountParams> {
        let h_nl = self.fc.forward_t(z_nk, cats, train)?;
        let scale = ops::softmax(&self.px_scale.forward_t(&h_nl, train)?, 1)?;
        let rate = library_n1.exp()?.broadcast_mul(&scale)?;
        let dropout = self.px_dropout.forward_t(&h_nl, train)?;
        let log_dispersion = match &self.px_r {
            Some(px_r) => Some(px_r.forward_t(&h_nl, train)?),
            None => None,
        };
        Ok(CountParams {
            scale,
            rate,
            dropout,
            log_dispersion,
        })
    }

    fn dim_obs(&self) -> usize {
        self.n_output
    }

    fn dim_latent(&self) -> usize {
        self.n_latent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn rate_follows_library_size() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

        let dec = CountDecoder::new(
            CountDecoderArgs {
                n_latent: 3,
                n_output: 7,
                n_cat_list: &[2],
                n_layers: 1,
                n_hidden: 8,
                dispersion: Dispersion::GeneCell,
            },
            vb,
        )?;

        let z = Tensor::randn(0f32, 1f32, (4, 3), &dev)?;
        let lib = Tensor::new(&[[0f32], [1.], [2.], [3.]], &dev)?;
        let batch = Tensor::new(&[0u32, 1, 0, 1], &dev)?;
        let px = dec.forward_t(&z, &lib, &[&batch], false)?;

        assert_eq!(px.rate.dims(), &[4, 7]);
        assert!(px.log_dispersion.is_some());

        let scale_sum = px.scale.sum(1)?.to_vec1::<f32>()?;
        let rate_sum = px.rate.sum(1)?.to_vec1::<f32>()?;
        for i in 0..4 {
            approx::assert_abs_diff_eq!(scale_sum[i], 1., epsilon = 1e-5);
            approx::assert_abs_diff_eq!(rate_sum[i], (i as f32).exp(), epsilon = 1e-3);
        }
        Ok(())
    }
}
