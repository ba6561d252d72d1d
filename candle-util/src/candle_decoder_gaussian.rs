use crate::candle_aux_layers::FcLayers;
use crate::candle_encoder_gaussian::{MAX_LNVAR, MIN_LNVAR};
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, ModuleT, VarBuilder};

pub struct GaussianDecoderArgs<'a> {
    pub n_input: usize,
    pub n_output: usize,
    pub n_cat_list: &'a [usize],
    pub n_layers: usize,
    pub n_hidden: usize,
    pub dropout_rate: f32,
}

/// `p(x | z, c) = N(mean(z, c), var(z, c))`
pub struct GaussianDecoder {
    n_input: usize,
    n_output: usize,
    fc: FcLayers,
    x_mean: Linear,
    x_lnvar: Linear,
}

impl GaussianDecoder {
    /// Will create a new Gaussian decoder module with these variables:
    ///
    /// * `fc.{}.weight` where {} is the layer index
    /// * `x.mean.weight`
    /// * `x.lnvar.weight`
    pub fn new(args: GaussianDecoderArgs, vs: VarBuilder) -> Result<Self> {
        let fc = FcLayers::new(
            args.n_input,
            args.n_hidden,
            args.n_cat_list,
            args.n_layers,
            args.dropout_rate,
            vs.clone(),
        )?;

        let x_mean = candle_nn::linear(args.n_hidden, args.n_output, vs.pp("x.mean"))?;
        let x_lnvar = candle_nn::linear(args.n_hidden, args.n_output, vs.pp("x.lnvar"))?;

        Ok(Self {
            n_input: args.n_input,
            n_output: args.n_output,
            fc,
            x_mean,
            x_lnvar,
        })
    }
}

impl GaussianDecoderT for GaussianDecoder {
    fn forward_t(&self, z_nk: &Tensor, cats: &[&Tensor], train: bool) -> Result<GaussianParams> {
        let h_nl = self.fc.forward_t(z_nk, cats, train)?;
        let mean = self.x_mean.forward_t(&h_nl, train)?;
        let var = self
            .x_lnvar
            .forward_t(&h_nl, train)?
            .clamp(MIN_LNVAR, MAX_LNVAR)?
            .exp()?;
        Ok(GaussianParams { mean, var })
    }

    fn dim_obs(&self) -> usize {
        self.n_output
    }

    fn dim_latent(&self) -> usize {
        self.n_input
    }
}
