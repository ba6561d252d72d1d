use crate::candle_aux_layers::FcLayers;
use crate::candle_model_traits::*;
use candle_core::{Result, Tensor};
use candle_nn::{Linear, ModuleT, VarBuilder};

/// log-variance range of the Gaussian heads
pub const MIN_LNVAR: f64 = -8.;
pub const MAX_LNVAR: f64 = 8.;

pub struct GaussianEncoderArgs<'a> {
    pub n_input: usize,
    pub n_output: usize,
    pub n_cat_list: &'a [usize],
    pub n_layers: usize,
    pub n_hidden: usize,
    pub dropout_rate: f32,
}

/// `q(z | x, c) = N(mean(x, c), var(x, c))`
pub struct GaussianEncoder {
    n_input: usize,
    n_output: usize,
    fc: FcLayers,
    z_mean: Linear,
    z_lnvar: Linear,
}

impl GaussianEncoderT for GaussianEncoder {
    fn forward_t(&self, x_nd: &Tensor, cats: &[&Tensor], train: bool) -> Result<GaussianLatent> {
        let h_nl = self.fc.forward_t(x_nd, cats, train)?;
        let mean = self.z_mean.forward_t(&h_nl, train)?;
        let lnvar = self
            .z_lnvar
            .forward_t(&h_nl, train)?
            .clamp(MIN_LNVAR, MAX_LNVAR)?;
        let sample = reparameterize(&mean, &lnvar, train)?;
        Ok(GaussianLatent {
            mean,
            var: lnvar.exp()?,
            sample,
        })
    }

    fn dim_obs(&self) -> usize {
        self.n_input
    }

    fn dim_latent(&self) -> usize {
        self.n_output
    }
}

///
/// z = mu + sigma * eps
/// where eps ~ N(0, 1)
///
/// # Arguments
/// * `z_mean` - mean of Gaussian distribution
/// * `z_lnvar` - log variance of Gaussian distribution
/// * `train` - sample if true; otherwise return the mean
pub fn reparameterize(z_mean: &Tensor, z_lnvar: &Tensor, train: bool) -> Result<Tensor> {
    if train {
        let eps = z_mean.randn_like(0., 1.)?;
        z_mean + (z_lnvar * 0.5)?.exp()?.mul(&eps)?
    } else {
        Ok(z_mean.clone())
    }
}

impl GaussianEncoder {
    /// Will create a new Gaussian encoder module with these variables:
    ///
    /// * `fc.{}.weight` where {} is the layer index
    /// * `z.mean.weight`
    /// * `z.lnvar.weight`
    pub fn new(args: GaussianEncoderArgs, vs: VarBuilder) -> Result<Self> {
        let fc = FcLayers::new(
            args.n_input,
            args.n_hidden,
            args.n_cat_list,
            args.n_layers,
            args.dropout_rate,
            vs.clone(),
        )?;

        let z_mean = candle_nn::linear(args.n_hidden, args.n_output, vs.pp("z.mean"))?;
        let z_lnvar = candle_nn::linear(args.n_hidden, args.n_output, vs.pp("z.lnvar"))?;

        Ok(Self {
            n_input: args.n_input,
            n_output: args.n_output,
            fc,
            z_mean,
            z_lnvar,
        })
    }
}
