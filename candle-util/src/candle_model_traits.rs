use candle_core::{Result, Tensor};

/// Approximate posterior of a Gaussian latent together with a draw
pub struct GaussianLatent {
    pub mean: Tensor,
    pub var: Tensor,
    pub sample: Tensor,
}

/// Parameters of a diagonal Gaussian
pub struct GaussianParams {
    pub mean: Tensor,
    pub var: Tensor,
}

/// Count-distribution parameters produced by a count decoder
pub struct CountParams {
    /// normalized expression on the simplex (n x d)
    pub scale: Tensor,
    /// `exp(library) * scale` (n x d)
    pub rate: Tensor,
    /// zero-inflation logits (n x d)
    pub dropout: Tensor,
    /// per-cell log-dispersion, only for gene-cell dispersion
    pub log_dispersion: Option<Tensor>,
}

pub trait GaussianEncoderT {
    /// An encoder that spits out Gaussian posterior parameters and a
    /// sample drawn from them
    ///
    /// # Arguments
    /// * `x_nd` - input data (n x d)
    /// * `cats` - categorical covariates, each a `u32` index vector (n)
    /// * `train` - whether to use dropout/batchnorm and sampling or not
    ///
    /// # Returns `GaussianLatent` where `sample == mean` unless `train`
    fn forward_t(&self, x_nd: &Tensor, cats: &[&Tensor], train: bool) -> Result<GaussianLatent>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait GaussianDecoderT {
    /// A decoder mapping latent states (and covariates) to the
    /// parameters of a Gaussian over the output
    fn forward_t(&self, z_nk: &Tensor, cats: &[&Tensor], train: bool) -> Result<GaussianParams>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

pub trait ClassifierT {
    /// Categorical probabilities over labels (n x n_labels)
    fn forward_t(&self, z_nk: &Tensor, train: bool) -> Result<Tensor>;

    fn dim_latent(&self) -> usize;

    fn n_labels(&self) -> usize;
}

pub trait CountDecoderT {
    /// Decode latent states and log-library sizes into count
    /// parameters
    ///
    /// * `z_nk` - latent states (n x k)
    /// * `library_n1` - log library size (n x 1)
    /// * `cats` - categorical covariates, e.g., batch membership
    fn forward_t(
        &self,
        z_nk: &Tensor,
        library_n1: &Tensor,
        cats: &[&Tensor],
        train: bool,
    ) -> Result<CountParams>;

    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;
}

/// First-level inference: `q(z1|x)`, `q(l|x)` and `-log p(x|z1,l)`
pub trait VaeModuleT {
    fn dim_obs(&self) -> usize;

    fn dim_latent(&self) -> usize;

    fn n_batch(&self) -> usize;

    /// posterior of `z1` given `log1p(x)`
    fn encode_z(&self, x_log1p_nd: &Tensor, train: bool) -> Result<GaussianLatent>;

    /// posterior of the log library size given `log1p(x)`
    fn encode_library(&self, x_log1p_nd: &Tensor, train: bool) -> Result<GaussianLatent>;

    /// Negative log-likelihood of counts, one value per observation
    ///
    /// * `x_nd` - raw counts
    /// * `z_nk` - latent states
    /// * `library_n1` - log library size
    /// * `batch_index` - validated `u32` batch vector (n)
    /// * `label_weights` - one-hot or soft label weights (n x K)
    fn reconstruction_loss(
        &self,
        x_nd: &Tensor,
        z_nk: &Tensor,
        library_n1: &Tensor,
        batch_index: Option<&Tensor>,
        label_weights: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor>;

    /// `z1` from counts: a posterior sample when `train`, the posterior
    /// mean otherwise
    fn sample_from_posterior_z(&self, x_nd: &Tensor, train: bool) -> Result<Tensor> {
        let x_log1p_nd = (x_nd + 1.)?.log()?;
        let qz = self.encode_z(&x_log1p_nd, train)?;
        Ok(if train { qz.sample } else { qz.mean })
    }
}
