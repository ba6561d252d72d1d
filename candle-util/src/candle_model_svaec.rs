use crate::candle_aux_layers::one_hot;
use crate::candle_classifier::*;
use crate::candle_decoder_count::{Dispersion, ReconstructionLoss};
use crate::candle_decoder_gaussian::*;
use crate::candle_encoder_gaussian::*;
use crate::candle_label_broadcast::*;
use crate::candle_loss_functions::*;
use crate::candle_model_error::*;
use crate::candle_model_traits::*;
use crate::candle_model_vae::*;

use candle_core::{DType, Tensor};
use candle_nn::VarBuilder;

/// Tolerance on `sum(y_prior) == 1`
pub const PRIOR_SUM_TOL: f64 = 1e-4;

#[derive(Clone, Debug)]
pub struct SvaecConfig {
    pub n_input: usize,
    pub n_batch: usize,
    pub n_labels: usize,
    pub n_hidden: usize,
    pub n_latent: usize,
    pub n_layers: usize,
    pub dropout_rate: f32,
    pub y_prior: Option<Vec<f32>>,
    pub logreg_classifier: bool,
    pub dispersion: Dispersion,
    pub reconstruction_loss: ReconstructionLoss,
}

impl SvaecConfig {
    pub fn new(n_input: usize, n_batch: usize, n_labels: usize) -> Self {
        Self {
            n_input,
            n_batch,
            n_labels,
            n_hidden: 128,
            n_latent: 10,
            n_layers: 1,
            dropout_rate: 0.1,
            y_prior: None,
            logreg_classifier: false,
            dispersion: Dispersion::Gene,
            reconstruction_loss: ReconstructionLoss::Zinb,
        }
    }

    pub fn validate(&self) -> ModelResult<()> {
        if self.n_labels < 2 {
            return Err(ModelError::InvalidConfig(format!(
                "need at least two labels, got {}",
                self.n_labels
            )));
        }
        for (name, value) in [
            ("n_input", self.n_input),
            ("n_latent", self.n_latent),
            ("n_hidden", self.n_hidden),
        ] {
            if value < 1 {
                return Err(ModelError::InvalidConfig(format!("{} must be positive", name)));
            }
        }
        if !(0.0..1.0).contains(&self.dropout_rate) {
            return Err(ModelError::InvalidConfig(format!(
                "dropout rate {} not in [0, 1)",
                self.dropout_rate
            )));
        }
        if let Some(prior) = self.y_prior.as_ref() {
            let prior = prior.iter().map(|&p| p as f64).collect::<Vec<_>>();
            check_label_prior(&prior, self.n_labels)?;
        }
        Ok(())
    }

    /// The label prior, uniform unless given
    pub fn label_prior(&self) -> Vec<f32> {
        match self.y_prior.as_ref() {
            Some(prior) => prior.clone(),
            None => vec![1. / self.n_labels as f32; self.n_labels],
        }
    }
}

fn check_label_prior(prior: &[f64], n_labels: usize) -> ModelResult<()> {
    if prior.len() != n_labels {
        return Err(ModelError::InvalidConfig(format!(
            "label prior has {} entries for {} labels",
            prior.len(),
            n_labels
        )));
    }
    if prior.iter().any(|&p| !(p.is_finite() && p > 0.)) {
        return Err(ModelError::InvalidConfig(
            "label prior must be strictly positive".to_string(),
        ));
    }
    let tot: f64 = prior.iter().sum();
    if (tot - 1.).abs() > PRIOR_SUM_TOL {
        return Err(ModelError::InvalidConfig(format!(
            "label prior sums to {}, not 1",
            tot
        )));
    }
    Ok(())
}

/// All the networks of the stacked model, registered in one `VarMap`
///
/// Variable names:
/// * `vae.z_encoder.*`, `vae.l_encoder.*`, `vae.decoder.*`, `vae.px_r`
/// * `svaec.encoder_z2_z1.*`
/// * `svaec.decoder_z1_z2.*`
/// * `svaec.classifier.*`
pub struct SvaecNetworks {
    pub config: SvaecConfig,
    pub vae: Vae,
    pub encoder_z2_z1: GaussianEncoder,
    pub decoder_z1_z2: GaussianDecoder,
    pub classifier: LabelClassifier,
    y_prior: Tensor,
}

impl SvaecNetworks {
    pub fn new(config: SvaecConfig, vb: VarBuilder) -> ModelResult<Self> {
        config.validate()?;

        let vae = Vae::new(
            VaeArgs {
                n_input: config.n_input,
                n_batch: config.n_batch,
                n_labels: config.n_labels,
                n_hidden: config.n_hidden,
                n_latent: config.n_latent,
                n_layers: config.n_layers,
                dropout_rate: config.dropout_rate,
                dispersion: config.dispersion,
                reconstruction_loss: config.reconstruction_loss,
            },
            vb.pp("vae"),
        )?;

        let vs = vb.pp("svaec");

        let encoder_z2_z1 = GaussianEncoder::new(
            GaussianEncoderArgs {
                n_input: config.n_latent,
                n_output: config.n_latent,
                n_cat_list: &[config.n_labels],
                n_layers: config.n_layers,
                n_hidden: config.n_hidden,
                dropout_rate: config.dropout_rate,
            },
            vs.pp("encoder_z2_z1"),
        )?;

        let decoder_z1_z2 = GaussianDecoder::new(
            GaussianDecoderArgs {
                n_input: config.n_latent,
                n_output: config.n_latent,
                n_cat_list: &[config.n_labels],
                n_layers: config.n_layers,
                n_hidden: config.n_hidden,
                dropout_rate: config.dropout_rate,
            },
            vs.pp("decoder_z1_z2"),
        )?;

        let classifier = if config.logreg_classifier {
            LabelClassifier::LogReg(LogRegClassifier::new(
                config.n_latent,
                config.n_labels,
                vs.pp("classifier"),
            )?)
        } else {
            LabelClassifier::Mlp(Classifier::new(
                config.n_latent,
                config.n_hidden,
                config.n_labels,
                config.n_layers,
                config.dropout_rate,
                vs.pp("classifier"),
            )?)
        };

        let y_prior = Tensor::from_vec(config.label_prior(), config.n_labels, vb.device())?
            .to_dtype(vb.dtype())?;

        Ok(Self {
            config,
            vae,
            encoder_z2_z1,
            decoder_z1_z2,
            classifier,
            y_prior,
        })
    }

    pub fn svaec(
        &self,
    ) -> ModelResult<Svaec<'_, Vae, GaussianEncoder, GaussianDecoder, LabelClassifier>> {
        Svaec::build(
            &self.vae,
            &self.encoder_z2_z1,
            &self.decoder_z1_z2,
            &self.classifier,
            &self.y_prior,
        )
    }
}

/// A minibatch of observations
///
/// * `x` - raw counts (n x d)
/// * `local_l_mean`, `local_l_var` - library-size prior, (n) or (n x 1)
/// * `batch_index` - batch membership (n) or (n x 1)
/// * `y` - labels (n) or (n x 1); `None` for unlabelled data
pub struct SvaecInput<'a> {
    pub x: &'a Tensor,
    pub local_l_mean: &'a Tensor,
    pub local_l_var: &'a Tensor,
    pub batch_index: Option<&'a Tensor>,
    pub y: Option<&'a Tensor>,
}

/// Per-observation terms of the negative ELBO, both (n)
pub struct SvaecLoss {
    pub reconstruction: Tensor,
    pub kl_divergence: Tensor,
}

/// Label-conditioned terms, one value per (possibly broadcast) row
pub struct LabelTerms {
    /// `KL(q(z2 | z1, y) || N(0, 1))`
    pub kl_z2: Tensor,
    /// `-log p(z1 | z2, y)`
    pub nll_z1: Tensor,
}

/// Stacked M1+M2 model
///
/// ```text
/// x  -> (z1, l)           first-level VAE
/// (z1, y) -> z2           q(z2 | z1, y)
/// (z2, y) -> z1           p(z1 | z2, y)
/// z1 -> y                 q(y | z1), used when y is missing
/// ```
///
/// Missing labels are marginalized by dense enumeration over all
/// `n_labels` candidates.
pub struct Svaec<'a, V, Enc, Dec, Cls>
where
    V: VaeModuleT,
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
    Cls: ClassifierT,
{
    pub vae: &'a V,
    pub encoder_z2_z1: &'a Enc,
    pub decoder_z1_z2: &'a Dec,
    pub classifier: &'a Cls,
    y_prior: Tensor,
    n_labels: usize,
}

impl<'a, V, Enc, Dec, Cls> Svaec<'a, V, Enc, Dec, Cls>
where
    V: VaeModuleT,
    Enc: GaussianEncoderT,
    Dec: GaussianDecoderT,
    Cls: ClassifierT,
{
    /// Compose the model from its parts
    ///
    /// * `y_prior` - fixed label prior (n_labels), strictly positive,
    ///   summing to one
    pub fn build(
        vae: &'a V,
        encoder_z2_z1: &'a Enc,
        decoder_z1_z2: &'a Dec,
        classifier: &'a Cls,
        y_prior: &Tensor,
    ) -> ModelResult<Self> {
        let n_labels = classifier.n_labels();
        if n_labels < 2 {
            return Err(ModelError::InvalidConfig(format!(
                "need at least two labels, got {}",
                n_labels
            )));
        }

        let n_latent = vae.dim_latent();
        let dims_ok = encoder_z2_z1.dim_obs() == n_latent
            && decoder_z1_z2.dim_obs() == n_latent
            && classifier.dim_latent() == n_latent
            && encoder_z2_z1.dim_latent() == decoder_z1_z2.dim_latent();
        if !dims_ok {
            return Err(ModelError::InvalidConfig(format!(
                "latent dims differ: z1 {}, encoder {} -> {}, decoder {} -> {}, classifier {}",
                n_latent,
                encoder_z2_z1.dim_obs(),
                encoder_z2_z1.dim_latent(),
                decoder_z1_z2.dim_latent(),
                decoder_z1_z2.dim_obs(),
                classifier.dim_latent()
            )));
        }

        let prior = y_prior
            .flatten_all()?
            .to_dtype(DType::F64)?
            .to_vec1::<f64>()?;
        check_label_prior(&prior, n_labels)?;

        Ok(Self {
            vae,
            encoder_z2_z1,
            decoder_z1_z2,
            classifier,
            y_prior: y_prior.flatten_all()?.detach(),
            n_labels,
        })
    }

    pub fn n_labels(&self) -> usize {
        self.n_labels
    }

    pub fn y_prior(&self) -> &Tensor {
        &self.y_prior
    }

    fn check_counts(&self, x_nd: &Tensor) -> ModelResult<usize> {
        let nn = x_nd.dims().first().copied().unwrap_or(0);
        check_dims2("x", x_nd, nn, self.vae.dim_obs())?;
        validate_counts("x", x_nd)?;
        Ok(nn)
    }

    /// Label probabilities `q(y | z1)` (n x n_labels)
    ///
    /// `z1` is the posterior mean of `q(z1 | x)` unless `train`, in
    /// which case a sample is drawn.
    pub fn classify(&self, x_nd: &Tensor, train: bool) -> ModelResult<Tensor> {
        self.check_counts(x_nd)?;
        let z1 = self.vae.sample_from_posterior_z(x_nd, train)?;
        Ok(self.classifier.forward_t(&z1, train)?)
    }

    /// `q(z2 | z1, y)` and `p(z1 | z2, y)` evaluated on each row
    ///
    /// * `z1s` - first-level latent states, possibly broadcast
    /// * `ys` - `u32` labels, one per row of `z1s`
    pub fn enumerate_label_terms(
        &self,
        z1s: &Tensor,
        ys: &Tensor,
        train: bool,
    ) -> ModelResult<LabelTerms> {
        let qz2 = self.encoder_z2_z1.forward_t(z1s, &[ys], train)?;
        validate_variance("qz2_var", &qz2.var)?;

        let pz1 = self.decoder_z1_z2.forward_t(&qz2.sample, &[ys], train)?;
        validate_variance("pz1_var", &pz1.var)?;

        let kl_z2 = gaussian_kl_standard(&qz2.mean, &qz2.var)?;
        let nll_z1 = gaussian_log_prob(z1s, &pz1.mean, &pz1.var)?.neg()?;
        Ok(LabelTerms { kl_z2, nll_z1 })
    }

    /// Per-observation `(reconstruction, kl_divergence)`
    ///
    /// With labels:
    /// ```text
    /// reconstruction = -log p(x | z1, l) + log q(z1 | x) - log p(z1 | z2, y)
    /// kl_divergence  = KL(q(z2 | z1, y) || p(z2)) + KL(q(l | x) || p(l))
    /// ```
    /// Without labels, the label-conditioned terms are averaged under
    /// `q(y | z1)` and `KL(q(y | z1) || p(y))` joins `kl_divergence`.
    pub fn forward(&self, input: &SvaecInput, train: bool) -> ModelResult<SvaecLoss> {
        let x_nd = input.x;
        let nn = self.check_counts(x_nd)?;

        let local_l_mean = as_column("local_l_mean", input.local_l_mean, nn)?;
        let local_l_var = as_column("local_l_var", input.local_l_var, nn)?;
        validate_variance("local_l_var", &local_l_var)?;

        let batch_n = input
            .batch_index
            .map(|b| categorical_indices("batch_index", b, nn, self.vae.n_batch().max(1)))
            .transpose()?;

        let y_n = input
            .y
            .map(|y| categorical_indices("y", y, nn, self.n_labels))
            .transpose()?;

        let x_log1p_nd = (x_nd + 1.)?.log()?;
        let qz1 = self.vae.encode_z(&x_log1p_nd, train)?;
        validate_variance("qz1_var", &qz1.var)?;
        let ql = self.vae.encode_library(&x_log1p_nd, train)?;
        validate_variance("ql_var", &ql.var)?;

        let (ys, z1s) = broadcast_labels(y_n.as_ref(), &qz1.sample, self.n_labels)?;
        let terms = self.enumerate_label_terms(&z1s, &ys, train)?;

        let ll_z1 = gaussian_log_prob(&qz1.sample, &qz1.mean, &qz1.var)?;
        let kl_l = gaussian_kl_divergence(&ql.mean, &ql.var, &local_l_mean, &local_l_var)?;

        let (reconstruction, kl_divergence) = match y_n.as_ref() {
            Some(y_n) => {
                let y_nk = one_hot(y_n, self.n_labels, qz1.sample.dtype())?;
                let reconst = self.vae.reconstruction_loss(
                    x_nd,
                    &qz1.sample,
                    &ql.sample,
                    batch_n.as_ref(),
                    Some(&y_nk),
                    train,
                )?;
                (
                    reconst.add(&ll_z1)?.add(&terms.nll_z1)?,
                    terms.kl_z2.add(&kl_l)?,
                )
            }
            None => {
                let probs_nk = self.classifier.forward_t(&qz1.sample, train)?;
                let reconst = self.vae.reconstruction_loss(
                    x_nd,
                    &qz1.sample,
                    &ql.sample,
                    batch_n.as_ref(),
                    Some(&probs_nk),
                    train,
                )?;
                let nll_z1 = enumeration_expectation(&terms.nll_z1, &probs_nk, self.n_labels)?;
                let kl_z2 = enumeration_expectation(&terms.kl_z2, &probs_nk, self.n_labels)?;
                let kl_y = categorical_kl(&probs_nk, &self.y_prior.to_dtype(probs_nk.dtype())?)?;
                (
                    reconst.add(&ll_z1)?.add(&nll_z1)?,
                    kl_z2.add(&kl_y)?.add(&kl_l)?,
                )
            }
        };

        validate_finite("reconstruction", &reconstruction)?;
        validate_finite("kl_divergence", &kl_divergence)?;

        Ok(SvaecLoss {
            reconstruction,
            kl_divergence,
        })
    }

    /// `[z1, z2]`, posterior means unless `train`
    ///
    /// Without labels, `z2` is conditioned on the most probable label
    /// under `q(y | z1)`.
    pub fn get_latents(
        &self,
        x_nd: &Tensor,
        y: Option<&Tensor>,
        train: bool,
    ) -> ModelResult<[Tensor; 2]> {
        let nn = self.check_counts(x_nd)?;
        let z1 = self.vae.sample_from_posterior_z(x_nd, train)?;
        let y_n = match y {
            Some(y) => categorical_indices("y", y, nn, self.n_labels)?,
            None => argmax_labels(&self.classifier.forward_t(&z1, train)?)?,
        };
        let qz2 = self.encoder_z2_z1.forward_t(&z1, &[&y_n], train)?;
        let z2 = if train { qz2.sample } else { qz2.mean };
        Ok([z1, z2])
    }
}
