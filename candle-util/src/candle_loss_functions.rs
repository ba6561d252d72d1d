use candle_core::{Result, Tensor};

const LN_2PI: f64 = 1.8378770664093453;

/// Small constant inside the count likelihoods
pub const COUNT_EPS: f64 = 1e-8;

/// KL divergence between two diagonal Gaussians, summed over the
/// last dimension
///
/// KL(q || p) = 0.5 * [ log(vp/vq) + (vq + (mq - mp)^2) / vp - 1 ]
///
/// Prior parameters may be `(n, 1)` and are broadcast.
pub fn gaussian_kl_divergence(
    q_mean: &Tensor,
    q_var: &Tensor,
    p_mean: &Tensor,
    p_var: &Tensor,
) -> Result<Tensor> {
    let log_ratio = p_var.log()?.broadcast_sub(&q_var.log()?)?;
    let sq_diff = q_mean.broadcast_sub(p_mean)?.sqr()?;
    let scaled = q_var.add(&sq_diff)?.broadcast_div(p_var)?;
    ((log_ratio + scaled)? - 1.)?.sum(q_mean.rank() - 1)? * 0.5
}

/// KL(N(mean, var) || N(0, 1)) summed over the last dimension
pub fn gaussian_kl_standard(q_mean: &Tensor, q_var: &Tensor) -> Result<Tensor> {
    let elem = ((q_var + q_mean.sqr()?)? - q_var.log()?)?;
    (elem - 1.)?.sum(q_mean.rank() - 1)? * 0.5
}

/// Log density of diagonal Gaussian, summed over the last dimension
///
/// log N(x; m, v) = -0.5 * [ log(2 pi) + log(v) + (x - m)^2 / v ]
///
pub fn gaussian_log_prob(x: &Tensor, mean: &Tensor, var: &Tensor) -> Result<Tensor> {
    let mahal = x.broadcast_sub(mean)?.sqr()?.broadcast_div(var)?;
    let elem = ((mahal + var.log()?)? + LN_2PI)?;
    elem.sum(x.rank() - 1)? * (-0.5)
}

/// KL divergence between categorical distributions, summed over the
/// last dimension
///
/// KL(p || prior) = sum_k p(k) * log(p(k) / prior(k))
///
/// Terms with `p(k) == 0` contribute zero.
///
/// * `probs_nk` - per-observation probabilities (n x K)
/// * `prior_k` - fixed prior probability vector (K), strictly positive
///
pub fn categorical_kl(probs_nk: &Tensor, prior_k: &Tensor) -> Result<Tensor> {
    let log_p = probs_nk.clamp(1e-30, 1.0)?.log()?;
    let log_ratio = log_p.broadcast_sub(&prior_k.log()?)?;
    probs_nk.mul(&log_ratio)?.sum(probs_nk.rank() - 1)
}

/// Numerically stable softplus: max(x, 0) + log(1 + exp(-|x|))
pub fn softplus(x: &Tensor) -> Result<Tensor> {
    let tail = (x.abs()?.neg()?.exp()? + 1.)?.log()?;
    x.relu()?.add(&tail)
}

/// Fast lgamma approximation for tensors (Paul Mineiro's fastlgamma).
///
/// ```text
/// lgamma(x) ≈ -2.081061466 - x + 0.0833333/(x+3) - log(x*(1+x)*(2+x)) + (2.5+x)*log(x+3)
/// ```
pub fn lgamma_approx(x: &Tensor) -> Result<Tensor> {
    let x_safe = x.clamp(1e-6, f32::MAX as f64)?;

    let x_plus_1 = (&x_safe + 1.0)?;
    let x_plus_2 = (&x_safe + 2.0)?;
    let logterm = ((&x_safe * &x_plus_1)? * &x_plus_2)?.log()?;

    let xp3 = (&x_safe + 3.0)?;
    let recip_term = (xp3.recip()? * 0.0833333)?;
    let mult_term = ((&x_safe + 2.5)? * xp3.log()?)?;

    (((recip_term - 2.081061466)? - &x_safe)? - &logterm)? + &mult_term
}

/// Negative binomial log-likelihood, summed over features
///
/// ```text
/// log NB(x | mu, theta) = theta * (log theta - log(theta + mu))
///                       + x * (log mu - log(theta + mu))
///                       + lgamma(x + theta) - lgamma(theta) - lgamma(x + 1)
/// ```
///
/// * `x_nd` - observed counts
/// * `mu_nd` - mean (rate)
/// * `theta_nd` - inverse dispersion, same shape as `mu_nd`
///
pub fn log_nb_positive(x_nd: &Tensor, mu_nd: &Tensor, theta_nd: &Tensor) -> Result<Tensor> {
    let log_theta_mu_eps = ((theta_nd + mu_nd)? + COUNT_EPS)?.log()?;
    let log_theta_eps = (theta_nd + COUNT_EPS)?.log()?;
    let log_mu_eps = (mu_nd + COUNT_EPS)?.log()?;

    let term_theta = theta_nd.mul(&(log_theta_eps - &log_theta_mu_eps)?)?;
    let term_x = x_nd.mul(&(log_mu_eps - &log_theta_mu_eps)?)?;
    let term_gamma = ((lgamma_approx(&(x_nd + theta_nd)?)? - lgamma_approx(theta_nd)?)?
        - lgamma_approx(&(x_nd + 1.)?)?)?;

    (term_theta + term_x)?
        .add(&term_gamma)?
        .sum(x_nd.rank() - 1)
}

/// Zero-inflated negative binomial log-likelihood, summed over
/// features
///
/// The zero-inflation enters through logits `pi`:
///
/// ```text
/// x == 0 : softplus(-pi + theta * (log theta - log(theta + mu))) - softplus(-pi)
/// x  > 0 : -softplus(-pi) - pi + log NB(x | mu, theta)
/// ```
///
/// * `x_nd` - observed counts
/// * `mu_nd` - mean (rate)
/// * `theta_nd` - inverse dispersion, same shape as `mu_nd`
/// * `pi_nd` - dropout logits
///
pub fn log_zinb_positive(
    x_nd: &Tensor,
    mu_nd: &Tensor,
    theta_nd: &Tensor,
    pi_nd: &Tensor,
) -> Result<Tensor> {
    let softplus_pi = softplus(&pi_nd.neg()?)?;
    let log_theta_eps = (theta_nd + COUNT_EPS)?.log()?;
    let log_theta_mu_eps = ((theta_nd + mu_nd)? + COUNT_EPS)?.log()?;
    let pi_theta_log = (pi_nd.neg()? + theta_nd.mul(&(log_theta_eps - &log_theta_mu_eps)?)?)?;

    let case_zero = (softplus(&pi_theta_log)? - &softplus_pi)?;

    let log_mu_eps = (mu_nd + COUNT_EPS)?.log()?;
    let term_x = x_nd.mul(&(log_mu_eps - &log_theta_mu_eps)?)?;
    let term_gamma = ((lgamma_approx(&(x_nd + theta_nd)?)? - lgamma_approx(theta_nd)?)?
        - lgamma_approx(&(x_nd + 1.)?)?)?;
    let case_non_zero = ((pi_theta_log - &softplus_pi)? + term_x)?.add(&term_gamma)?;

    let dtype = x_nd.dtype();
    let is_zero = x_nd.lt(COUNT_EPS)?.to_dtype(dtype)?;
    let is_non_zero = x_nd.gt(COUNT_EPS)?.to_dtype(dtype)?;

    (is_zero.mul(&case_zero)? + is_non_zero.mul(&case_non_zero)?)?.sum(x_nd.rank() - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    fn to_vec(t: &Tensor) -> Vec<f32> {
        t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
    }

    #[test]
    fn gaussian_kl_is_non_negative() -> Result<()> {
        let dev = Device::Cpu;
        let q_mean = Tensor::randn(0f32, 2f32, (50, 4), &dev)?;
        let q_var = Tensor::randn(0f32, 1f32, (50, 4), &dev)?.exp()?;
        let p_mean = Tensor::randn(0f32, 2f32, (50, 1), &dev)?;
        let p_var = Tensor::randn(0f32, 1f32, (50, 1), &dev)?.exp()?;

        let kl = gaussian_kl_divergence(&q_mean, &q_var, &p_mean, &p_var)?;
        assert_eq!(kl.dims(), &[50]);
        for v in to_vec(&kl) {
            assert!(v >= -1e-5, "KL should be non-negative: {}", v);
        }

        let kl_std = gaussian_kl_standard(&q_mean, &q_var)?;
        for v in to_vec(&kl_std) {
            assert!(v >= -1e-5, "KL should be non-negative: {}", v);
        }
        Ok(())
    }

    #[test]
    fn gaussian_kl_vanishes_on_identical_distributions() -> Result<()> {
        let dev = Device::Cpu;
        let m = Tensor::randn(0f32, 1f32, (3, 5), &dev)?;
        let v = Tensor::randn(0f32, 1f32, (3, 5), &dev)?.exp()?;
        for x in to_vec(&gaussian_kl_divergence(&m, &v, &m, &v)?) {
            assert!(x.abs() < 1e-5);
        }

        let zeros = Tensor::zeros((3, 5), DType::F32, &dev)?;
        let ones = Tensor::ones((3, 5), DType::F32, &dev)?;
        for x in to_vec(&gaussian_kl_standard(&zeros, &ones)?) {
            assert!(x.abs() < 1e-6);
        }
        Ok(())
    }

    #[test]
    fn gaussian_log_prob_at_mean() -> Result<()> {
        let dev = Device::Cpu;
        let m = Tensor::new(&[[0.5f64, -1.0]], &dev)?;
        let v = Tensor::new(&[[1.0f64, 4.0]], &dev)?;
        let lp: Vec<f64> = gaussian_log_prob(&m, &m, &v)?.to_vec1()?;
        let expected = -0.5 * (2. * LN_2PI + 4f64.ln());
        approx::assert_abs_diff_eq!(lp[0], expected, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn categorical_kl_vanishes_at_prior() -> Result<()> {
        let dev = Device::Cpu;
        for k in [2usize, 3, 7] {
            let prior = Tensor::ones(k, DType::F32, &dev)?.affine(1. / k as f64, 0.)?;
            let probs = prior.unsqueeze(0)?.repeat((4, 1))?;
            for x in to_vec(&categorical_kl(&probs, &prior)?) {
                assert_eq!(x, 0.);
            }
        }

        let prior = Tensor::new(&[0.2f32, 0.3, 0.5], &dev)?;
        let probs = Tensor::new(&[[0.2f32, 0.3, 0.5]], &dev)?;
        assert_eq!(to_vec(&categorical_kl(&probs, &prior)?), vec![0.]);
        Ok(())
    }

    #[test]
    fn categorical_kl_handles_zero_mass() -> Result<()> {
        let dev = Device::Cpu;
        let prior = Tensor::new(&[0.5f32, 0.5], &dev)?;
        let probs = Tensor::new(&[[1f32, 0.]], &dev)?;
        let kl = to_vec(&categorical_kl(&probs, &prior)?);
        approx::assert_abs_diff_eq!(kl[0], 2f32.ln(), epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn softplus_is_stable() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[-100f32, 0., 100.], &dev)?;
        let y = to_vec(&softplus(&x)?);
        approx::assert_abs_diff_eq!(y[0], 0., epsilon = 1e-6);
        approx::assert_abs_diff_eq!(y[1], 2f32.ln(), epsilon = 1e-6);
        approx::assert_abs_diff_eq!(y[2], 100., epsilon = 1e-4);
        Ok(())
    }

    #[test]
    fn zinb_without_inflation_approaches_nb() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[0f32, 1., 5., 12.]], &dev)?;
        let mu = Tensor::new(&[[0.5f32, 2., 4., 10.]], &dev)?;
        let theta = Tensor::new(&[[1f32, 2., 3., 5.]], &dev)?;
        let pi = Tensor::full(-30f32, (1, 4), &dev)?;

        let nb = to_vec(&log_nb_positive(&x, &mu, &theta)?);
        let zinb = to_vec(&log_zinb_positive(&x, &mu, &theta, &pi)?);
        assert!(nb[0].is_finite() && nb[0] < 0.);
        approx::assert_abs_diff_eq!(nb[0], zinb[0], epsilon = 1e-3);
        Ok(())
    }

    #[test]
    fn nb_log_likelihood_matches_closed_form() -> Result<()> {
        let dev = Device::Cpu;
        // NB(0 | mu, theta) = (theta / (theta + mu))^theta
        let x = Tensor::new(&[[0f32]], &dev)?;
        let mu = Tensor::new(&[[2f32]], &dev)?;
        let theta = Tensor::new(&[[3f32]], &dev)?;
        let lp = to_vec(&log_nb_positive(&x, &mu, &theta)?);
        let expected = 3. * (3f32 / 5.).ln();
        approx::assert_abs_diff_eq!(lp[0], expected, epsilon = 5e-2);
        Ok(())
    }
}
