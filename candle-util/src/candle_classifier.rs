use crate::candle_aux_layers::FcLayers;
use crate::candle_model_traits::ClassifierT;
use candle_core::{Result, Tensor};
use candle_nn::{ops, Linear, ModuleT, VarBuilder};

/// Multi-layer classifier: `softmax(W fc(z))`
pub struct Classifier {
    n_input: usize,
    n_labels: usize,
    fc: FcLayers,
    logits: Linear,
}

impl Classifier {
    /// Will create these variables:
    /// * `fc.{}.weight` where {} is the layer index
    /// * `logits.weight`
    pub fn new(
        n_input: usize,
        n_hidden: usize,
        n_labels: usize,
        n_layers: usize,
        dropout_rate: f32,
        vs: VarBuilder,
    ) -> Result<Self> {
        let fc = FcLayers::new(n_input, n_hidden, &[], n_layers, dropout_rate, vs.clone())?;
        let logits = candle_nn::linear(n_hidden, n_labels, vs.pp("logits"))?;
        Ok(Self {
            n_input,
            n_labels,
            fc,
            logits,
        })
    }
}

impl ClassifierT for Classifier {
    fn forward_t(&self, z_nk: &Tensor, train: bool) -> Result<Tensor> {
        let h_nl = self.fc.forward_t(z_nk, &[], train)?;
        ops::softmax(&self.logits.forward_t(&h_nl, train)?, 1)
    }

    fn dim_latent(&self) -> usize {
        self.n_input
    }

    fn n_labels(&self) -> usize {
        self.n_labels
    }
}

/// Multinomial logistic regression: `softmax(W z)`
pub struct LogRegClassifier {
    n_input: usize,
    n_labels: usize,
    logits: Linear,
}

impl LogRegClassifier {
    /// Will create `logits.weight` and `logits.bias`
    pub fn new(n_input: usize, n_labels: usize, vs: VarBuilder) -> Result<Self> {
        let logits = candle_nn::linear(n_input, n_labels, vs.pp("logits"))?;
        Ok(Self {
            n_input,
            n_labels,
            logits,
        })
    }
}

impl ClassifierT for LogRegClassifier {
    fn forward_t(&self, z_nk: &Tensor, train: bool) -> Result<Tensor> {
        ops::softmax(&self.logits.forward_t(z_nk, train)?, 1)
    }

    fn dim_latent(&self) -> usize {
        self.n_input
    }

    fn n_labels(&self) -> usize {
        self.n_labels
    }
}

/// Either classifier, chosen at configuration time
pub enum LabelClassifier {
    Mlp(Classifier),
    LogReg(LogRegClassifier),
}

impl ClassifierT for LabelClassifier {
    fn forward_t(&self, z_nk: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Mlp(c) => c.forward_t(z_nk, train),
            Self::LogReg(c) => c.forward_t(z_nk, train),
        }
    }

    fn dim_latent(&self) -> usize {
        match self {
            Self::Mlp(c) => c.dim_latent(),
            Self::LogReg(c) => c.dim_latent(),
        }
    }

    fn n_labels(&self) -> usize {
        match self {
            Self::Mlp(c) => c.n_labels(),
            Self::LogReg(c) => c.n_labels(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn probabilities_sum_to_one() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

        let z = Tensor::randn(0f32, 1f32, (6, 4), &dev)?;
        let classifiers = [
            LabelClassifier::Mlp(Classifier::new(4, 16, 3, 1, 0.1, vb.pp("mlp"))?),
            LabelClassifier::LogReg(LogRegClassifier::new(4, 3, vb.pp("logreg"))?),
        ];

        for cls in classifiers.iter() {
            let probs = cls.forward_t(&z, false)?;
            assert_eq!(probs.dims(), &[6, 3]);
            for s in probs.sum(1)?.to_vec1::<f32>()? {
                approx::assert_abs_diff_eq!(s, 1., epsilon = 1e-5);
            }
        }
        Ok(())
    }
}
