use candle_core::{DType, Result, Tensor};
use candle_nn::{BatchNorm, Dropout, Linear, ModuleT, VarBuilder};

/// One-hot encode categorical indices
///
/// * `indices` - `u32` (or integer-valued) vector of length n
/// * `n_cat` - number of categories
/// * `dtype` - output type
///
/// Returns an (n x n_cat) matrix
pub fn one_hot(indices: &Tensor, n_cat: usize, dtype: DType) -> Result<Tensor> {
    let idx = indices.flatten_all()?.to_dtype(DType::U32)?.to_vec1::<u32>()?;
    let nn = idx.len();
    let mut data = vec![0f32; nn * n_cat];
    for (i, &k) in idx.iter().enumerate() {
        let k = k as usize;
        if k >= n_cat {
            candle_core::bail!("category {} out of range [0, {})", k, n_cat);
        }
        data[i * n_cat + k] = 1.;
    }
    Tensor::from_vec(data, (nn, n_cat), indices.device())?.to_dtype(dtype)
}

/// A fully-connected layer that also sees one-hot covariates
struct FcBlock {
    linear: Linear,
    bn: BatchNorm,
    dropout: Dropout,
}

/// build a stack of [Linear -> BatchNorm -> ReLU -> Dropout] blocks;
/// categorical covariates are one-hot encoded and concatenated to the
/// input of every block
pub struct FcLayers {
    blocks: Vec<FcBlock>,
    n_cat_list: Vec<usize>,
    dim_out: usize,
}

impl FcLayers {
    /// Will create parameters:
    /// * `fc.{}.weight`, `fc.{}.bias` where {} is the layer index
    /// * `fc.{}.bn.*`
    ///
    /// # Arguments
    /// * `n_in` - input dimension
    /// * `n_out` - output dimension of every block
    /// * `n_cat_list` - number of categories per covariate; those
    ///   with one or fewer categories are ignored
    /// * `n_layers` - number of blocks
    /// * `dropout_rate` - dropout probability
    pub fn new(
        n_in: usize,
        n_out: usize,
        n_cat_list: &[usize],
        n_layers: usize,
        dropout_rate: f32,
        vs: VarBuilder,
    ) -> Result<Self> {
        let bn_config = candle_nn::BatchNormConfig {
            eps: 1e-3,
            remove_mean: true,
            affine: true,
            momentum: 0.01,
        };

        let n_cat_list = n_cat_list
            .iter()
            .map(|&n| if n > 1 { n } else { 0 })
            .collect::<Vec<_>>();
        let d_cat: usize = n_cat_list.iter().sum();

        let mut blocks = Vec::with_capacity(n_layers);
        let mut prev_dim = n_in;
        for j in 0..n_layers.max(1) {
            let name = format!("fc.{}", j);
            let linear = candle_nn::linear(prev_dim + d_cat, n_out, vs.pp(&name))?;
            let bn = candle_nn::batch_norm(n_out, bn_config, vs.pp(format!("{}.bn", name)))?;
            blocks.push(FcBlock {
                linear,
                bn,
                dropout: Dropout::new(dropout_rate),
            });
            prev_dim = n_out;
        }

        Ok(Self {
            blocks,
            n_cat_list,
            dim_out: n_out,
        })
    }

    pub fn dim_out(&self) -> usize {
        self.dim_out
    }

    fn covariate_design(&self, x_nd: &Tensor, cats: &[&Tensor]) -> Result<Option<Tensor>> {
        if cats.len() != self.n_cat_list.len() {
            candle_core::bail!(
                "expected {} categorical covariates, got {}",
                self.n_cat_list.len(),
                cats.len()
            );
        }

        let onehots = self
            .n_cat_list
            .iter()
            .zip(cats.iter())
            .filter(|(n_cat, _)| **n_cat > 0)
            .map(|(&n_cat, &cat)| one_hot(cat, n_cat, x_nd.dtype()))
            .collect::<Result<Vec<_>>>()?;

        if onehots.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Tensor::cat(&onehots, 1)?))
        }
    }

    pub fn forward_t(&self, x_nd: &Tensor, cats: &[&Tensor], train: bool) -> Result<Tensor> {
        let design = self.covariate_design(x_nd, cats)?;
        let mut h = x_nd.clone();
        for block in self.blocks.iter() {
            if let Some(c) = design.as_ref() {
                h = Tensor::cat(&[&h, c], 1)?;
            }
            h = block.linear.forward_t(&h, train)?;
            h = block.bn.forward_t(&h, train)?;
            h = h.relu()?;
            h = block.dropout.forward_t(&h, train)?;
        }
        Ok(h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::VarMap;

    #[test]
    fn one_hot_rows() -> Result<()> {
        let dev = Device::Cpu;
        let y = Tensor::new(&[2u32, 0, 1], &dev)?;
        let oh = one_hot(&y, 3, DType::F32)?;
        assert_eq!(
            oh.to_vec2::<f32>()?,
            vec![vec![0., 0., 1.], vec![1., 0., 0.], vec![0., 1., 0.]]
        );
        assert!(one_hot(&y, 2, DType::F32).is_err());
        Ok(())
    }

    #[test]
    fn fc_layers_shapes_and_covariates() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);

        let fc = FcLayers::new(5, 8, &[3, 1], 2, 0.1, vb.pp("enc"))?;
        let x = Tensor::randn(0f32, 1f32, (4, 5), &dev)?;
        let c1 = Tensor::new(&[0u32, 1, 2, 1], &dev)?;
        let c2 = Tensor::zeros(4, DType::U32, &dev)?;

        let h = fc.forward_t(&x, &[&c1, &c2], false)?;
        assert_eq!(h.dims(), &[4, 8]);
        assert!(fc.forward_t(&x, &[&c1], false).is_err());
        Ok(())
    }
}
