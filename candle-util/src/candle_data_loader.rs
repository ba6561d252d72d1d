use crate::candle_model_svaec::SvaecInput;

use anyhow::anyhow;
use candle_core::{DType, Device, Tensor};
use rand::prelude::SliceRandom;
use rayon::prelude::*;

/// Floor on the per-batch variance of log library sizes
pub const MIN_LIBRARY_VAR: f32 = 1e-4;

/// Count matrix with per-cell batch membership and partial labels
///
/// Counts are kept on the host; minibatches are copied to the target
/// device on request.
pub struct CountData {
    x_nd: Tensor,
    batch: Vec<u32>,
    labels: Vec<Option<u32>>,
    n_batch: usize,
    n_labels: usize,
    local_l_mean: Vec<f32>,
    local_l_var: Vec<f32>,
}

impl CountData {
    /// * `x_nd` - cells x genes count matrix
    /// * `batch` - batch index per cell (all zero if `None`)
    /// * `labels` - label per cell, `None` where unobserved
    /// * `n_labels` - number of labels (categories)
    pub fn new(
        x_nd: Tensor,
        batch: Option<Vec<u32>>,
        labels: Option<Vec<Option<u32>>>,
        n_labels: usize,
    ) -> anyhow::Result<Self> {
        let x_nd = x_nd.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
        let (nn, _) = x_nd.dims2()?;

        let values = x_nd.flatten_all()?.to_vec1::<f32>()?;
        if values.iter().any(|v| !v.is_finite() || *v < 0.) {
            return Err(anyhow!("counts must be finite and non-negative"));
        }

        let batch = batch.unwrap_or_else(|| vec![0; nn]);
        if batch.len() != nn {
            return Err(anyhow!("{} batch indexes for {} cells", batch.len(), nn));
        }
        let n_batch = batch.iter().map(|&b| b as usize + 1).max().unwrap_or(1);

        let labels = labels.unwrap_or_else(|| vec![None; nn]);
        if labels.len() != nn {
            return Err(anyhow!("{} labels for {} cells", labels.len(), nn));
        }
        if let Some(k) = labels.iter().flatten().find(|&&k| k as usize >= n_labels) {
            return Err(anyhow!("label {} out of range [0, {})", k, n_labels));
        }

        let (local_l_mean, local_l_var) = library_size_priors(&x_nd, &batch, n_batch)?;

        Ok(Self {
            x_nd,
            batch,
            labels,
            n_batch,
            n_labels,
            local_l_mean,
            local_l_var,
        })
    }

    pub fn num_cells(&self) -> usize {
        self.batch.len()
    }

    pub fn num_genes(&self) -> usize {
        self.x_nd.dims()[1]
    }

    pub fn n_batch(&self) -> usize {
        self.n_batch
    }

    pub fn n_labels(&self) -> usize {
        self.n_labels
    }

    pub fn labels(&self) -> &[Option<u32>] {
        &self.labels
    }

    pub fn labelled_cells(&self) -> Vec<usize> {
        self.labels
            .iter()
            .enumerate()
            .filter_map(|(i, y)| y.map(|_| i))
            .collect()
    }

    /// Local library-size prior `(mean, var)` of each cell
    pub fn library_size_priors(&self) -> (&[f32], &[f32]) {
        (&self.local_l_mean, &self.local_l_var)
    }

    /// Gather cells into a minibatch on `target_device`
    ///
    /// * `rows` - cell indexes
    /// * `feed_labels` - attach labels; every cell must be labelled
    pub fn take_rows(
        &self,
        rows: &[usize],
        feed_labels: bool,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let nn = rows.len();
        if let Some(r) = rows.iter().find(|&&r| r >= self.num_cells()) {
            return Err(anyhow!("invalid cell {} vs. total # = {}", r, self.num_cells()));
        }

        let idx = rows.iter().map(|&r| r as u32).collect::<Vec<_>>();
        let idx = Tensor::from_vec(idx, nn, &Device::Cpu)?;
        let x = self.x_nd.index_select(&idx, 0)?.to_device(target_device)?;

        let batch = rows.iter().map(|&r| self.batch[r]).collect::<Vec<_>>();
        let batch_index = Tensor::from_vec(batch, nn, target_device)?;

        let l_mean = rows.iter().map(|&r| self.local_l_mean[r]).collect::<Vec<_>>();
        let l_var = rows.iter().map(|&r| self.local_l_var[r]).collect::<Vec<_>>();
        let local_l_mean = Tensor::from_vec(l_mean, (nn, 1), target_device)?;
        let local_l_var = Tensor::from_vec(l_var, (nn, 1), target_device)?;

        let labels = if feed_labels {
            let y = rows
                .iter()
                .map(|&r| self.labels[r].ok_or(anyhow!("cell {} is not labelled", r)))
                .collect::<anyhow::Result<Vec<u32>>>()?;
            Some(Tensor::from_vec(y, nn, target_device)?)
        } else {
            None
        };

        Ok(MinibatchData {
            x,
            batch_index,
            labels,
            local_l_mean,
            local_l_var,
        })
    }
}

/// Per batch, mean and variance of `log(sum_g x)` over the cells of
/// that batch, assigned back to each cell
fn library_size_priors(
    x_nd: &Tensor,
    batch: &[u32],
    n_batch: usize,
) -> anyhow::Result<(Vec<f32>, Vec<f32>)> {
    let lib_size = x_nd.sum(1)?.to_vec1::<f32>()?;
    if let Some(i) = lib_size.iter().position(|&s| s <= 0.) {
        return Err(anyhow!("cell {} has no counts", i));
    }
    let log_lib = lib_size.iter().map(|s| s.ln()).collect::<Vec<_>>();

    let stats = (0..n_batch)
        .into_par_iter()
        .map(|b| {
            let v = log_lib
                .iter()
                .zip(batch)
                .filter_map(|(&l, &s)| (s as usize == b).then_some(l))
                .collect::<Vec<_>>();
            if v.is_empty() {
                return (0., 1.);
            }
            let n = v.len() as f32;
            let mean = v.iter().sum::<f32>() / n;
            let var = v.iter().map(|l| (l - mean).powi(2)).sum::<f32>() / n;
            (mean, var.max(MIN_LIBRARY_VAR))
        })
        .collect::<Vec<_>>();

    Ok(batch
        .iter()
        .map(|&b| stats[b as usize])
        .unzip())
}

pub struct MinibatchData {
    pub x: Tensor,
    pub batch_index: Tensor,
    pub labels: Option<Tensor>,
    pub local_l_mean: Tensor,
    pub local_l_var: Tensor,
}

impl MinibatchData {
    pub fn as_input(&self) -> SvaecInput<'_> {
        SvaecInput {
            x: &self.x,
            local_l_mean: &self.local_l_mean,
            local_l_var: &self.local_l_var,
            batch_index: Some(&self.batch_index),
            y: self.labels.as_ref(),
        }
    }
}

/// `DataLoader` for minibatch learning
pub trait DataLoader {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData>;

    fn num_minibatch(&self) -> usize;

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()>;
}

///
/// A data loader over a subset of cells in `CountData`, either
/// feeding their labels or hiding them.
///
pub struct InMemoryData<'a> {
    data: &'a CountData,
    feed_labels: bool,
    minibatches: Minibatches,
}

impl<'a> InMemoryData<'a> {
    /// All cells, labels hidden
    pub fn all_cells(data: &'a CountData) -> Self {
        Self {
            data,
            feed_labels: false,
            minibatches: Minibatches {
                samples: (0..data.num_cells()).collect(),
                chunks: vec![],
            },
        }
    }

    /// Labelled cells only, labels fed; `None` without labelled cells
    pub fn labelled_cells(data: &'a CountData) -> Option<Self> {
        let rows = data.labelled_cells();
        if rows.is_empty() {
            return None;
        }
        Some(Self {
            data,
            feed_labels: true,
            minibatches: Minibatches {
                samples: rows,
                chunks: vec![],
            },
        })
    }

    pub fn num_cells(&self) -> usize {
        self.minibatches.size()
    }
}

impl DataLoader for InMemoryData<'_> {
    fn minibatch_data(
        &self,
        batch_idx: usize,
        target_device: &Device,
    ) -> anyhow::Result<MinibatchData> {
        let rows = self.minibatches.chunks.get(batch_idx).ok_or(anyhow!(
            "invalid index = {} vs. total # = {}",
            batch_idx,
            self.num_minibatch()
        ))?;
        self.data.take_rows(rows, self.feed_labels, target_device)
    }

    fn num_minibatch(&self) -> usize {
        self.minibatches.chunks.len()
    }

    fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        self.minibatches.shuffle_minibatch(batch_size)
    }
}

///
/// A helper `struct` for shuffling and creating minibatch indexes;
/// after `shuffle_minibatch` is called, `chunks` hold sampled cells.
///
pub struct Minibatches {
    samples: Vec<usize>,
    pub chunks: Vec<Vec<usize>>,
}

impl Minibatches {
    pub fn shuffle_minibatch(&mut self, batch_size: usize) -> anyhow::Result<()> {
        use rand_distr::{Distribution, Uniform};

        if batch_size == 0 || self.size() == 0 {
            return Err(anyhow!(
                "cannot split {} samples into minibatches of {}",
                self.size(),
                batch_size
            ));
        }

        let mut rng = rand::rng();
        self.samples.shuffle(&mut rng);

        let nbatch = self.size().div_ceil(batch_size);
        let ntot = nbatch * batch_size;

        let unif = Uniform::new(0, self.size()).map_err(|e| anyhow!("{}", e))?;

        let indexes = (0..ntot)
            .into_par_iter()
            .map_init(rand::rng, |rng, _| unif.sample(rng))
            .collect::<Vec<usize>>();

        let samples = &self.samples;
        self.chunks = (0..nbatch)
            .into_par_iter()
            .map(|b| {
                let lb = b * batch_size;
                let ub = (b + 1) * batch_size;
                (lb..ub).map(|i| samples[indexes[i]]).collect()
            })
            .collect::<Vec<Vec<usize>>>();
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.samples.len()
    }
}
