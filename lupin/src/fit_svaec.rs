use crate::lupin_common::*;
use crate::lupin_io::*;

use candle_core::{DType, Tensor};
use candle_nn::{VarBuilder, VarMap};
use candle_util::candle_data_loader::*;
use candle_util::candle_decoder_count::{Dispersion, ReconstructionLoss};
use candle_util::candle_inference::TrainConfig;
use candle_util::candle_model_svaec::*;
use candle_util::candle_svaec_posterior::*;
use candle_util::candle_vae_inference::SemiSupervisedT;

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "kebab-case")]
enum DispersionArg {
    Gene,
    GeneBatch,
    GeneLabel,
    GeneCell,
}

impl From<&DispersionArg> for Dispersion {
    fn from(arg: &DispersionArg) -> Self {
        match arg {
            DispersionArg::Gene => Dispersion::Gene,
            DispersionArg::GeneBatch => Dispersion::GeneBatch,
            DispersionArg::GeneLabel => Dispersion::GeneLabel,
            DispersionArg::GeneCell => Dispersion::GeneCell,
        }
    }
}

#[derive(ValueEnum, Clone, Debug, PartialEq)]
#[clap(rename_all = "lowercase")]
enum LikelihoodArg {
    Zinb,
    Nb,
}

#[derive(Args, Debug)]
pub struct FitArgs {
    #[arg(
        required = true,
        help = "Count matrix file",
        long_help = "Tab-separated count matrix (cells x genes), gzipped or not.\n\
		     The header line lists gene names after a corner field;\n\
		     each following line starts with a cell name."
    )]
    counts_file: Box<str>,

    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for results:\n\
		     - {out}.z1.tsv.gz\n\
		     - {out}.z2.tsv.gz\n\
		     - {out}.label_prob.tsv.gz\n\
		     - {out}.predicted.txt.gz\n\
		     - {out}.trace.tsv.gz\n"
    )]
    out: Box<str>,

    #[arg(
        long,
        short,
        help = "Cell label file",
        long_help = "One label per line, matched to the cells in order.\n\
		     Write NA for unlabelled cells."
    )]
    labels: Option<Box<str>>,

    #[arg(
        long,
        short,
        help = "Batch membership file",
        long_help = "One batch name per line, matched to the cells in order."
    )]
    batch: Option<Box<str>>,

    #[arg(
        long,
        help = "Number of labels",
        long_help = "Number of labels. Required without a label file.\n\
		     With a label file, labels it never reveals are added\n\
		     as label_{k} until there are this many."
    )]
    n_labels: Option<usize>,

    #[arg(long, short = 'k', default_value_t = 10, help = "Latent dimension")]
    n_latent: usize,

    #[arg(long, default_value_t = 128, help = "Hidden units per layer")]
    n_hidden: usize,

    #[arg(long, default_value_t = 1, help = "Hidden layers per network")]
    n_layers: usize,

    #[arg(long, default_value_t = 0.1, help = "Dropout rate")]
    dropout_rate: f32,

    #[arg(
        long,
        value_enum,
        default_value = "gene",
        help = "Dispersion parameterization",
        long_help = "Negative binomial inverse dispersion:\n\
		     gene: one per gene\n\
		     gene-batch: one per gene and batch\n\
		     gene-label: one per gene and label\n\
		     gene-cell: one per gene and cell"
    )]
    dispersion: DispersionArg,

    #[arg(
        long,
        value_enum,
        default_value = "zinb",
        help = "Count likelihood",
        long_help = "Count likelihood: zero-inflated negative binomial (zinb)\n\
		     or negative binomial (nb)."
    )]
    likelihood: LikelihoodArg,

    #[arg(
        long,
        default_value_t = false,
        help = "Use a logistic regression classifier"
    )]
    logreg_classifier: bool,

    #[arg(
        long,
        value_delimiter(','),
        help = "Label prior",
        long_help = "Prior probabilities of the labels (comma-separated),\n\
		     in the sorted order of label names, then the added\n\
		     label_{k}. Uniform if omitted."
    )]
    label_prior: Option<Vec<f32>>,

    #[arg(long, short = 'i', default_value_t = 100, help = "Number of training epochs")]
    epochs: usize,

    #[arg(long, default_value_t = 128, help = "Minibatch size")]
    minibatch_size: usize,

    #[arg(long, default_value_t = 1e-3, help = "Learning rate")]
    learning_rate: f32,

    #[arg(
        long,
        default_value_t = 20,
        help = "KL annealing warmup epochs",
        long_help = "Number of epochs for KL weight to warm up from 0 to 1.\n\
		     kl_weight = min(1, epoch / warmup). Set to 0 to disable annealing."
    )]
    kl_warmup_epochs: usize,

    #[arg(
        long,
        default_value_t = 50.0,
        help = "Weight of the classification loss",
        long_help = "Weight of the cross entropy of labelled cells\n\
		     relative to their negative ELBO."
    )]
    classification_ratio: f32,

    #[arg(
        long,
        default_value_t = 1000,
        help = "Block size for posterior inference"
    )]
    block_size: usize,

    #[arg(
        long,
        value_enum,
        default_value = "cpu",
        help = "Candle device",
        long_help = "Candle device to use for computation.\n\
		     Options: cpu, cuda, metal."
    )]
    device: ComputeDevice,

    #[arg(
        long,
        default_value_t = 0,
        help = "A device for cuda",
        long_help = "For cuda or metal, we may want to choose a different device."
    )]
    device_no: usize,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

fn tensor_rows(x: &Tensor) -> anyhow::Result<Vec<Vec<f32>>> {
    Ok(x.to_dtype(DType::F32)?.to_vec2::<f32>()?)
}

fn latent_names(prefix: &str, k: usize) -> Vec<Box<str>> {
    (0..k)
        .map(|j| format!("{}_{}", prefix, j).into_boxed_str())
        .collect()
}

///
/// Names of all labels: those revealed in the label file, followed by
/// `label_{k}` placeholders up to `n_labels`
///
fn label_space(revealed: Vec<Box<str>>, n_labels: Option<usize>) -> anyhow::Result<Vec<Box<str>>> {
    let n_revealed = revealed.len();
    let n_labels = n_labels.unwrap_or(n_revealed);
    if n_labels < n_revealed {
        return Err(anyhow::anyhow!(
            "found {} distinct labels, more than --n-labels {}",
            n_revealed,
            n_labels
        ));
    }

    let mut names = revealed;
    let mut k = n_revealed;
    while names.len() < n_labels {
        let name = format!("label_{}", k).into_boxed_str();
        if !names.contains(&name) {
            names.push(name);
        }
        k += 1;
    }

    if n_revealed > 0 && n_labels > n_revealed {
        warn!(
            "{} of {} labels never observed: {}",
            n_labels - n_revealed,
            n_labels,
            names[n_revealed..].join(", ")
        );
    }
    Ok(names)
}

pub fn fit_svaec(args: &FitArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    mkdir(&args.out)?;

    // 1. read counts, labels and batches
    let mut table = read_count_table(&args.counts_file)?;
    let ncells = table.num_cells();
    info!("{} cells x {} genes", ncells, table.num_genes());

    let (label_names, labels) = match args.labels.as_deref() {
        Some(file) => {
            let cats = read_categories(file)?;
            if cats.index.len() != ncells {
                return Err(anyhow::anyhow!(
                    "{} labels for {} cells",
                    cats.index.len(),
                    ncells
                ));
            }
            (label_space(cats.names, args.n_labels)?, Some(cats.index))
        }
        None => {
            let k = args.n_labels.ok_or(anyhow::anyhow!(
                "need either a label file or the number of labels"
            ))?;
            (label_space(vec![], Some(k))?, None)
        }
    };
    let n_labels = label_names.len();

    let batch = match args.batch.as_deref() {
        Some(file) => {
            let cats = read_categories(file)?;
            let batch = cats
                .index
                .iter()
                .map(|b| b.ok_or(anyhow::anyhow!("missing batch membership")))
                .collect::<anyhow::Result<Vec<u32>>>()?;
            info!("{} batches", cats.names.len());
            Some(batch)
        }
        None => None,
    };

    let ngenes = table.num_genes();
    let x_nd = Tensor::from_vec(
        std::mem::take(&mut table.counts),
        (ncells, ngenes),
        &candle_core::Device::Cpu,
    )?;
    let data = CountData::new(x_nd, batch, labels, n_labels)?;
    info!(
        "{} of {} cells labelled",
        data.labelled_cells().len(),
        ncells
    );

    // 2. build the model
    let dev = args.device.to_device(args.device_no)?;
    let parameters = VarMap::new();
    let vb = VarBuilder::from_varmap(&parameters, DType::F32, &dev);

    let config = SvaecConfig {
        n_hidden: args.n_hidden,
        n_latent: args.n_latent,
        n_layers: args.n_layers,
        dropout_rate: args.dropout_rate,
        y_prior: args.label_prior.clone(),
        logreg_classifier: args.logreg_classifier,
        dispersion: (&args.dispersion).into(),
        reconstruction_loss: match args.likelihood {
            LikelihoodArg::Zinb => ReconstructionLoss::Zinb,
            LikelihoodArg::Nb => ReconstructionLoss::Nb,
        },
        ..SvaecConfig::new(data.num_genes(), data.n_batch(), n_labels)
    };

    let networks = SvaecNetworks::new(config, vb)?;
    let model = networks.svaec()?;

    // 3. train
    let train_config = TrainConfig {
        learning_rate: args.learning_rate,
        batch_size: args.minibatch_size,
        num_epochs: args.epochs,
        kl_warmup_epochs: args.kl_warmup_epochs,
        classification_ratio: args.classification_ratio,
        device: dev.clone(),
        verbose: args.verbose,
        show_progress: true,
    };

    let mut all_cells = InMemoryData::all_cells(&data);
    let mut labelled_cells = InMemoryData::labelled_cells(&data);
    if labelled_cells.is_none() {
        warn!("no labelled cells; the classifier is trained only through the ELBO");
    }

    let scores = model.train_semisupervised(
        &mut all_cells,
        labelled_cells.as_mut(),
        &parameters,
        &train_config,
    )?;

    let trace = std::iter::once("epoch\telbo\treconstruction\tkl\tclassification".to_string())
        .chain((0..scores.elbo.len()).map(|e| {
            format!(
                "{}\t{}\t{}\t{}\t{}",
                e + 1,
                scores.elbo[e],
                scores.reconstruction[e],
                scores.kl[e],
                scores.classification[e]
            )
        }))
        .collect::<Vec<_>>();
    write_types(&trace, &format!("{}.trace.tsv.gz", args.out))?;

    // 4. posterior
    let (z1, z2) = latent_states(&model, &data, &dev, args.block_size)?;
    let probs = label_probabilities(&model, &data, &dev, args.block_size)?;
    let predicted = predicted_labels(&probs)?;

    if let Some(acc) = accuracy(&predicted, data.labels()) {
        info!("accuracy on labelled cells: {:.4}", acc);
    }

    write_named_matrix(
        &table.cells,
        &latent_names("z1", args.n_latent),
        &tensor_rows(&z1)?,
        &format!("{}.z1.tsv.gz", args.out),
    )?;
    write_named_matrix(
        &table.cells,
        &latent_names("z2", args.n_latent),
        &tensor_rows(&z2)?,
        &format!("{}.z2.tsv.gz", args.out),
    )?;
    write_named_matrix(
        &table.cells,
        &label_names,
        &tensor_rows(&probs)?,
        &format!("{}.label_prob.tsv.gz", args.out),
    )?;

    let predicted_names = predicted
        .iter()
        .map(|&k| label_names[k as usize].clone())
        .collect::<Vec<_>>();
    write_types(&predicted_names, &format!("{}.predicted.txt.gz", args.out))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(xs: &[&str]) -> Vec<Box<str>> {
        xs.iter().map(|&x| x.into()).collect()
    }

    #[test]
    fn unrevealed_labels_are_kept() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("labels.txt.gz");
        let file = file.to_str().ok_or(anyhow::anyhow!("path"))?;
        write_types(&["type_1", "NA", "type_0", "NA", "type_1"], file)?;

        let cats = read_categories(file)?;
        let labels = label_space(cats.names, Some(3))?;
        assert_eq!(labels, names(&["type_0", "type_1", "label_2"]));
        assert!(cats.index.iter().flatten().all(|&k| (k as usize) < labels.len()));

        let data = CountData::new(
            Tensor::ones((5, 4), DType::F32, &candle_core::Device::Cpu)?,
            None,
            Some(cats.index),
            labels.len(),
        )?;
        assert_eq!(data.n_labels(), 3);
        assert_eq!(data.labelled_cells(), vec![0, 2, 4]);
        Ok(())
    }

    #[test]
    fn label_space_from_revealed_names() -> anyhow::Result<()> {
        assert_eq!(label_space(names(&["a", "b"]), None)?, names(&["a", "b"]));
        assert_eq!(
            label_space(vec![], Some(3))?,
            names(&["label_0", "label_1", "label_2"])
        );
        assert_eq!(
            label_space(names(&["label_1"]), Some(3))?,
            names(&["label_1", "label_2", "label_3"])
        );
        assert!(label_space(names(&["a", "b", "c"]), Some(2)).is_err());
        Ok(())
    }
}
