use crate::lupin_common::*;
use crate::lupin_io::*;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Gamma, LogNormal, Poisson};

#[derive(Args, Debug)]
pub struct SimArgs {
    #[arg(
        long,
        short,
        required = true,
        help = "Output header",
        long_help = "Output header for simulated data:\n\
		     - {out}.counts.tsv.gz\n\
		     - {out}.labels.txt.gz\n\
		     - {out}.batch.txt.gz\n\
		     - {out}.truth.txt.gz\n"
    )]
    out: Box<str>,

    #[arg(long, default_value_t = 500, help = "Number of cells")]
    cells: usize,

    #[arg(long, default_value_t = 200, help = "Number of genes")]
    genes: usize,

    #[arg(long, default_value_t = 3, help = "Number of cell types")]
    types: usize,

    #[arg(long, default_value_t = 2, help = "Number of batches")]
    batches: usize,

    #[arg(
        long,
        default_value_t = 0.2,
        help = "Fraction of labelled cells",
        long_help = "Fraction of cells whose type is revealed in {out}.labels.txt.gz.\n\
		     The other cells are written as NA."
    )]
    labelled_fraction: f64,

    #[arg(
        long,
        default_value_t = 5.0,
        help = "Fold change of type-specific genes"
    )]
    fold_change: f64,

    #[arg(
        long,
        default_value_t = 3000.0,
        help = "Mean sequencing depth per cell"
    )]
    depth: f64,

    #[arg(
        long,
        default_value_t = 2.0,
        help = "Gamma shape of the expression noise",
        long_help = "Gamma shape of the expression noise.\n\
		     Counts are Poisson given a Gamma rate, i.e., negative binomial\n\
		     with this inverse dispersion."
    )]
    inverse_dispersion: f64,

    #[arg(long, default_value_t = 42, help = "Random seed")]
    seed: u64,

    #[arg(long, short, help = "Verbosity")]
    verbose: bool,
}

pub struct SimOut {
    pub counts: Vec<Vec<f32>>,
    pub types: Vec<usize>,
    pub batches: Vec<usize>,
    pub labelled: Vec<bool>,
}

///
/// Gamma-Poisson counts with type-specific gene programs
///
/// Genes are split into `types` blocks; block `k` is up-regulated by
/// `fold_change` in cells of type `k`. Each batch multiplies every
/// gene by its own Gamma(10, 1/10) factor.
///
pub fn simulate_counts(args: &SimArgs) -> anyhow::Result<SimOut> {
    if args.types < 2 || args.genes < args.types || args.cells == 0 {
        return Err(anyhow::anyhow!(
            "need at least two types, as many genes as types, and some cells"
        ));
    }
    if !(0.0..=1.0).contains(&args.labelled_fraction) {
        return Err(anyhow::anyhow!("labelled fraction must be in [0, 1]"));
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let ngenes = args.genes;
    let nbatch = args.batches.max(1);

    let base = LogNormal::new(0., 0.5)?;
    let base_g = (0..ngenes).map(|_| base.sample(&mut rng)).collect::<Vec<f64>>();

    let block = ngenes / args.types;
    let profile_kg = (0..args.types)
        .map(|k| {
            let mut mu = base_g.clone();
            for g in (k * block)..((k + 1) * block) {
                mu[g] *= args.fold_change;
            }
            let tot: f64 = mu.iter().sum();
            mu.iter().map(|m| m / tot).collect::<Vec<f64>>()
        })
        .collect::<Vec<_>>();

    let batch_gamma = Gamma::new(10., 0.1)?;
    let batch_bg = (0..nbatch)
        .map(|_| {
            (0..ngenes)
                .map(|_| batch_gamma.sample(&mut rng))
                .collect::<Vec<f64>>()
        })
        .collect::<Vec<_>>();

    let depth = LogNormal::new(args.depth.ln(), 0.3)?;
    let r = args.inverse_dispersion;

    let mut out = SimOut {
        counts: Vec::with_capacity(args.cells),
        types: Vec::with_capacity(args.cells),
        batches: Vec::with_capacity(args.cells),
        labelled: Vec::with_capacity(args.cells),
    };

    for _ in 0..args.cells {
        let k = rng.random_range(0..args.types);
        let b = rng.random_range(0..nbatch);
        let depth_i = depth.sample(&mut rng);

        let mut x_i = Vec::with_capacity(ngenes);
        for g in 0..ngenes {
            let mu = depth_i * profile_kg[k][g] * batch_bg[b][g];
            let rate = Gamma::new(r, mu / r)?.sample(&mut rng);
            let x = if rate > 0. {
                Poisson::new(rate)?.sample(&mut rng)
            } else {
                0.
            };
            x_i.push(x as f32);
        }

        // every cell needs at least one read
        if x_i.iter().all(|&x| x == 0.) {
            x_i[k * block] = 1.;
        }

        out.counts.push(x_i);
        out.types.push(k);
        out.batches.push(b);
        out.labelled.push(rng.random_bool(args.labelled_fraction));
    }

    Ok(out)
}

pub fn simulate_data(args: &SimArgs) -> anyhow::Result<()> {
    if args.verbose {
        std::env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    mkdir(&args.out)?;
    let sim = simulate_counts(args)?;

    let cells = (0..args.cells)
        .map(|i| format!("cell_{}", i).into_boxed_str())
        .collect::<Vec<_>>();
    let genes = (0..args.genes)
        .map(|g| format!("gene_{}", g).into_boxed_str())
        .collect::<Vec<_>>();

    let counts_file = format!("{}.counts.tsv.gz", args.out);
    write_named_matrix(&cells, &genes, &sim.counts, &counts_file)?;
    info!("wrote {} cells x {} genes: {}", args.cells, args.genes, counts_file);

    let truth = sim
        .types
        .iter()
        .map(|k| format!("type_{}", k))
        .collect::<Vec<_>>();
    let labels = truth
        .iter()
        .zip(sim.labelled.iter())
        .map(|(t, &obs)| if obs { t.clone() } else { MISSING_LABEL.to_string() })
        .collect::<Vec<_>>();
    let batches = sim
        .batches
        .iter()
        .map(|b| format!("batch_{}", b))
        .collect::<Vec<_>>();

    write_types(&truth, &format!("{}.truth.txt.gz", args.out))?;
    write_types(&labels, &format!("{}.labels.txt.gz", args.out))?;
    write_types(&batches, &format!("{}.batch.txt.gz", args.out))?;

    let nlab = sim.labelled.iter().filter(|&&x| x).count();
    info!("{} of {} cells labelled", nlab, args.cells);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Parser)]
    struct TestCli {
        #[command(flatten)]
        sim: SimArgs,
    }

    fn args(extra: &[&str]) -> SimArgs {
        let mut argv = vec!["sim", "--out", "unused"];
        argv.extend_from_slice(extra);
        TestCli::parse_from(argv).sim
    }

    #[test]
    fn simulated_counts_follow_arguments() -> anyhow::Result<()> {
        let sim = simulate_counts(&args(&[
            "--cells", "40", "--genes", "12", "--types", "3", "--batches", "2",
            "--labelled-fraction", "0.5",
        ]))?;
        assert_eq!(sim.counts.len(), 40);
        assert!(sim.counts.iter().all(|x| x.len() == 12));
        assert!(sim.counts.iter().all(|x| x.iter().sum::<f32>() > 0.));
        assert!(sim.types.iter().all(|&k| k < 3));
        assert!(sim.batches.iter().all(|&b| b < 2));
        Ok(())
    }

    #[test]
    fn same_seed_same_data() -> anyhow::Result<()> {
        let a = simulate_counts(&args(&["--cells", "10", "--genes", "6"]))?;
        let b = simulate_counts(&args(&["--cells", "10", "--genes", "6"]))?;
        assert_eq!(a.counts, b.counts);
        assert_eq!(a.types, b.types);
        Ok(())
    }

    #[test]
    fn writes_all_outputs() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let prefix = dir.path().join("sim");
        let prefix = prefix.to_str().ok_or(anyhow::anyhow!("path"))?;
        let mut sim_args = args(&["--cells", "8", "--genes", "6", "--labelled-fraction", "0.5"]);
        sim_args.out = prefix.into();

        simulate_data(&sim_args)?;

        let table = read_count_table(&format!("{}.counts.tsv.gz", prefix))?;
        assert_eq!(table.num_cells(), 8);
        assert_eq!(table.num_genes(), 6);

        let truth = read_lines(&format!("{}.truth.txt.gz", prefix))?;
        let labels = read_lines(&format!("{}.labels.txt.gz", prefix))?;
        let batches = read_lines(&format!("{}.batch.txt.gz", prefix))?;
        assert_eq!(truth.len(), 8);
        assert_eq!(labels.len(), 8);
        assert_eq!(batches.len(), 8);
        for (t, l) in truth.iter().zip(labels.iter()) {
            assert!(&**l == MISSING_LABEL || l == t);
        }
        Ok(())
    }
}
