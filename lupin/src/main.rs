mod fit_svaec;
mod lupin_common;
mod lupin_io;
mod sim_data;

use fit_svaec::*;
use lupin_common::*;
use sim_data::*;

#[derive(Parser, Debug)]
#[command(
    version,
    about = "LUPIN",
    long_about = "Label-informed latent embedding of single-cell counts\n\
		  by a stacked semi-supervised variational autoencoder (M1+M2).\n\
		  Counts are read from tab-separated matrices (cells x genes)."
)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        about = "Simulate partially labelled count data",
        long_about = "Simulate gamma-Poisson counts of several cell types across batches.\n\
		      Only a fraction of cell types are revealed as labels;\n\
		      the full assignment is kept in a separate truth file.\n"
    )]
    Simulate(SimArgs),

    #[command(
        about = "Fit the stacked semi-supervised VAE",
        long_about = "Fit the model in three stages:\n\
		      (1) Read counts with partial labels and batch membership\n\
		      (2) Train all networks jointly on labelled and unlabelled cells\n\
		      (3) Estimate latent states and label probabilities of every cell.\n"
    )]
    Fit(FitArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.commands {
        Commands::Simulate(args) => {
            simulate_data(args)?;
        }
        Commands::Fit(args) => {
            fit_svaec(args)?;
        }
    }

    info!("Done");
    Ok(())
}
