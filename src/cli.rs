// Copyright 2021-2023 University Medical Center Groningen.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::path::PathBuf;

use structopt::StructOpt;

use crate::data::DataFiles;
use crate::driver::{Config, Picalo};

#[derive(Debug, StructOpt, Clone)]
#[structopt(
    name = "picalo",
    about = "Identification of Principal Interaction Components (PICs) that modulate cis-eQTL effect sizes.",
    setting = structopt::clap::AppSettings::ColoredHelp,
)]
pub struct Opt {
    #[structopt(
        short = "e",
        long = "eqtl",
        parse(from_os_str),
        help = "The path to the eQTL matrix; requires the columns SNPName, ProbeName and FDR."
    )]
    pub eqtl: PathBuf,
    #[structopt(
        short = "g",
        long = "genotype",
        parse(from_os_str),
        help = "The path to the genotype dosage matrix (eQTLs x samples)."
    )]
    pub genotype: PathBuf,
    #[structopt(
        long = "genotype-na",
        default_value = "-1",
        allow_hyphen_values = true,
        help = "The genotype value that equals a missing value."
    )]
    pub genotype_na: f64,
    #[structopt(
        short = "x",
        long = "expression",
        parse(from_os_str),
        help = "The path to the expression matrix (eQTLs x samples)."
    )]
    pub expression: PathBuf,
    #[structopt(
        long = "tech-covariate",
        parse(from_os_str),
        help = "The path to the technical covariate matrix, excluding an interaction with genotype."
    )]
    pub tech_covariate: Option<PathBuf>,
    #[structopt(
        long = "tech-covariate-with-inter",
        parse(from_os_str),
        help = "The path to the technical covariate matrix, including an interaction with genotype."
    )]
    pub tech_covariate_with_inter: Option<PathBuf>,
    #[structopt(
        short = "c",
        long = "covariate",
        parse(from_os_str),
        help = "The path to the covariate matrix, used as the initial guesses for the optimization."
    )]
    pub covariate: PathBuf,
    #[structopt(
        short = "s",
        long = "sample-to-dataset",
        parse(from_os_str),
        help = "The path to the sample-dataset link file: sample identifier, then dataset tag."
    )]
    pub sample_to_dataset: Option<PathBuf>,
    #[structopt(
        long = "min-dataset-size",
        default_value = "30",
        help = "The minimal number of samples per dataset."
    )]
    pub min_dataset_size: usize,
    #[structopt(
        long = "call-rate",
        default_value = "0.95",
        help = "The minimal call rate of a SNP per dataset; equals 1 - missingness."
    )]
    pub call_rate: f64,
    #[structopt(
        long = "hardy-weinberg-pvalue",
        default_value = "1e-4",
        help = "The Hardy-Weinberg p-value threshold."
    )]
    pub hardy_weinberg_pvalue: f64,
    #[structopt(
        long = "minor-allele-frequency",
        default_value = "0.01",
        help = "The minor allele frequency threshold (exclusive)."
    )]
    pub minor_allele_frequency: f64,
    #[structopt(
        long = "min-group-size",
        default_value = "2",
        help = "The minimal number of samples per genotype group."
    )]
    pub min_group_size: usize,
    #[structopt(
        long = "eqtl-alpha",
        default_value = "0.05",
        help = "The discovery FDR cut-off on the main eQTL effect."
    )]
    pub eqtl_alpha: f64,
    #[structopt(
        long = "ieqtl-alpha",
        default_value = "0.05",
        help = "The interaction eQTL significance cut-off."
    )]
    pub ieqtl_alpha: f64,
    #[structopt(
        long = "n-components",
        default_value = "10",
        help = "The number of components to extract."
    )]
    pub n_components: usize,
    #[structopt(
        long = "min-iter",
        default_value = "5",
        help = "The minimum number of optimization iterations per component."
    )]
    pub min_iter: usize,
    #[structopt(
        long = "max-iter",
        default_value = "100",
        help = "The maximum number of optimization iterations per component."
    )]
    pub max_iter: usize,
    #[structopt(
        long = "tol",
        default_value = "1e-3",
        help = "The convergence threshold: optimization stops once 1 - Pearson r drops below it."
    )]
    pub tol: f64,
    #[structopt(
        long = "force-continue",
        help = "Keep identifying components even when the previous one did not converge."
    )]
    pub force_continue: bool,
    #[structopt(
        short = "o",
        long = "output",
        parse(from_os_str),
        help = "The output directory."
    )]
    pub output: PathBuf,
    #[structopt(long = "verbose", help = "Enable verbose output.")]
    pub verbose: bool,
}

pub fn run(opt: Opt) -> anyhow::Result<()> {
    let files = DataFiles::new(
        opt.eqtl,
        opt.genotype,
        opt.expression,
        opt.covariate,
        opt.sample_to_dataset,
        opt.tech_covariate,
        opt.tech_covariate_with_inter,
    );
    let config = Config {
        genotype_na: opt.genotype_na,
        min_dataset_size: opt.min_dataset_size,
        call_rate: opt.call_rate,
        hw_pvalue: opt.hardy_weinberg_pvalue,
        maf: opt.minor_allele_frequency,
        min_group_size: opt.min_group_size,
        eqtl_alpha: opt.eqtl_alpha,
        ieqtl_alpha: opt.ieqtl_alpha,
        n_components: opt.n_components,
        min_iter: opt.min_iter,
        max_iter: opt.max_iter,
        tol: opt.tol,
        force_continue: opt.force_continue,
        output: opt.output,
    };
    Picalo::new(files, config).run()
}
