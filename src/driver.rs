// Copyright 2021-2023 University Medical Center Groningen.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! The component driver: loads and QCs the inputs, residualises the
//! expression once per component, runs the interaction optimiser for up to
//! `n_components` PICs, and persists every artefact. A run against an output
//! directory that already holds `PIC{k}/component.npy` resumes from there.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use itertools::Itertools;
use log::{error, info, warn};
use ndarray::{Array2, Zip};

use crate::correction::{self, CorrectionMatrices};
use crate::data::{self, DataFiles};
use crate::errors::Error;
use crate::io::{self, EqtlRecord};
use crate::mapping::{self, INTERACTION_TABLE_HEADER};
use crate::normalise::ForceNormaliser;
use crate::optimize::{InteractionOptimizer, InteractionOptimizerBuilder};
use crate::qc::{self, QcThresholds};

/// All tunables of a run; immutable once constructed.
#[derive(Debug, Clone)]
pub struct Config {
    pub genotype_na: f64,
    pub min_dataset_size: usize,
    pub call_rate: f64,
    pub hw_pvalue: f64,
    pub maf: f64,
    pub min_group_size: usize,
    pub eqtl_alpha: f64,
    pub ieqtl_alpha: f64,
    pub n_components: usize,
    pub min_iter: usize,
    pub max_iter: usize,
    pub tol: f64,
    pub force_continue: bool,
    pub output: PathBuf,
}

impl Config {
    fn thresholds(&self) -> QcThresholds {
        QcThresholds {
            call_rate: self.call_rate,
            hw_pvalue: self.hw_pvalue,
            maf: self.maf,
            min_group_size: self.min_group_size as f64,
        }
    }

    fn print_arguments(&self) {
        info!("Arguments:");
        info!("  > Genotype NA value: {}", self.genotype_na);
        info!("  > Minimal dataset size: >={}", self.min_dataset_size);
        info!("  > SNP call rate: >{}", self.call_rate);
        info!("  > Hardy-Weinberg p-value: >={}", self.hw_pvalue);
        info!("  > MAF: >{}", self.maf);
        info!("  > Minimal group size: >={}", self.min_group_size);
        info!("  > eQTL alpha: <{}", self.eqtl_alpha);
        info!("  > ieQTL alpha: <={}", self.ieqtl_alpha);
        info!("  > N components: {}", self.n_components);
        info!("  > Minimal iterations: {}", self.min_iter);
        info!("  > Maximum iterations: {}", self.max_iter);
        info!("  > Tolerance: {}", self.tol);
        info!("  > Force continue: {}", self.force_continue);
        info!("  > Output directory: {}", self.output.display());
        info!("");
    }
}

pub struct Picalo {
    files: DataFiles,
    config: Config,
}

/// Inputs after loading, validation and quality control.
struct Panel {
    eqtls: Vec<EqtlRecord>,
    geno_m: Array2<f64>,
    expr_m: Array2<f64>,
    covs_m: Array2<f64>,
    covariates: Vec<String>,
    samples: Vec<String>,
    datasets: Vec<String>,
    dataset_m: Array2<f64>,
}

impl Picalo {
    pub fn new(files: DataFiles, config: Config) -> Self {
        Picalo { files, config }
    }

    pub fn run(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.config.output)?;
        info!("Starting program");
        self.config.print_arguments();
        self.files.print_arguments();

        let panel = self.load_and_filter()?;
        self.identify_components(&panel)
    }

    fn load_and_filter(&self) -> anyhow::Result<Panel> {
        let config = &self.config;
        let na = config.genotype_na;

        info!("Loading eQTL data, genotype data, and dataset info");
        let all_eqtls = self.files.load_eqtls()?;
        let fdr_keep: Vec<bool> = all_eqtls
            .iter()
            .map(|e| e.fdr < config.eqtl_alpha)
            .collect();
        let n_fdr_skipped = fdr_keep.iter().filter(|&&k| !k).count();
        if n_fdr_skipped > 0 {
            warn!("\t{} eQTLs have been skipped due to FDR cut-off", n_fdr_skipped);
        }

        let geno = self.files.load_genotype()?;
        if geno.nrows() != all_eqtls.len() {
            return Err(Error::GenotypeEqtlShapeMismatch.into());
        }
        if !geno
            .row_labels
            .iter()
            .zip(all_eqtls.iter())
            .all(|(label, eqtl)| label == &eqtl.snp)
        {
            return Err(Error::GenotypeEqtlMismatch.into());
        }
        if geno.has_nan() {
            return Err(Error::NanValues {
                name: "genotype".to_owned(),
            }
            .into());
        }

        let pairs = match self.files.load_sample_datasets()? {
            Some(pairs) => {
                let samples: Vec<&String> = pairs.iter().map(|(s, _)| s).collect();
                if !geno
                    .col_labels
                    .iter()
                    .zip(samples.iter())
                    .all(|(a, b)| &a == b)
                    || geno.ncols() != pairs.len()
                {
                    return Err(Error::GenotypeSampleMismatch.into());
                }
                pairs
            }
            None => geno
                .col_labels
                .iter()
                .map(|s| (s.clone(), "None".to_owned()))
                .collect(),
        };
        let samples = pairs.iter().map(|(s, _)| s.clone()).collect_vec();

        info!("\tChecking dataset sample sizes");
        let (datasets, dataset_m) = data::construct_dataset_matrix(&pairs);
        let mut smallest = usize::MAX;
        for (d, dataset) in datasets.iter().enumerate() {
            let size = dataset_m.column(d).sum() as usize;
            info!("\t  {}  {} samples", dataset, size);
            smallest = smallest.min(size);
        }
        if smallest < config.min_dataset_size {
            warn!(
                "\t\tOne or more datasets have a smaller sample size than \
                 recommended. Consider excluding these"
            );
        }
        info!("");

        let mut eqtls: Vec<EqtlRecord> = all_eqtls
            .iter()
            .zip(fdr_keep.iter())
            .filter(|(_, &keep)| keep)
            .map(|(e, _)| e.clone())
            .collect();
        let geno_kept = geno.select_rows(&fdr_keep);
        let mut geno_m = geno_kept.values;
        let snp_labels = geno_kept.row_labels;

        info!("\tCalculating genotype call rate per dataset");
        let call_rates = qc::apply_call_rate(&mut geno_m, &dataset_m, na, config.call_rate);
        let n_blanked = (0..call_rates.nrows())
            .filter(|&i| call_rates.row(i).iter().any(|&r| r < config.call_rate))
            .count();
        if n_blanked > 0 {
            warn!(
                "\t  {} eQTLs have had dataset(s) filled with NaN values due \
                 to call rate threshold",
                n_blanked
            );
        }
        let cr_labels = datasets.iter().map(|d| format!("{} CR", d)).collect_vec();
        io::save_matrix(
            &config.output.join("call_rate.txt.gz"),
            "",
            &snp_labels,
            &cr_labels,
            &call_rates,
        )?;
        info!("");

        info!("\tCalculating genotype stats for inclusion criteria");
        let stats = qc::genotype_stats(&geno_m, na);
        let thresholds = config.thresholds();
        let keep: Vec<bool> = stats.iter().map(|s| s.passes(&thresholds)).collect();
        let n_dropped = keep.iter().filter(|&&k| !k).count();
        if n_dropped > 0 {
            let count = |f: &dyn Fn(&qc::GenotypeStats) -> bool| stats.iter().filter(|s| f(s)).count();
            warn!(
                "\t  {} eQTL(s) failed the call rate threshold",
                count(&|s| s.n == 0.0)
            );
            warn!(
                "\t  {} eQTL(s) failed the sample size threshold",
                count(&|s| !(s.n >= 6.0))
            );
            warn!(
                "\t  {} eQTL(s) failed the min. genotype group size threshold",
                count(&|s| !(s.min_group_size >= thresholds.min_group_size))
            );
            warn!(
                "\t  {} eQTL(s) failed the Hardy-Weinberg p-value threshold",
                count(&|s| !(s.hw_pvalue >= thresholds.hw_pvalue))
            );
            warn!(
                "\t  {} eQTL(s) failed the MAF threshold",
                count(&|s| !(s.maf > thresholds.maf))
            );
            warn!("\t  ----------------------------------------");
            warn!("\t  {} eQTL(s) are discarded in total", n_dropped);
        }
        self.save_genotype_stats(&snp_labels, &stats, &keep)?;
        info!("");

        if keep.iter().all(|&k| !k) {
            return Err(Error::NoEqtlsRemaining.into());
        }

        let mut kept_iter = keep.iter();
        let full_keep: Vec<bool> = fdr_keep
            .iter()
            .map(|&fdr_ok| fdr_ok && *kept_iter.next().expect("one flag per kept row"))
            .collect();
        eqtls = eqtls
            .into_iter()
            .zip(keep.iter())
            .filter(|(_, &k)| k)
            .map(|(e, _)| e)
            .collect();
        let geno_kept = io::Matrix {
            row_labels: snp_labels,
            col_labels: samples.clone(),
            values: geno_m,
        }
        .select_rows(&keep);
        let mut geno_m = geno_kept.values;

        info!("Loading other data");
        info!("\tIncluded {} eQTLs", eqtls.len());
        let expr = self.files.load_expression()?;
        if expr.nrows() != all_eqtls.len() {
            return Err(Error::ExpressionEqtlShapeMismatch.into());
        }
        if !expr
            .row_labels
            .iter()
            .zip(all_eqtls.iter())
            .all(|(label, eqtl)| label == &eqtl.probe)
        {
            return Err(Error::ExpressionEqtlMismatch.into());
        }
        if expr.col_labels != samples {
            return Err(Error::ExpressionSampleMismatch.into());
        }
        let expr = expr.select_rows(&full_keep);
        if expr.has_nan() {
            return Err(Error::NanValues {
                name: "expression".to_owned(),
            }
            .into());
        }
        let mut expr_m = expr.values;

        let covs = self.files.load_covariates()?;
        if covs.has_nan() {
            return Err(Error::NanValues {
                name: "covariate".to_owned(),
            }
            .into());
        }
        let covs = if covs.nrows() == samples.len() {
            warn!("\t  Transposing covariate matrix");
            covs.transposed()
        } else {
            covs
        };
        if covs.col_labels != samples {
            return Err(Error::CovariateSampleMismatch.into());
        }
        let covariates = covs.row_labels.clone();
        info!("\t  Covariates: {}", covariates.join(", "));
        info!("");

        // Missing genotypes become NaN in both matrices from here on.
        Zip::from(&mut expr_m).and(&geno_m).for_each(|e, &g| {
            if g == na {
                *e = f64::NAN;
            }
        });
        geno_m.mapv_inplace(|g| if g == na { f64::NAN } else { g });

        Ok(Panel {
            eqtls,
            geno_m,
            expr_m,
            covs_m: covs.values,
            covariates,
            samples,
            datasets,
            dataset_m,
        })
    }

    fn save_genotype_stats(
        &self,
        snp_labels: &[String],
        stats: &[qc::GenotypeStats],
        keep: &[bool],
    ) -> anyhow::Result<()> {
        let columns: Vec<String> = [
            "N", "NaN", "0", "1", "2", "min GS", "HW pval", "allele1", "allele2", "MA", "MAF",
            "mask",
        ]
        .iter()
        .map(|s| (*s).to_owned())
        .collect();
        let mut values = Array2::from_elem((stats.len(), columns.len()), f64::NAN);
        for (i, row) in stats.iter().enumerate() {
            values[[i, 0]] = row.n;
            values[[i, 1]] = row.nan;
            values[[i, 2]] = row.zero;
            values[[i, 3]] = row.one;
            values[[i, 4]] = row.two;
            values[[i, 5]] = row.min_group_size;
            values[[i, 6]] = row.hw_pvalue;
            values[[i, 7]] = row.allele1;
            values[[i, 8]] = row.allele2;
            values[[i, 9]] = row.minor_allele;
            values[[i, 10]] = row.maf;
            values[[i, 11]] = if keep[i] { 1.0 } else { 0.0 };
        }
        io::save_matrix(
            &self.config.output.join("genotype_stats.txt.gz"),
            "",
            snp_labels,
            &columns,
            &values,
        )?;
        Ok(())
    }

    fn build_optimizer(&self, panel: &Panel) -> anyhow::Result<InteractionOptimizer> {
        InteractionOptimizerBuilder::default()
            .covariates(panel.covariates.clone())
            .samples(panel.samples.clone())
            .normaliser(ForceNormaliser::new(&panel.dataset_m))
            .ieqtl_alpha(self.config.ieqtl_alpha)
            .min_iter(self.config.min_iter)
            .max_iter(self.config.max_iter)
            .tol(self.config.tol)
            .build()
            .map_err(anyhow::Error::msg)
    }

    fn identify_components(&self, panel: &Panel) -> anyhow::Result<()> {
        let config = &self.config;

        info!("Loading technical covariates");
        let tcov = match self.files.load_tech_covariates()? {
            Some(matrix) => Some(data::condition_tech_covariates(
                matrix,
                "tech. cov. without interaction",
                &panel.samples,
            )?),
            None => None,
        };
        let tcov_inter = match self.files.load_tech_covariates_with_inter()? {
            Some(matrix) => Some(data::condition_tech_covariates(
                matrix,
                "tech. cov. with interaction",
                &panel.samples,
            )?),
            None => None,
        };
        let corr = CorrectionMatrices::construct(
            &panel.dataset_m,
            &panel.datasets,
            tcov.as_ref().map(|(m, l)| (m, l.as_slice())),
            tcov_inter.as_ref().map(|(m, l)| (m, l.as_slice())),
        );
        info!(
            "\tCorrection matrix includes the following columns [N={}]: {}",
            corr.labels().len(),
            corr.labels().join(", ")
        );
        info!("");

        info!("Starting PIC identification");
        let optimizer = self.build_optimizer(panel)?;
        let normaliser = ForceNormaliser::new(&panel.dataset_m);

        let mut pic_corr = corr.clone();
        let mut pics: Vec<(String, Vec<f64>)> = Vec::new();
        let mut summary_iterative = vec![f64::NAN; config.n_components];
        let mut summary_raw = vec![f64::NAN; config.n_components];
        let mut last_component: Option<(String, Vec<f64>)> = None;
        let mut stop_flag = false;

        for k in 1..=config.n_components {
            if stop_flag {
                warn!("Last component did not converge");
                if !config.force_continue {
                    warn!("Stop further identification of components");
                    break;
                }
            }
            info!("\tIdentifying PIC {}", k);
            let comp_outdir = config.output.join(format!("PIC{}", k));
            fs::create_dir_all(&comp_outdir)?;

            if let Some((label, component)) = last_component.take() {
                pic_corr.append_component(&component, &label);
            }

            let component_path = io::component_path(&comp_outdir);
            if component_path.exists() {
                info!("\t  PIC has already been identified");
                let component = io::load_npy(&component_path)?;
                if component.len() != panel.samples.len() {
                    return Err(Error::ComponentLengthMismatch {
                        path: component_path,
                        found: component.len(),
                        expected: panel.samples.len(),
                    }
                    .into());
                }
                if let Some(n) = read_final_hits(&comp_outdir.join("info.txt.gz"))? {
                    summary_iterative[k - 1] = n;
                }
                let label = format!("PIC{}", k);
                pics.push((label.clone(), component.clone()));
                last_component = Some((label, component));
            } else {
                info!("\t  Correcting expression matrix");
                let mut comp_expr = panel.expr_m.clone();
                correction::remove_covariates(&mut comp_expr, &pic_corr, &panel.geno_m);

                info!("\t  Optimizing interaction component");
                let outcome = optimizer.process(
                    &panel.eqtls,
                    &panel.geno_m,
                    &comp_expr,
                    &panel.covs_m,
                    &comp_outdir,
                )?;
                summary_iterative[k - 1] = outcome.n_hits as f64;

                match outcome.component {
                    None => {
                        warn!("\t  No component could be identified");
                        if !config.force_continue {
                            break;
                        }
                        continue;
                    }
                    Some(component) => {
                        io::save_npy(&component_path, &component)?;
                        let label = format!("PIC{}", k);
                        pics.push((label.clone(), component.clone()));
                        last_component = Some((label, component));
                        stop_flag = outcome.stop;
                    }
                }
            }

            self.save_components_table(&pics, &panel.samples, "components.txt.gz")?;
            info!("");
        }

        if pics.is_empty() {
            error!("No PICs identified. Stopping PICALO.");
            self.save_summary_stats(&summary_iterative, &summary_raw)?;
            return Ok(());
        }

        let mut final_pics = pics.clone();
        if stop_flag && !config.force_continue {
            final_pics.pop();
        }
        self.save_components_table(&final_pics, &panel.samples, "PICs.txt.gz")?;

        if !final_pics.is_empty() {
            info!("Map interactions with PICs without correcting previous PICs.");
            info!("\t  Correcting expression matrix");
            let pic_ieqtl_outdir = config.output.join("PIC_interactions");
            fs::create_dir_all(&pic_ieqtl_outdir)?;

            let mut corrected_m = panel.expr_m.clone();
            correction::remove_covariates(&mut corrected_m, &corr, &panel.geno_m);

            info!("\t  Mapping ieQTLs");
            for (label, component) in &final_pics {
                let mut pic_expr =
                    correction::remove_covariates_elementwise(&corrected_m, &panel.geno_m, component);
                normaliser.process_matrix(&mut pic_expr);
                let mut fn_component = component.clone();
                normaliser.process_vector(&mut fn_component);

                let result = mapping::find_ieqtls(
                    &panel.eqtls,
                    &panel.geno_m,
                    &pic_expr,
                    &fn_component,
                    label,
                    config.ieqtl_alpha,
                );
                info!("\t\t{} has {} significant ieQTLs", label, result.n_hits);
                io::save_table(
                    &pic_ieqtl_outdir.join(format!("{}.txt.gz", label)),
                    &INTERACTION_TABLE_HEADER,
                    result.table.iter().cloned(),
                )?;

                let index: usize = label
                    .trim_start_matches("PIC")
                    .parse()
                    .context("component label carries its index")?;
                summary_raw[index - 1] = result.n_hits as f64;
            }
        }

        self.save_summary_stats(&summary_iterative, &summary_raw)?;
        info!("Finished");
        info!("");
        Ok(())
    }

    fn save_components_table(
        &self,
        pics: &[(String, Vec<f64>)],
        samples: &[String],
        file_name: &str,
    ) -> anyhow::Result<()> {
        let labels = pics.iter().map(|(label, _)| label.clone()).collect_vec();
        let ncols = samples.len();
        let flat: Vec<f64> = pics.iter().flat_map(|(_, v)| v.iter().cloned()).collect();
        let values =
            Array2::from_shape_vec((pics.len(), ncols), flat).expect("components are sample-length");
        io::save_matrix(
            &self.config.output.join(file_name),
            "",
            &labels,
            &samples.to_vec(),
            &values,
        )?;
        Ok(())
    }

    fn save_summary_stats(&self, iterative: &[f64], raw: &[f64]) -> anyhow::Result<()> {
        let labels = (1..=self.config.n_components)
            .map(|k| format!("PIC{}", k))
            .collect_vec();
        let columns = vec!["Iterative #ieQTLs".to_owned(), "Raw #ieQTLs".to_owned()];
        let mut values = Array2::from_elem((self.config.n_components, 2), f64::NAN);
        for k in 0..self.config.n_components {
            values[[k, 0]] = iterative[k];
            values[[k, 1]] = raw[k];
        }
        io::save_matrix(
            &self.config.output.join("SummaryStats.txt.gz"),
            "",
            &labels,
            &columns,
            &values,
        )?;
        Ok(())
    }
}

/// Last recorded ieQTL count of a resumed component, taken from the `N`
/// column of its `info.txt.gz`.
fn read_final_hits(path: &Path) -> anyhow::Result<Option<f64>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = fs::File::open(path)?;
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_reader(flate2::read::MultiGzDecoder::new(file));
    let n_idx = match rdr.headers()?.iter().position(|h| h == "N") {
        Some(idx) => idx,
        None => return Ok(None),
    };
    let mut last = None;
    for record in rdr.records() {
        let record = record?;
        if let Some(value) = record.get(n_idx) {
            last = value.parse::<f64>().ok();
        }
    }
    Ok(last)
}
