// Copyright 2021-2023 University Medical Center Groningen.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! The per-component optimisation loop: starting from a seed context, the
//! significant ieQTL set is re-estimated and the context re-derived as the
//! joint maximum-likelihood vertex until the vector stabilises, oscillates,
//! or degenerates.

use std::collections::HashSet;
use std::path::Path;

use derive_builder::Builder;
use itertools::Itertools;
use log::{error, info, warn};
use ndarray::Array2;

use crate::correction::remove_covariates_elementwise;
use crate::errors::Result;
use crate::io::{self, EqtlRecord};
use crate::mapping::{self, Mapping, INTERACTION_TABLE_HEADER};
use crate::normalise::ForceNormaliser;
use crate::stats;

/// Result of one component: the optimised context (None when the component
/// degenerated at iteration 0), the ieQTL count of the final mapping, and
/// whether the driver should stop because convergence was not reached.
#[derive(Debug)]
pub struct OptimizeOutcome {
    pub component: Option<Vec<f64>>,
    pub n_hits: usize,
    pub stop: bool,
}

#[derive(Debug, Clone, Builder)]
#[builder(pattern = "owned")]
pub struct InteractionOptimizer {
    covariates: Vec<String>,
    samples: Vec<String>,
    normaliser: ForceNormaliser,
    ieqtl_alpha: f64,
    min_iter: usize,
    max_iter: usize,
    tol: f64,
}

/// One recorded iteration of the metrics table.
#[derive(Debug, Clone)]
struct InfoRow {
    n_hits: f64,
    min_hits_per_sample: f64,
    n_overlap: f64,
    pct_overlap: f64,
    sum_abs_norm_delta_ll: f64,
    pearson_r: f64,
}

/// Pick the seed covariate: most significant ieQTLs wins, ties broken by the
/// higher minimum per sample; candidates with a minimum below 2 are out.
pub fn select_candidate(candidate_stats: &[(usize, usize)]) -> Option<usize> {
    let mut best = None;
    let mut best_hits = 0;
    let mut best_min = 0;
    for (idx, &(hits, min_per_sample)) in candidate_stats.iter().enumerate() {
        if min_per_sample >= 2
            && (hits > best_hits || (hits == best_hits && min_per_sample > best_min))
        {
            best = Some(idx);
            best_hits = hits;
            best_min = min_per_sample;
        }
    }
    best
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OscillationAction {
    RollBack,
    KeepCurrent,
}

/// Decide what to do once the oscillation detector fires. Roll back when
/// only the look-behind comparison converged, or when both did but the
/// earlier iteration had the larger significant set.
pub fn oscillation_action(
    current_converged: bool,
    previous_converged: bool,
    previous_hits: usize,
    current_hits: usize,
) -> Option<OscillationAction> {
    if !current_converged && !previous_converged {
        return None;
    }
    if (!current_converged && previous_converged)
        || (current_converged && previous_converged && previous_hits > current_hits)
    {
        Some(OscillationAction::RollBack)
    } else {
        Some(OscillationAction::KeepCurrent)
    }
}

impl InteractionOptimizer {
    /// Residualise the expression element-wise against [1, g, context],
    /// force-normalise both sides, and map the significant ieQTLs.
    fn map_context(
        &self,
        eqtls: &[EqtlRecord],
        geno_m: &Array2<f64>,
        expr_m: &Array2<f64>,
        context: &[f64],
        covariate: &str,
    ) -> Mapping {
        let mut resid_m = remove_covariates_elementwise(expr_m, geno_m, context);
        self.normaliser.process_matrix(&mut resid_m);
        let mut fn_context = context.to_vec();
        self.normaliser.process_vector(&mut fn_context);
        mapping::find_ieqtls(
            eqtls,
            geno_m,
            &resid_m,
            &fn_context,
            covariate,
            self.ieqtl_alpha,
        )
    }

    /// Run the iteration loop for one component. `covs_m` holds the seed
    /// candidates (one per row); with more than one row the best candidate
    /// is selected at iteration 0.
    pub fn process(
        &self,
        eqtls: &[EqtlRecord],
        geno_m: &Array2<f64>,
        expr_m: &Array2<f64>,
        covs_m: &Array2<f64>,
        outdir: &Path,
    ) -> Result<OptimizeOutcome> {
        let n_samples = geno_m.ncols();
        let mut context: Option<Vec<f64>> = None;
        let mut cov_name: Option<String> = None;
        let mut n_hits = 0usize;
        let mut stop = true;
        let mut prev_hits = 0usize;
        let mut prev_ids: HashSet<usize> = HashSet::new();
        let mut n_performed = 0usize;
        let mut iterations: Vec<Vec<f64>> = Vec::new();
        let mut hits_rows: Vec<Vec<usize>> = Vec::new();
        let mut info_rows: Vec<InfoRow> = Vec::new();

        for iteration in 0..self.max_iter {
            info!("\t\tIteration: {}", iteration);

            if iteration == 0 && covs_m.nrows() == 1 {
                context = Some(covs_m.row(0).to_vec());
                cov_name = Some(self.covariates[0].clone());
            }

            let mapping = if context.is_none() {
                info!("\t\t  Finding the covariate that has the most ieQTLs without optimization");
                let mut candidate_stats = Vec::with_capacity(self.covariates.len());
                let mut mappings = Vec::with_capacity(self.covariates.len());
                for (idx, name) in self.covariates.iter().enumerate() {
                    let candidate = covs_m.row(idx).to_vec();
                    let candidate_mapping =
                        self.map_context(eqtls, geno_m, expr_m, &candidate, name);
                    info!(
                        "\t\t\tCovariate: '{}' has {} significant ieQTLs [min {} per sample]",
                        name, candidate_mapping.n_hits, candidate_mapping.min_hits_per_sample
                    );
                    candidate_stats
                        .push((candidate_mapping.n_hits, candidate_mapping.min_hits_per_sample));
                    mappings.push(candidate_mapping);
                }

                let best = match select_candidate(&candidate_stats) {
                    Some(best) => best,
                    None => {
                        warn!("\t\t  No valid covariate found");
                        return Ok(OptimizeOutcome {
                            component: None,
                            n_hits: 0,
                            stop: false,
                        });
                    }
                };
                info!(
                    "\t\t  Covariate '{}' will be used for this component.",
                    self.covariates[best]
                );
                io::save_table(
                    &outdir.join("covariate_selection.txt.gz"),
                    &["Covariate", "N-ieQTLs"],
                    self.covariates
                        .iter()
                        .zip(candidate_stats.iter())
                        .map(|(name, &(hits, _))| vec![name.clone(), hits.to_string()]),
                )?;

                context = Some(covs_m.row(best).to_vec());
                cov_name = Some(self.covariates[best].clone());
                mappings.swap_remove(best)
            } else {
                info!("\t\t  Finding ieQTLs");
                let current = context.as_ref().expect("context is set");
                let name = cov_name.as_deref().expect("covariate is named");
                let single_mapping = self.map_context(eqtls, geno_m, expr_m, current, name);
                info!(
                    "\t\t\tCovariate: '{}' has {} significant ieQTLs [min {} per sample]",
                    name, single_mapping.n_hits, single_mapping.min_hits_per_sample
                );
                single_mapping
            };

            io::save_table(
                &outdir.join(results_file_name(iteration, self.max_iter)),
                &INTERACTION_TABLE_HEADER,
                mapping.table.iter().cloned(),
            )?;

            n_hits = mapping.n_hits;
            if mapping.n_hits <= 1 {
                error!("\t\t  None or not enough significant ieQTLs found");
                if iteration == 0 {
                    context = None;
                    stop = false;
                }
                break;
            }
            if mapping.min_hits_per_sample <= 1 {
                error!("\t\t  Some samples have no or not enough ieQTLs for optimization");
                if iteration == 0 {
                    context = None;
                    stop = false;
                }
                break;
            }

            info!("\t\t  Optimizing ieQTLs");
            let current = context.clone().expect("context is set");
            let optimized = optimize_ieqtls(&mapping, n_samples);

            if iteration == 0 {
                iterations.push(current.clone());
            }
            iterations.push(optimized.clone());
            hits_rows.push(mapping.hits_per_sample.clone());

            // Total log-likelihood change induced by moving the context to
            // the joint vertex, normalised per ieQTL.
            let mut sum_abs_norm_delta_ll = 0.0;
            for ieqtl in &mapping.ieqtls {
                let pre = ieqtl.log_likelihood(&current);
                let post = ieqtl.log_likelihood(&optimized);
                sum_abs_norm_delta_ll += (post - pre).abs() / pre.abs();
            }
            info!(
                "\t\t\tSum absolute normalized delta log likelihood: {:.2e}",
                sum_abs_norm_delta_ll
            );

            let pearson = stats::pearson_r(&current, &optimized);
            info!("\t\t\tPearson r: {:.6}", pearson);

            let ids: HashSet<usize> = mapping.ieqtls.iter().map(|q| q.row).collect();
            let (n_overlap, pct_overlap) = if prev_ids.is_empty() {
                (f64::NAN, f64::NAN)
            } else {
                let overlap = prev_ids.intersection(&ids).count();
                let pct = 100.0 / prev_hits as f64 * overlap as f64;
                info!(
                    "\t\t\tOverlap in included ieQTL(s): {} [{:.2}%]",
                    overlap, pct
                );
                (overlap as f64, pct)
            };

            info_rows.push(InfoRow {
                n_hits: n_hits as f64,
                min_hits_per_sample: mapping.min_hits_per_sample as f64,
                n_overlap,
                pct_overlap,
                sum_abs_norm_delta_ll,
                pearson_r: pearson,
            });

            // Oscillation detection: compare against the contexts from two
            // and three optimisation steps back.
            if iteration >= 3 && iteration >= self.min_iter {
                let r_current = stats::pearson_r(&iterations[iteration - 1], &iterations[iteration + 1]);
                let r_previous = stats::pearson_r(&iterations[iteration - 2], &iterations[iteration]);
                info!(
                    "\t\t\titeration{} vs iteration{}:\tr = {:.6}",
                    iteration,
                    iteration - 2,
                    r_current
                );
                info!(
                    "\t\t\titeration{} vs iteration{}:\tr = {:.6}",
                    iteration - 1,
                    iteration.saturating_sub(3),
                    r_previous
                );

                let current_converged = (1.0 - r_current) < self.tol;
                let previous_converged = (1.0 - r_previous) < self.tol;
                if let Some(action) =
                    oscillation_action(current_converged, previous_converged, prev_hits, n_hits)
                {
                    warn!("\t\tIterations are oscillating");
                    match action {
                        OscillationAction::RollBack => {
                            warn!("\t\t  Rolling back to previous iteration");
                            context = Some(iterations[iteration].clone());
                            n_hits = prev_hits;
                        }
                        OscillationAction::KeepCurrent => {
                            context = Some(optimized);
                            n_performed += 1;
                        }
                    }
                    warn!("\t\tModel converged");
                    stop = false;
                    break;
                }
            }

            context = Some(optimized);
            prev_hits = n_hits;
            prev_ids = ids;
            n_performed += 1;

            if n_performed >= self.min_iter && (1.0 - pearson) < self.tol {
                warn!("\t\tModel converged");
                stop = false;
                break;
            }
        }

        self.save_overview(
            outdir,
            &iterations,
            &hits_rows,
            &info_rows,
            n_performed,
            cov_name.as_deref(),
        )?;

        Ok(OptimizeOutcome {
            component: context,
            n_hits,
            stop,
        })
    }

    fn save_overview(
        &self,
        outdir: &Path,
        iterations: &[Vec<f64>],
        hits_rows: &[Vec<usize>],
        info_rows: &[InfoRow],
        n_performed: usize,
        cov_name: Option<&str>,
    ) -> Result<()> {
        if !iterations.is_empty() {
            let kept = &iterations[..n_performed + 1];
            let mut labels = vec!["start".to_owned()];
            labels.extend((0..n_performed).map(|i| format!("iteration{}", i)));
            let values = rows_to_array(kept);
            io::save_matrix(
                &outdir.join("iteration.txt.gz"),
                "",
                &labels,
                &self.samples,
                &values,
            )?;
        }

        if n_performed > 0 {
            let labels = (0..n_performed)
                .map(|i| format!("iteration{}", i))
                .collect_vec();
            let hits = hits_rows[..n_performed]
                .iter()
                .map(|row| row.iter().map(|&h| h as f64).collect_vec())
                .collect_vec();
            io::save_matrix(
                &outdir.join("n_hits_per_sample.txt.gz"),
                "",
                &labels,
                &self.samples,
                &rows_to_array(&hits),
            )?;

            let covariate = cov_name.unwrap_or("");
            io::save_table(
                &outdir.join("info.txt.gz"),
                &[
                    "",
                    "covariate",
                    "N",
                    "min N per sample",
                    "N Overlap",
                    "Overlap %",
                    "Sum Abs Normalized Delta Log Likelihood",
                    "Pearson r",
                ],
                info_rows[..n_performed].iter().enumerate().map(|(i, row)| {
                    vec![
                        format!("iteration{}", i),
                        covariate.to_owned(),
                        io::format_cell(row.n_hits),
                        io::format_cell(row.min_hits_per_sample),
                        io::format_cell(row.n_overlap),
                        io::format_cell(row.pct_overlap),
                        io::format_cell(row.sum_abs_norm_delta_ll),
                        io::format_cell(row.pearson_r),
                    ]
                }),
            )?;
        }
        Ok(())
    }
}

/// Element-wise sum of the per-ieQTL quadratic coefficients, in eQTL order
/// so the reduction stays deterministic, followed by the joint vertex.
fn optimize_ieqtls(mapping: &Mapping, n_samples: usize) -> Vec<f64> {
    let mut a_sum = vec![0.0; n_samples];
    let mut b_sum = vec![0.0; n_samples];
    for ieqtl in &mapping.ieqtls {
        let (a, b) = ieqtl.coefficients(n_samples);
        for s in 0..n_samples {
            a_sum[s] += a[s];
            b_sum[s] += b[s];
        }
    }
    stats::vertex_xpos(&a_sum, &b_sum)
}

fn results_file_name(iteration: usize, max_iter: usize) -> String {
    let width = max_iter.to_string().len() - 1;
    format!("results_iteration{:0width$}.txt.gz", iteration, width = width)
}

fn rows_to_array(rows: &[Vec<f64>]) -> Array2<f64> {
    let ncols = rows.first().map_or(0, |r| r.len());
    let flat: Vec<f64> = rows.iter().flatten().cloned().collect();
    Array2::from_shape_vec((rows.len(), ncols), flat).expect("rectangular rows")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_selection_prefers_hits_then_min_per_sample() {
        // Hit counts (12, 47, 9) with minima (3, 5, 0): candidate 1 wins.
        assert_eq!(select_candidate(&[(12, 3), (47, 5), (9, 0)]), Some(1));
        // A candidate below 2 ieQTLs per sample is never eligible.
        assert_eq!(select_candidate(&[(100, 1), (10, 2)]), Some(1));
        // Ties break on the larger minimum.
        assert_eq!(select_candidate(&[(47, 3), (47, 5)]), Some(1));
        assert_eq!(select_candidate(&[(47, 5), (47, 3)]), Some(0));
        // Nothing eligible.
        assert_eq!(select_candidate(&[(0, 0), (5, 1)]), None);
    }

    #[test]
    fn oscillation_rollback_rules() {
        // Not oscillating at all.
        assert_eq!(oscillation_action(false, false, 10, 5), None);
        // Only the look-behind comparison converged: roll back.
        assert_eq!(
            oscillation_action(false, true, 10, 5),
            Some(OscillationAction::RollBack)
        );
        // Both converged, earlier iteration had more hits: roll back.
        assert_eq!(
            oscillation_action(true, true, 10, 5),
            Some(OscillationAction::RollBack)
        );
        // Both converged, current has at least as many hits: keep it.
        assert_eq!(
            oscillation_action(true, true, 5, 10),
            Some(OscillationAction::KeepCurrent)
        );
        assert_eq!(
            oscillation_action(true, false, 10, 5),
            Some(OscillationAction::KeepCurrent)
        );
    }

    #[test]
    fn results_file_names_follow_max_iter_width() {
        assert_eq!(results_file_name(0, 100), "results_iteration00.txt.gz");
        assert_eq!(results_file_name(42, 100), "results_iteration42.txt.gz");
        assert_eq!(results_file_name(3, 10), "results_iteration3.txt.gz");
        assert_eq!(results_file_name(7, 1000), "results_iteration007.txt.gz");
    }
}
