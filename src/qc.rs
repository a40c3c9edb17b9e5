// Copyright 2021-2023 University Medical Center Groningen.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Genotype quality control: per-dataset call rates, genotype-group
//! statistics and the exact Hardy-Weinberg equilibrium test of Wigginton,
//! Cutler and Abecasis (AJHG 2005).

use ndarray::{Array2, Axis, Zip};

/// Quality-control thresholds; a row is kept when it passes all of them.
#[derive(Debug, Clone, Copy)]
pub struct QcThresholds {
    pub call_rate: f64,
    pub hw_pvalue: f64,
    pub maf: f64,
    pub min_group_size: f64,
}

/// Per-row genotype statistics, computed after the call-rate pass.
#[derive(Debug, Clone)]
pub struct GenotypeStats {
    pub n: f64,
    pub nan: f64,
    pub zero: f64,
    pub one: f64,
    pub two: f64,
    pub min_group_size: f64,
    pub hw_pvalue: f64,
    pub allele1: f64,
    pub allele2: f64,
    pub minor_allele: f64,
    pub maf: f64,
}

impl GenotypeStats {
    /// Placeholder row for eQTLs whose genotypes are entirely missing.
    fn all_missing(n_samples: usize) -> Self {
        GenotypeStats {
            n: 0.0,
            nan: n_samples as f64,
            zero: f64::NAN,
            one: f64::NAN,
            two: f64::NAN,
            min_group_size: f64::NAN,
            hw_pvalue: f64::NAN,
            allele1: f64::NAN,
            allele2: f64::NAN,
            minor_allele: f64::NAN,
            maf: f64::NAN,
        }
    }

    pub fn passes(&self, thresholds: &QcThresholds) -> bool {
        self.n >= 6.0
            && self.min_group_size >= thresholds.min_group_size
            && self.hw_pvalue >= thresholds.hw_pvalue
            && self.maf > thresholds.maf
    }
}

/// Compute the per-(row, dataset) call rate and blank out every dataset
/// block that falls below the threshold. Returns the call-rate matrix
/// (eQTLs x datasets); `geno` is updated in place.
pub fn apply_call_rate(
    geno: &mut Array2<f64>,
    dataset_m: &Array2<f64>,
    na_value: f64,
    threshold: f64,
) -> Array2<f64> {
    let groups: Vec<Vec<usize>> = (0..dataset_m.ncols())
        .map(|d| {
            (0..dataset_m.nrows())
                .filter(|&s| dataset_m[[s, d]] > 0.5)
                .collect()
        })
        .collect();

    let mut call_rates = Array2::from_elem((geno.nrows(), dataset_m.ncols()), f64::NAN);
    Zip::from(geno.axis_iter_mut(Axis(0)))
        .and(call_rates.axis_iter_mut(Axis(0)))
        .par_for_each(|mut geno_row, mut rate_row| {
            for (d, group) in groups.iter().enumerate() {
                let called = group.iter().filter(|&&s| geno_row[s] != na_value).count();
                let rate = called as f64 / group.len() as f64;
                rate_row[d] = rate;
                if rate < threshold {
                    for &s in group {
                        geno_row[s] = na_value;
                    }
                }
            }
        });
    call_rates
}

/// Per-row genotype statistics. Dosages are rounded half-to-even before
/// group counting.
pub fn genotype_stats(geno: &Array2<f64>, na_value: f64) -> Vec<GenotypeStats> {
    use ndarray::parallel::prelude::*;

    geno.axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| {
            if row.iter().all(|&v| v == na_value) {
                GenotypeStats::all_missing(row.len())
            } else {
                row_stats(row.iter().cloned(), na_value)
            }
        })
        .collect()
}

fn row_stats(row: impl Iterator<Item = f64>, na_value: f64) -> GenotypeStats {
    let mut nan = 0u64;
    let mut zero = 0u64;
    let mut one = 0u64;
    let mut two = 0u64;
    let mut total = 0usize;
    for value in row {
        total += 1;
        if value == na_value {
            nan += 1;
            continue;
        }
        let rounded = value.round_ties_even();
        if rounded == 0.0 {
            zero += 1;
        } else if rounded == 1.0 {
            one += 1;
        } else if rounded == 2.0 {
            two += 1;
        }
    }
    let n = (total as u64 - nan) as f64;
    let allele1 = 2 * zero + one;
    let allele2 = 2 * two + one;
    let minor_allele = if allele2 < allele1 { 2.0 } else { 0.0 };
    GenotypeStats {
        n,
        nan: nan as f64,
        zero: zero as f64,
        one: one as f64,
        two: two as f64,
        min_group_size: zero.min(one).min(two) as f64,
        hw_pvalue: hwe_exact(one, zero, two),
        allele1: allele1 as f64,
        allele2: allele2 as f64,
        minor_allele,
        maf: allele1.min(allele2) as f64 / (allele1 + allele2) as f64,
    }
}

/// Exact SNP test of Hardy-Weinberg equilibrium (Wigginton, Cutler and
/// Abecasis, AJHG 76: 887-893).
pub fn hwe_exact(obs_hets: u64, obs_hom1: u64, obs_hom2: u64) -> f64 {
    let obs_homc = obs_hom1.max(obs_hom2);
    let obs_homr = obs_hom1.min(obs_hom2);
    let rare_copies = 2 * obs_homr + obs_hets;
    let genotypes = obs_hets + obs_homc + obs_homr;
    if genotypes == 0 {
        return f64::NAN;
    }

    // Distribution midpoint, forced to the parity of the rare allele count.
    let mut mid = ((rare_copies * (2 * genotypes - rare_copies)) as f64
        / (2 * genotypes) as f64)
        .round_ties_even() as u64;
    if mid % 2 != rare_copies % 2 {
        mid += 1;
    }

    let mut het_probs = vec![0.0_f64; rare_copies as usize + 1];
    het_probs[mid as usize] = 1.0;
    let mut sum = 1.0;

    let mut curr_hets = mid;
    let mut curr_homr = (rare_copies - mid) / 2;
    let mut curr_homc = genotypes - mid - curr_homr;
    while curr_hets >= 2 {
        let prob = het_probs[curr_hets as usize] * (curr_hets * (curr_hets - 1)) as f64
            / (4 * (curr_homr + 1) * (curr_homc + 1)) as f64;
        het_probs[curr_hets as usize - 2] = prob;
        sum += prob;
        curr_hets -= 2;
        curr_homr += 1;
        curr_homc += 1;
    }

    let mut curr_hets = mid;
    let mut curr_homr = (rare_copies - mid) / 2;
    let mut curr_homc = genotypes - mid - curr_homr;
    while curr_hets + 2 <= rare_copies {
        let prob = het_probs[curr_hets as usize] * (4 * curr_homr * curr_homc) as f64
            / ((curr_hets + 2) * (curr_hets + 1)) as f64;
        het_probs[curr_hets as usize + 2] = prob;
        sum += prob;
        curr_hets += 2;
        curr_homr -= 1;
        curr_homc -= 1;
    }

    let threshold = het_probs[obs_hets as usize] / sum;
    let p: f64 = het_probs
        .iter()
        .map(|&prob| prob / sum)
        .filter(|&prob| prob <= threshold)
        .sum();
    p.min(1.0)
}
