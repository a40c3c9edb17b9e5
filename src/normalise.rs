// Copyright 2021-2023 University Medical Center Groningen.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! Force-normalisation: within every dataset, each row is converted to ranks
//! and mapped through the standard-normal quantile function, equalising the
//! marginal distribution per dataset.

use ndarray::{Array2, Axis, Zip};
use statrs::distribution::{ContinuousCDF, Normal};

/// Per-dataset rank to inverse-normal transformer. Sample-to-dataset
/// membership is fixed at construction from the dataset indicator matrix.
#[derive(Debug, Clone)]
pub struct ForceNormaliser {
    groups: Vec<Vec<usize>>,
    normal: Normal,
}

impl ForceNormaliser {
    /// `dataset_m` is the (samples x datasets) one-hot indicator matrix.
    pub fn new(dataset_m: &Array2<f64>) -> Self {
        let groups = (0..dataset_m.ncols())
            .map(|d| {
                (0..dataset_m.nrows())
                    .filter(|&s| dataset_m[[s, d]] > 0.5)
                    .collect()
            })
            .collect();
        ForceNormaliser {
            groups,
            normal: Normal::new(0.0, 1.0).expect("unit normal"),
        }
    }

    /// Normalise every row of `m` in place, one dataset group at a time.
    /// NaN cells are left untouched; the rank denominator stays the full
    /// group size.
    pub fn process_matrix(&self, m: &mut Array2<f64>) {
        Zip::from(m.axis_iter_mut(Axis(0))).par_for_each(|mut row| {
            let mut values: Vec<f64> = row.iter().cloned().collect();
            self.normalise_groups(&mut values);
            for (cell, value) in row.iter_mut().zip(values) {
                *cell = value;
            }
        });
    }

    /// Normalise a single vector (e.g. the candidate context) in place.
    pub fn process_vector(&self, values: &mut [f64]) {
        self.normalise_groups(values);
    }

    fn normalise_groups(&self, values: &mut [f64]) {
        for group in &self.groups {
            self.normalise_group(values, group);
        }
    }

    fn normalise_group(&self, values: &mut [f64], group: &[usize]) {
        if group.is_empty() {
            return;
        }
        let size = group.len() as f64;

        let mut present: Vec<(usize, f64)> = group
            .iter()
            .map(|&s| (s, values[s]))
            .filter(|(_, v)| !v.is_nan())
            .collect();
        present.sort_by(|a, b| a.1.partial_cmp(&b.1).expect("no NaN after filter"));

        // Average ranks over ties, 1-based.
        let mut i = 0;
        while i < present.len() {
            let mut j = i;
            while j + 1 < present.len() && present[j + 1].1 == present[i].1 {
                j += 1;
            }
            let rank = (i + j + 2) as f64 / 2.0;
            let quantile = self.normal.inverse_cdf((rank - 0.5) / size);
            for item in &present[i..=j] {
                values[item.0] = quantile;
            }
            i = j + 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_relative_eq;
    use ndarray::array;

    fn two_datasets() -> Array2<f64> {
        // Samples 0..3 in dataset A, 3..6 in dataset B.
        array![
            [1.0, 0.0],
            [1.0, 0.0],
            [1.0, 0.0],
            [0.0, 1.0],
            [0.0, 1.0],
            [0.0, 1.0]
        ]
    }

    #[test]
    fn ranks_map_to_normal_quantiles() {
        let fnorm = ForceNormaliser::new(&two_datasets());
        let mut v = vec![3.0, 1.0, 2.0, 10.0, -5.0, 0.0];
        fnorm.process_vector(&mut v);

        // Quantiles of (rank - 0.5) / 3 for ranks 1..3.
        let hi = 0.9674215661017014;
        assert_relative_eq!(v[0], hi, epsilon = 1e-9);
        assert_relative_eq!(v[1], -hi, epsilon = 1e-9);
        assert_relative_eq!(v[2], 0.0, epsilon = 1e-12);
        // The second dataset is ranked independently.
        assert_relative_eq!(v[3], hi, epsilon = 1e-9);
        assert_relative_eq!(v[4], -hi, epsilon = 1e-9);
    }

    #[test]
    fn ties_share_the_average_rank() {
        let fnorm = ForceNormaliser::new(&array![[1.0], [1.0], [1.0], [1.0]]);
        let mut v = vec![5.0, 5.0, 1.0, 9.0];
        fnorm.process_vector(&mut v);
        // Tied values take rank 2.5 of 4.
        assert_relative_eq!(v[0], v[1], epsilon = 1e-15);
        assert!(v[2] < v[0] && v[0] < v[3]);
        let expected = Normal::new(0.0, 1.0).unwrap().inverse_cdf(2.0 / 4.0);
        assert_relative_eq!(v[0], expected, epsilon = 1e-12);
    }

    #[test]
    fn nan_cells_survive_and_keep_full_denominator() {
        let fnorm = ForceNormaliser::new(&array![[1.0], [1.0], [1.0], [1.0]]);
        let mut m = array![[2.0, f64::NAN, 1.0, 3.0]];
        fnorm.process_matrix(&mut m);
        assert!(m[[0, 1]].is_nan());
        // Ranks 1..3 over denominator 4: top value maps to quantile of
        // 2.5 / 4, not of 2.5 / 3.
        let expected = Normal::new(0.0, 1.0).unwrap().inverse_cdf(2.5 / 4.0);
        assert_relative_eq!(m[[0, 3]], expected, epsilon = 1e-12);
    }

    #[test]
    fn per_row_mean_is_centred() {
        let fnorm = ForceNormaliser::new(&two_datasets());
        let mut m = array![[0.3, -1.2, 4.5, 2.2, 2.1, -0.4]];
        fnorm.process_matrix(&mut m);
        let mean: f64 = m.row(0).iter().sum::<f64>() / 6.0;
        assert_relative_eq!(mean, 0.0, epsilon = 1e-12);
    }
}
