use std::ops::Deref;

/// Sorted copy of a sample, used for robust statistics
///
/// NaN values are not allowed, they are sorted with [f64::total_cmp] and would end up at the
/// tail of the array
#[derive(Clone, Debug, PartialEq)]
pub struct SortedArray(Vec<f64>);

impl SortedArray {
    pub fn maximum(&self) -> f64 {
        self.0[self.len() - 1]
    }

    pub fn median(&self) -> f64 {
        assert_ne!(self.len(), 0);
        let i = (self.len() - 1) / 2;
        if self.len() % 2 == 0 {
            0.5 * (self.0[i] + self.0[i + 1])
        } else {
            self.0[i]
        }
    }

    /// Median absolute deviation from the median, unscaled
    pub fn median_absolute_deviation(&self) -> f64 {
        let median = self.median();
        let deviations: SortedArray = self.iter().map(|x| (x - median).abs()).collect();
        deviations.median()
    }
}

impl From<Vec<f64>> for SortedArray {
    fn from(mut v: Vec<f64>) -> Self {
        v.sort_unstable_by(f64::total_cmp);
        Self(v)
    }
}

impl FromIterator<f64> for SortedArray {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Self {
        iter.into_iter().collect::<Vec<_>>().into()
    }
}

impl Deref for SortedArray {
    type Target = [f64];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
