//! Configuration space: named axes and their cartesian product.
//!
//! Enumeration is row-major over the axis list (the last axis varies
//! fastest). Resumed sweeps rely on this order being identical across runs,
//! so it only depends on the axis declaration order.

use std::collections::HashSet;

use crate::error::{Result, SweepError};
use crate::models::{Axis, Configuration};

#[derive(Debug, Clone, PartialEq)]
pub struct ConfigurationSpace {
    axes: Vec<Axis>,
    total: u64,
}

impl ConfigurationSpace {
    pub fn new(axes: Vec<Axis>) -> Result<Self> {
        let mut seen = HashSet::new();
        let mut total: u64 = 1;
        for axis in &axes {
            if axis.values.is_empty() {
                return Err(SweepError::InvalidSpace(format!(
                    "axis '{}' has no values",
                    axis.name
                )));
            }
            if !seen.insert(axis.name.as_str()) {
                return Err(SweepError::InvalidSpace(format!(
                    "axis '{}' is declared twice",
                    axis.name
                )));
            }
            total = total
                .checked_mul(axis.values.len() as u64)
                .ok_or_else(|| SweepError::InvalidSpace("space size overflows u64".to_string()))?;
        }
        Ok(Self { axes, total })
    }

    /// Axes in declaration order.
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    /// Number of configurations in the space.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Lazy cartesian product. Call again to restart from the beginning.
    pub fn enumerate(&self) -> Enumerate<'_> {
        Enumerate {
            space: self,
            indices: vec![0; self.axes.len()],
            remaining: self.total,
        }
    }
}

/// Iterator over a [`ConfigurationSpace`] in row-major order.
#[derive(Debug, Clone)]
pub struct Enumerate<'a> {
    space: &'a ConfigurationSpace,
    indices: Vec<usize>,
    remaining: u64,
}

impl Enumerate<'_> {
    fn advance(&mut self) {
        for (pos, axis) in self.space.axes.iter().enumerate().rev() {
            self.indices[pos] += 1;
            if self.indices[pos] < axis.values.len() {
                return;
            }
            self.indices[pos] = 0;
        }
    }
}

impl Iterator for Enumerate<'_> {
    type Item = Configuration;

    fn next(&mut self) -> Option<Configuration> {
        if self.remaining == 0 {
            return None;
        }
        let configuration = Configuration::from_pairs(
            self.space
                .axes
                .iter()
                .zip(&self.indices)
                .map(|(axis, &idx)| (axis.name.as_str(), axis.values[idx].as_str())),
        );
        self.remaining -= 1;
        self.advance();
        Some(configuration)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match usize::try_from(self.remaining) {
            Ok(n) => (n, Some(n)),
            Err(_) => (usize::MAX, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn space() -> ConfigurationSpace {
        ConfigurationSpace::new(vec![
            Axis::new("--a", ["1", "2"]),
            Axis::new("--b", ["x", "y", "z"]),
        ])
        .unwrap()
    }

    #[test]
    fn test_total_is_product() {
        assert_eq!(space().total(), 6);
    }

    #[test]
    fn test_enumerate_matches_total() {
        let s = space();
        let all: Vec<_> = s.enumerate().collect();
        assert_eq!(all.len() as u64, s.total());
        for cfg in &all {
            assert_eq!(cfg.len(), s.axes().len());
            assert!(cfg.get("--a").is_some());
            assert!(cfg.get("--b").is_some());
        }
    }

    #[test]
    fn test_last_axis_varies_fastest() {
        let order: Vec<String> = space().enumerate().map(|c| c.to_string()).collect();
        assert_eq!(
            order,
            vec![
                "--a 1 --b x",
                "--a 1 --b y",
                "--a 1 --b z",
                "--a 2 --b x",
                "--a 2 --b y",
                "--a 2 --b z",
            ]
        );
    }

    #[test]
    fn test_enumeration_is_deterministic_and_restartable() {
        let s = space();
        let first: Vec<_> = s.enumerate().collect();
        let second: Vec<_> = s.enumerate().collect();
        assert_eq!(first, second);
    }

    #[test]
    fn test_empty_axis_is_invalid() {
        let err = ConfigurationSpace::new(vec![Axis::new("--a", Vec::<String>::new())]).unwrap_err();
        assert!(matches!(err, SweepError::InvalidSpace(_)));
    }

    #[test]
    fn test_duplicate_axis_is_invalid() {
        let err = ConfigurationSpace::new(vec![Axis::new("--a", ["1"]), Axis::new("--a", ["2"])])
            .unwrap_err();
        assert!(matches!(err, SweepError::InvalidSpace(_)));
    }

    #[test]
    fn test_no_axes_yields_single_empty_configuration() {
        let s = ConfigurationSpace::new(vec![]).unwrap();
        assert_eq!(s.total(), 1);
        let all: Vec<_> = s.enumerate().collect();
        assert_eq!(all.len(), 1);
        assert!(all[0].is_empty());
    }

    #[test]
    fn test_size_hint_is_exact() {
        let s = space();
        let mut it = s.enumerate();
        assert_eq!(it.size_hint(), (6, Some(6)));
        it.next();
        assert_eq!(it.size_hint(), (5, Some(5)));
    }
}
