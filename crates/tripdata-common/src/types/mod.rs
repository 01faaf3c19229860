//! Common types used across the tripdata workspace

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CommonError;

/// A calendar month, the partitioning unit of the monthly trip datasets.
///
/// Ordered chronologically; parsed from and displayed as `YYYY-MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    /// Create a year-month, rejecting months outside 1..=12
    pub fn new(year: i32, month: u32) -> Result<Self, CommonError> {
        if !(1..=12).contains(&month) || !(1..=9999).contains(&year) {
            return Err(CommonError::InvalidYearMonth(format!("{}-{}", year, month)));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// The following calendar month
    pub fn succ(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Compact `YYYYMM` form used in run identifiers
    pub fn compact(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    /// Iterate every month from `from` to `to`, both inclusive.
    ///
    /// Yields nothing when `from > to`.
    pub fn range(from: YearMonth, to: YearMonth) -> YearMonthRange {
        YearMonthRange {
            next: Some(from),
            end: to,
        }
    }
}

impl std::fmt::Display for YearMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl std::str::FromStr for YearMonth {
    type Err = CommonError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CommonError::InvalidYearMonth(s.to_string());

        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;

        YearMonth::new(year, month).map_err(|_| invalid())
    }
}

impl Serialize for YearMonth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for YearMonth {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive iterator over consecutive months
#[derive(Debug, Clone)]
pub struct YearMonthRange {
    next: Option<YearMonth>,
    end: YearMonth,
}

impl Iterator for YearMonthRange {
    type Item = YearMonth;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next.filter(|ym| *ym <= self.end)?;
        self.next = Some(current.succ());
        Some(current)
    }
}
