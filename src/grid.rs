use std::collections::BTreeSet;

use anyhow::bail;
use chrono::{Datelike, Months, NaiveDate};

use crate::merge::SourceTable;
use crate::models::PairKey;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Grid {
    pairs: BTreeSet<PairKey>,
}

impl Grid {
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> std::collections::btree_set::Iter<'_, PairKey> {
        self.pairs.iter()
    }
}

impl FromIterator<PairKey> for Grid {
    fn from_iter<I: IntoIterator<Item = PairKey>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grain {
    Daily,
    Monthly,
}

// Monthly axes hold the first of each month.
#[derive(Debug, Clone, PartialEq)]
pub struct DateAxis {
    grain: Grain,
    dates: Vec<NaiveDate>,
}

impl DateAxis {
    pub fn grain(&self) -> Grain {
        self.grain
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn first(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }
}

pub fn build_grid<'a>(tables: impl IntoIterator<Item = &'a SourceTable>) -> Grid {
    tables
        .into_iter()
        .flat_map(|table| table.pairs().cloned())
        .collect()
}

pub fn build_date_axis(start: NaiveDate, end: NaiveDate, grain: Grain) -> anyhow::Result<DateAxis> {
    if start > end {
        bail!("date axis start {start} is after end {end}");
    }

    let dates = match grain {
        Grain::Daily => start.iter_days().take_while(|date| *date <= end).collect(),
        Grain::Monthly => {
            let first = month_start(start);
            let mut dates = Vec::new();
            let mut current = Some(first);
            while let Some(month) = current.filter(|month| *month <= end) {
                dates.push(month);
                current = month.checked_add_months(Months::new(1));
            }
            dates
        }
    };

    Ok(DateAxis { grain, dates })
}

pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}
