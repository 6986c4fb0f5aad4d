use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Read;

use chrono::NaiveDate;

use crate::grid::{month_start, DateAxis};
use crate::locale::country_name_to_iso2;
use crate::models::{
    ActivityRecord, IntroducedMonthlyAggregate, IntroductionRecord, MonthlyAggregate, Source,
};
use crate::taxonomy::canonicalize;

type MonthKey = (Source, String, String, NaiveDate);

// Months outside the axis are dropped; non-finite counts add zero.
pub fn aggregate_monthly<I>(records: I, axis: &DateAxis) -> Vec<MonthlyAggregate>
where
    I: IntoIterator<Item = ActivityRecord>,
{
    let months: BTreeSet<NaiveDate> = axis.dates().iter().copied().map(month_start).collect();
    let mut sums: BTreeMap<MonthKey, f64> = BTreeMap::new();
    for record in records {
        let month = month_start(record.date);
        if !months.contains(&month) {
            continue;
        }
        let count = if record.count.is_finite() {
            record.count
        } else {
            0.0
        };
        *sums
            .entry((record.source, record.entity, record.locale, month))
            .or_insert(0.0) += count;
    }

    sums.into_iter()
        .map(|((source, entity, locale, month), total_count)| MonthlyAggregate {
            source,
            entity,
            locale,
            month,
            total_count,
        })
        .collect()
}

// Inner join on (entity, locale == country). The earliest introduction year wins.
pub fn join_introductions(
    aggregates: &[MonthlyAggregate],
    introductions: &[IntroductionRecord],
) -> Vec<IntroducedMonthlyAggregate> {
    let mut lookup: HashMap<(String, String), &IntroductionRecord> = HashMap::new();
    for intro in introductions {
        let Some(country) = country_name_to_iso2(&intro.country) else {
            continue;
        };
        let key = (canonicalize(&intro.entity), country.to_string());
        lookup
            .entry(key)
            .and_modify(|existing| {
                if earlier(intro.introduction_year, existing.introduction_year) {
                    *existing = intro;
                }
            })
            .or_insert(intro);
    }

    aggregates
        .iter()
        .filter_map(|agg| {
            let intro = lookup.get(&(agg.entity.clone(), agg.locale.clone()))?;
            Some(IntroducedMonthlyAggregate {
                source: agg.source,
                entity: agg.entity.clone(),
                locale: agg.locale.clone(),
                month: agg.month,
                total_count: agg.total_count,
                introduction_year: intro.introduction_year,
                group: intro.group.clone(),
                habitat: intro.habitat.clone(),
            })
        })
        .collect()
}

fn earlier(candidate: Option<i32>, existing: Option<i32>) -> bool {
    match (candidate, existing) {
        (Some(candidate), Some(existing)) => candidate < existing,
        (Some(_), None) => true,
        _ => false,
    }
}

pub fn read_unified<R: Read>(
    reader: R,
) -> impl Iterator<Item = csv::Result<ActivityRecord>> {
    #[derive(serde::Deserialize)]
    struct Row {
        entity: String,
        locale: String,
        date: NaiveDate,
        count: Option<f64>,
        source: Source,
    }

    csv::Reader::from_reader(reader)
        .into_deserialize::<Row>()
        .map(|row| {
            row.map(|row| ActivityRecord {
                entity: row.entity,
                locale: row.locale,
                date: row.date,
                count: row.count.unwrap_or(0.0),
                source: row.source,
            })
        })
}

pub fn with_unified_records<R, T, F>(reader: R, consume: F) -> csv::Result<T>
where
    R: Read,
    F: FnOnce(&mut dyn Iterator<Item = ActivityRecord>) -> T,
{
    let mut failure = None;
    let mut records = read_unified(reader).map_while(|row| match row {
        Ok(record) => Some(record),
        Err(err) => {
            failure = Some(err);
            None
        }
    });
    let value = consume(&mut records);
    drop(records);
    match failure {
        Some(err) => Err(err),
        None => Ok(value),
    }
}

pub fn read_introductions<R: Read>(reader: R) -> csv::Result<Vec<IntroductionRecord>> {
    csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_reader(reader)
        .into_deserialize()
        .collect()
}
