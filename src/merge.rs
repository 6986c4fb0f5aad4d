use std::collections::btree_map::{self, BTreeMap};
use std::io::Write;

use chrono::NaiveDate;
use tracing::info;

use crate::grid::{DateAxis, Grid};
use crate::models::{ActivityRecord, PairKey, ResolvedRecord, Source};

#[derive(Debug, Clone, PartialEq)]
pub struct SourceTable {
    source: Source,
    series: BTreeMap<PairKey, BTreeMap<NaiveDate, f64>>,
}

impl SourceTable {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            series: BTreeMap::new(),
        }
    }

    pub fn source(&self) -> Source {
        self.source
    }

    // Synonym collapse and language expansion land on one key; sum them.
    pub fn insert(&mut self, record: ResolvedRecord) {
        *self
            .series
            .entry(PairKey::new(record.entity, record.locale))
            .or_default()
            .entry(record.date)
            .or_insert(0.0) += record.count;
    }

    pub fn absorb(&mut self, other: SourceTable) {
        for (key, dates) in other.series {
            let target = self.series.entry(key).or_default();
            for (date, count) in dates {
                *target.entry(date).or_insert(0.0) += count;
            }
        }
    }

    pub fn pairs(&self) -> impl Iterator<Item = &PairKey> {
        self.series.keys()
    }

    pub fn pair_count(&self) -> usize {
        self.series.len()
    }

    pub fn cell_count(&self) -> usize {
        self.series.values().map(BTreeMap::len).sum()
    }
}

pub struct PaddedRows<'a> {
    table: &'a SourceTable,
    pairs: std::collections::btree_set::Iter<'a, PairKey>,
    dates: &'a [NaiveDate],
    current: Option<(&'a PairKey, Option<&'a BTreeMap<NaiveDate, f64>>)>,
    position: usize,
}

impl Iterator for PaddedRows<'_> {
    type Item = ActivityRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.dates.is_empty() {
            return None;
        }
        loop {
            if let Some((key, series)) = self.current {
                if let Some(&date) = self.dates.get(self.position) {
                    self.position += 1;
                    let count = series.and_then(|series| series.get(&date)).copied();
                    return Some(ActivityRecord {
                        entity: key.entity.clone(),
                        locale: key.locale.clone(),
                        date,
                        count: count.unwrap_or(0.0),
                        source: self.table.source,
                    });
                }
            }
            let key = self.pairs.next()?;
            self.current = Some((key, self.table.series.get(key)));
            self.position = 0;
        }
    }
}

// Absent cells get zero. Pairs outside the grid and dates outside the axis are dropped.
pub fn pad<'a>(table: &'a SourceTable, grid: &'a Grid, axis: &'a DateAxis) -> PaddedRows<'a> {
    PaddedRows {
        table,
        pairs: grid.iter(),
        dates: axis.dates(),
        current: None,
        position: 0,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnifySummary {
    pub sources: usize,
    pub rows: usize,
    pub non_zero: usize,
}

// Every platform is written, in tag order, including ones with no extract.
pub fn unify<W: Write>(
    tables: Vec<SourceTable>,
    grid: &Grid,
    axis: &DateAxis,
    writer: &mut csv::Writer<W>,
) -> anyhow::Result<UnifySummary> {
    let mut by_source: BTreeMap<Source, SourceTable> = BTreeMap::new();
    for table in tables {
        match by_source.entry(table.source()) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(table);
            }
            btree_map::Entry::Occupied(mut slot) => slot.get_mut().absorb(table),
        }
    }

    let mut summary = UnifySummary::default();
    for source in Source::ALL {
        let table = by_source
            .remove(&source)
            .unwrap_or_else(|| SourceTable::new(source));
        let mut rows = 0usize;
        for record in pad(&table, grid, axis) {
            if record.count != 0.0 {
                summary.non_zero += 1;
            }
            writer.serialize(&record)?;
            rows += 1;
        }
        info!(source = %table.source(), rows, "padded source onto grid");
        summary.rows += rows;
        summary.sources += 1;
    }
    writer.flush()?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::{build_date_axis, build_grid, Grain};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn record(entity: &str, locale: &str, date: NaiveDate, count: f64) -> ResolvedRecord {
        ResolvedRecord {
            entity: entity.to_string(),
            locale: locale.to_string(),
            date,
            count,
        }
    }

    fn sample_tables() -> Vec<SourceTable> {
        let mut gbif = SourceTable::new(Source::Gbif);
        gbif.insert(record("Procyon lotor", "DE", date(2024, 1, 2), 3.5));
        gbif.insert(record("Procyon lotor", "DE", date(2024, 1, 9), 7.0));

        let mut flickr = SourceTable::new(Source::Flickr);
        flickr.insert(record("Vespa velutina", "FR", date(2024, 1, 1), 2.0));
        flickr.insert(record("Vespa velutina", "FR", date(2024, 1, 1), 1.0));
        flickr.insert(record("Procyon lotor", "AT", date(2024, 1, 3), 11.0));

        vec![gbif, flickr]
    }

    fn unify_to_rows(tables: Vec<SourceTable>, grid: &Grid, axis: &DateAxis) -> Vec<ActivityRecord> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        unify(tables, grid, axis, &mut writer).unwrap();
        let bytes = writer.into_inner().unwrap();
        csv::Reader::from_reader(bytes.as_slice())
            .deserialize()
            .collect::<Result<_, _>>()
            .unwrap()
    }

    #[test]
    fn every_source_spans_the_full_grid_without_duplicates() {
        let tables = sample_tables();
        let grid = build_grid(&tables);
        let axis = build_date_axis(date(2024, 1, 1), date(2024, 1, 5), Grain::Daily).unwrap();
        assert_eq!(grid.len(), 3);

        for table in &tables {
            let rows: Vec<_> = pad(table, &grid, &axis).collect();
            assert_eq!(rows.len(), grid.len() * axis.len());
            let keys: HashSet<_> = rows
                .iter()
                .map(|row| (row.entity.clone(), row.locale.clone(), row.date))
                .collect();
            assert_eq!(keys.len(), rows.len());
        }

        let rows = unify_to_rows(tables, &grid, &axis);
        assert_eq!(rows.len(), Source::ALL.len() * grid.len() * axis.len());
    }

    #[test]
    fn sources_without_an_extract_are_padded_with_zeroes() {
        let mut gbif = SourceTable::new(Source::Gbif);
        gbif.insert(record("Procyon lotor", "DE", date(2024, 1, 4), 2.0));
        let tables = vec![gbif];
        let grid = build_grid(&tables);
        let axis = build_date_axis(date(2024, 1, 1), date(2024, 1, 10), Grain::Daily).unwrap();

        let mut writer = csv::Writer::from_writer(Vec::new());
        let summary = unify(tables, &grid, &axis, &mut writer).unwrap();
        assert_eq!(summary.rows, 80);
        assert_eq!(summary.sources, 8);
        assert_eq!(summary.non_zero, 1);

        let bytes = writer.into_inner().unwrap();
        let rows: Vec<ActivityRecord> = csv::Reader::from_reader(bytes.as_slice())
            .deserialize()
            .collect::<Result<_, _>>()
            .unwrap();
        for source in Source::ALL {
            let of_source: Vec<_> = rows.iter().filter(|row| row.source == source).collect();
            assert_eq!(of_source.len(), 10);
            if source != Source::Gbif {
                assert!(of_source.iter().all(|row| row.count == 0.0));
            }
        }
    }

    #[test]
    fn padding_preserves_values_and_fills_zeroes() {
        let tables = sample_tables();
        let grid = build_grid(&tables);
        let axis = build_date_axis(date(2024, 1, 1), date(2024, 1, 5), Grain::Daily).unwrap();
        let rows: Vec<_> = pad(&tables[0], &grid, &axis).collect();

        let de: Vec<f64> = rows
            .iter()
            .filter(|row| row.locale == "DE")
            .map(|row| row.count)
            .collect();
        assert_eq!(de, vec![0.0, 3.5, 0.0, 0.0, 0.0]);
        assert!(rows.iter().all(|row| row.source == Source::Gbif));

        let flickr_first = tables[1].series[&PairKey::new("Vespa velutina", "FR")][&date(2024, 1, 1)];
        assert_eq!(flickr_first, 3.0);
    }

    #[test]
    fn single_date_axis_and_empty_grid() {
        let tables = sample_tables();
        let grid = build_grid(&tables);
        let axis = build_date_axis(date(2024, 1, 1), date(2024, 1, 1), Grain::Daily).unwrap();
        assert_eq!(pad(&tables[0], &grid, &axis).count(), grid.len());
        assert_eq!(pad(&tables[0], &Grid::default(), &axis).count(), 0);
    }

    #[test]
    fn unify_is_independent_of_source_order() {
        let grid = build_grid(&sample_tables());
        let axis = build_date_axis(date(2024, 1, 1), date(2024, 1, 10), Grain::Daily).unwrap();
        let forward = unify_to_rows(sample_tables(), &grid, &axis);
        let mut reversed_tables = sample_tables();
        reversed_tables.reverse();
        let reversed = unify_to_rows(reversed_tables, &grid, &axis);
        assert_eq!(forward, reversed);
    }

    proptest! {
        #[test]
        fn join_order_invariance(
            cells in prop::collection::vec((0usize..3, 0usize..2, 0i64..20, 0u32..50, 0usize..4), 0..60),
            seed in any::<u64>(),
        ) {
            let entities = ["Procyon lotor", "Vespa velutina", "Sciurus carolinensis"];
            let locales = ["DE", "FR"];
            let sources = [Source::Gbif, Source::Flickr, Source::Wikipedia, Source::Reddit];
            let start = date(2024, 1, 1);
            let mut tables: Vec<SourceTable> = sources.iter().map(|s| SourceTable::new(*s)).collect();
            for (e, l, offset, count, s) in cells {
                tables[s].insert(record(
                    entities[e],
                    locales[l],
                    start + chrono::Duration::days(offset),
                    f64::from(count),
                ));
            }
            let grid = build_grid(&tables);
            let axis = build_date_axis(start, date(2024, 1, 20), Grain::Daily).unwrap();

            let mut shuffled = tables.clone();
            let rotate = (seed % shuffled.len() as u64) as usize;
            shuffled.rotate_left(rotate);
            if seed % 2 == 0 {
                shuffled.reverse();
            }

            let a = unify_to_rows(tables, &grid, &axis);
            let b = unify_to_rows(shuffled, &grid, &axis);
            prop_assert_eq!(a.len(), Source::ALL.len() * grid.len() * axis.len());
            prop_assert_eq!(a, b);
        }
    }
}
