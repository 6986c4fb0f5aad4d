use std::collections::{BTreeMap, HashSet};
use std::io::{Read, Write};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::Context;
use chrono::NaiveDate;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::baseline::{PairSeries, SeasonalFit};
use crate::classify::{classify_pair, EvaluationWindow};
use crate::error::ModelError;
use crate::models::{ActivityRecord, AlertEntry, OutcomeStatus, PairKey, PairOutcome, SkipReason, Source};
use crate::monthly::with_unified_records;
use crate::store::{CompletionStore, RunScope};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    pub workers: usize,
    pub offset: usize,
    pub min_historical_observations: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub scope: RunScope,
    pub queued: usize,
    pub modeled: usize,
    pub skipped_insufficient: usize,
    pub skipped_fit_failure: usize,
    pub skipped_no_evaluation: usize,
    pub alerted: usize,
    pub resumed: usize,
    pub diagnostics: BTreeMap<PairKey, SkipReason>,
}

impl BatchSummary {
    fn new(run_id: Uuid, scope: RunScope) -> Self {
        Self {
            run_id,
            scope,
            queued: 0,
            modeled: 0,
            skipped_insufficient: 0,
            skipped_fit_failure: 0,
            skipped_no_evaluation: 0,
            alerted: 0,
            resumed: 0,
            diagnostics: BTreeMap::new(),
        }
    }

    fn record(&mut self, outcome: &PairOutcome) {
        match &outcome.status {
            OutcomeStatus::Modeled { terminal_alert, .. } => {
                self.modeled += 1;
                if *terminal_alert {
                    self.alerted += 1;
                }
            }
            OutcomeStatus::Skipped(reason) => {
                match reason {
                    SkipReason::InsufficientHistory { .. } => self.skipped_insufficient += 1,
                    SkipReason::FitFailure { .. } => self.skipped_fit_failure += 1,
                    SkipReason::NoEvaluationData => self.skipped_no_evaluation += 1,
                }
                self.diagnostics.insert(outcome.key.clone(), reason.clone());
            }
        }
    }
}

// Sources are summed on each date.
pub fn collect_pair_series<I>(records: I, sources: &[Source]) -> BTreeMap<PairKey, PairSeries>
where
    I: IntoIterator<Item = ActivityRecord>,
{
    let mut totals: BTreeMap<PairKey, BTreeMap<NaiveDate, f64>> = BTreeMap::new();
    for record in records {
        if !sources.contains(&record.source) {
            continue;
        }
        let count = if record.count.is_finite() { record.count } else { 0.0 };
        *totals
            .entry(PairKey::new(record.entity, record.locale))
            .or_default()
            .entry(record.date)
            .or_insert(0.0) += count;
    }

    totals
        .into_iter()
        .map(|(key, days)| {
            let points = days.into_iter().map(|(date, count)| (date, Some(count))).collect();
            (key.clone(), PairSeries::new(key, points))
        })
        .collect()
}

pub fn load_pair_series<R: Read>(
    reader: R,
    sources: &[Source],
) -> anyhow::Result<BTreeMap<PairKey, PairSeries>> {
    with_unified_records(reader, |records| collect_pair_series(records, sources))
        .context("failed to parse unified daily table")
}

pub fn data_end(series: &BTreeMap<PairKey, PairSeries>) -> Option<NaiveDate> {
    series
        .values()
        .filter_map(|pair| pair.points.last().map(|(date, _)| *date))
        .max()
}

pub fn evaluate_pair(
    model: &dyn SeasonalFit,
    series: &PairSeries,
    window: &EvaluationWindow,
    min_historical_observations: usize,
) -> PairOutcome {
    let key = series.key.clone();
    let skipped = |reason: SkipReason| PairOutcome {
        key: key.clone(),
        status: OutcomeStatus::Skipped(reason),
    };

    let observed = series.historical_support(window);
    if observed < min_historical_observations {
        debug!(entity = %key.entity, locale = %key.locale, observed, "insufficient history");
        return skipped(SkipReason::InsufficientHistory {
            observed,
            required: min_historical_observations,
        });
    }
    if !series.has_evaluation_data(window) {
        return skipped(SkipReason::NoEvaluationData);
    }

    let fitted = match panic::catch_unwind(AssertUnwindSafe(|| model.fit(series, window))) {
        Ok(Ok(points)) => points,
        Ok(Err(ModelError::InsufficientData { needed, got })) => {
            return skipped(SkipReason::InsufficientHistory {
                observed: got,
                required: needed,
            });
        }
        Ok(Err(err)) => {
            error!(entity = %key.entity, locale = %key.locale, %err, "baseline fit failed");
            return skipped(SkipReason::FitFailure {
                message: err.to_string(),
            });
        }
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            error!(entity = %key.entity, locale = %key.locale, %message, "baseline fit panicked");
            return skipped(SkipReason::FitFailure { message });
        }
    };

    match classify_pair(&fitted, window) {
        Some(classification) => PairOutcome {
            key: series.key.clone(),
            status: OutcomeStatus::Modeled {
                terminal_alert: classification.terminal_alert(),
                alert_days: classification.alert_days,
                last_date: classification.last_date,
            },
        },
        None => skipped(SkipReason::NoEvaluationData),
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("panic: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("panic: {message}")
    } else {
        "panic".to_string()
    }
}

pub async fn run_batch<S: CompletionStore>(
    mut series: BTreeMap<PairKey, PairSeries>,
    model: Arc<dyn SeasonalFit>,
    scope: RunScope,
    options: &BatchOptions,
    store: &mut S,
) -> anyhow::Result<BatchSummary> {
    let run_id = Uuid::new_v4();
    let window = scope.window();
    let mut summary = BatchSummary::new(run_id, scope);
    let completed: HashSet<PairKey> = store.completed(&scope).await?;

    let queue: Vec<PairKey> = series.keys().skip(options.offset).cloned().collect();
    let mut work = Vec::with_capacity(queue.len());
    for key in queue {
        if completed.contains(&key) {
            summary.resumed += 1;
            continue;
        }
        if let Some(pair) = series.remove(&key) {
            work.push(pair);
        }
    }
    drop(series);
    summary.queued = work.len();

    info!(
        %run_id,
        cutoff = %scope.cutoff,
        data_end = %scope.data_end,
        queued = summary.queued,
        resumed = summary.resumed,
        offset = options.offset,
        workers = options.workers,
        "starting alert batch"
    );

    let (tx, mut rx) = mpsc::channel::<PairOutcome>(options.workers.max(1) * 2);
    let dispatcher = tokio::spawn(dispatch(
        work,
        model,
        window,
        options.workers.max(1),
        options.min_historical_observations,
        tx,
    ));

    while let Some(outcome) = rx.recv().await {
        summary.record(&outcome);
        if !store.append(&scope, run_id, &outcome).await? {
            warn!(key = %outcome.key, "outcome already recorded, keeping the earlier entry");
        }
    }

    dispatcher.await.context("alert dispatcher panicked")?;

    info!(
        %run_id,
        modeled = summary.modeled,
        alerted = summary.alerted,
        skipped_insufficient = summary.skipped_insufficient,
        skipped_fit_failure = summary.skipped_fit_failure,
        skipped_no_evaluation = summary.skipped_no_evaluation,
        "alert batch finished"
    );
    Ok(summary)
}

async fn dispatch(
    work: Vec<PairSeries>,
    model: Arc<dyn SeasonalFit>,
    window: EvaluationWindow,
    workers: usize,
    min_historical_observations: usize,
    tx: mpsc::Sender<PairOutcome>,
) {
    let semaphore = Arc::new(Semaphore::new(workers));
    let mut tasks = JoinSet::new();

    for series in work {
        let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
            break;
        };
        if tx.is_closed() {
            break;
        }
        let model = Arc::clone(&model);
        let tx = tx.clone();
        tasks.spawn_blocking(move || {
            let _permit = permit;
            let outcome = evaluate_pair(model.as_ref(), &series, &window, min_historical_observations);
            // The receiver only goes away when the sink has already failed.
            let _ = tx.blocking_send(outcome);
        });

        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!(?e, "pair worker aborted");
            }
        }
    }
    drop(tx);

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            error!(?e, "pair worker aborted");
        }
    }
}

pub fn alert_entries(outcomes: &[PairOutcome]) -> Vec<AlertEntry> {
    let mut entries: Vec<AlertEntry> = outcomes
        .iter()
        .filter_map(|outcome| match &outcome.status {
            OutcomeStatus::Modeled { terminal_alert, .. } => Some(AlertEntry {
                entity: outcome.key.entity.clone(),
                locale: outcome.key.locale.clone(),
                terminal_alert: *terminal_alert,
            }),
            OutcomeStatus::Skipped(_) => None,
        })
        .collect();
    entries.sort_by(|a, b| (&a.entity, &a.locale).cmp(&(&b.entity, &b.locale)));
    entries
}

pub fn write_alert_report<W: Write>(entries: &[AlertEntry], writer: W) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    for entry in entries {
        writer.serialize(entry)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::{BaselineConfig, PoissonSeasonalModel};
    use crate::models::FittedPoint;
    use crate::models::LocaleKind;
    use crate::store::JsonlStore;
    use chrono::{Datelike, Duration};
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn window() -> EvaluationWindow {
        EvaluationWindow::new(date(2024, 1, 1))
    }

    fn scope() -> RunScope {
        RunScope::new(LocaleKind::Country, date(2024, 1, 1), date(2024, 12, 31))
    }

    fn daily_series(entity: &str, historical: f64, evaluation: f64) -> PairSeries {
        yearly_series(entity, &[historical, historical, historical, historical, evaluation])
    }

    // One flat level per calendar year starting in 2020.
    fn yearly_series(entity: &str, levels: &[f64]) -> PairSeries {
        let mut points = Vec::new();
        for (offset, level) in levels.iter().enumerate() {
            let year = 2020 + offset as i32;
            let mut day = date(year, 1, 1);
            while day.year() == year {
                points.push((day, Some(*level)));
                day += Duration::days(1);
            }
        }
        PairSeries::new(PairKey::new(entity, "XX"), points)
    }

    // History gets a [3, 7] band, evaluation days +/- 1 around the count.
    struct BandModel;

    impl SeasonalFit for BandModel {
        fn fit(
            &self,
            series: &PairSeries,
            window: &EvaluationWindow,
        ) -> crate::error::ModelResult<Vec<FittedPoint>> {
            match series.key.entity.as_str() {
                "Broken" => return Err(ModelError::FitFailure("matrix not positive definite".into())),
                "Panicky" => panic!("worker blew up"),
                _ => {}
            }
            Ok(series
                .points
                .iter()
                .map(|(day, count)| {
                    let value = count.unwrap_or(0.0);
                    if window.is_historical(*day) {
                        FittedPoint { date: *day, fit: 5.0, lower: 3.0, upper: 7.0 }
                    } else {
                        FittedPoint { date: *day, fit: value, lower: value - 1.0, upper: value + 1.0 }
                    }
                })
                .collect())
        }
    }

    fn options(workers: usize, offset: usize) -> BatchOptions {
        BatchOptions {
            workers,
            offset,
            min_historical_observations: 10,
        }
    }

    fn batch_input(entities: &[(&str, f64)]) -> BTreeMap<PairKey, PairSeries> {
        entities
            .iter()
            .map(|(entity, evaluation)| {
                let series = daily_series(entity, 5.0, *evaluation);
                (series.key.clone(), series)
            })
            .collect()
    }

    #[test]
    fn pair_series_sum_selected_sources_per_date() {
        let record = |source, count| ActivityRecord {
            entity: "Procyon lotor".into(),
            locale: "DE".into(),
            date: date(2023, 5, 1),
            count,
            source,
        };
        let records = vec![
            record(Source::Wikipedia, 3.0),
            record(Source::Gbif, 2.0),
            record(Source::Flickr, 100.0),
        ];
        let series = collect_pair_series(records, &[Source::Wikipedia, Source::Gbif]);
        let pair = &series[&PairKey::new("Procyon lotor", "DE")];
        assert_eq!(pair.points, vec![(date(2023, 5, 1), Some(5.0))]);
    }

    #[test]
    fn unreadable_unified_rows_fail_the_load() {
        let csv = "entity,locale,date,count,source\n\
                   Procyon lotor,DE,2023-05-01,3,wikipedia\n\
                   Procyon lotor,DE,not-a-date,1,wikipedia\n";
        assert!(load_pair_series(csv.as_bytes(), &Source::ALL).is_err());
    }

    #[test]
    fn unified_csv_is_read_back_into_series() {
        let csv = "entity,locale,date,count,source\n\
                   Procyon lotor,DE,2023-05-01,3,wikipedia\n\
                   Procyon lotor,DE,2023-05-02,,wikipedia\n\
                   Procyon lotor,AT,2023-05-01,1,gbif\n";
        let series = load_pair_series(csv.as_bytes(), &Source::ALL).unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(
            series[&PairKey::new("Procyon lotor", "DE")].points,
            vec![(date(2023, 5, 1), Some(3.0)), (date(2023, 5, 2), Some(0.0))]
        );
    }

    #[test]
    fn nine_historical_observations_are_below_the_threshold() {
        let mut points: Vec<(NaiveDate, Option<f64>)> =
            (1..=9).map(|day| (date(2023, 3, day), Some(4.0))).collect();
        points.push((date(2024, 3, 1), Some(40.0)));
        let series = PairSeries::new(PairKey::new("Testus exemplus", "XX"), points.clone());
        let outcome = evaluate_pair(&BandModel, &series, &window(), 10);
        assert_eq!(
            outcome.status,
            OutcomeStatus::Skipped(SkipReason::InsufficientHistory { observed: 9, required: 10 })
        );

        points.push((date(2023, 3, 10), Some(4.0)));
        let series = PairSeries::new(PairKey::new("Testus exemplus", "XX"), points);
        let outcome = evaluate_pair(&BandModel, &series, &window(), 10);
        assert!(matches!(outcome.status, OutcomeStatus::Modeled { .. }));
    }

    #[test]
    fn pairs_without_evaluation_data_are_skipped() {
        let points: Vec<_> = (1..=20).map(|day| (date(2023, 3, day), Some(4.0))).collect();
        let series = PairSeries::new(PairKey::new("Testus exemplus", "XX"), points);
        let outcome = evaluate_pair(&BandModel, &series, &window(), 10);
        assert_eq!(outcome.status, OutcomeStatus::Skipped(SkipReason::NoEvaluationData));
    }

    #[test]
    fn evaluation_surge_raises_a_terminal_alert() {
        let config = BaselineConfig {
            log10_lambdas: vec![1.0, 3.0],
            ..BaselineConfig::default()
        };
        let model = PoissonSeasonalModel::new(config);

        let surge = evaluate_pair(&model, &daily_series("Testus exemplus", 5.0, 50.0), &window(), 10);
        match surge.status {
            OutcomeStatus::Modeled { terminal_alert, last_date, alert_days } => {
                assert!(terminal_alert);
                assert_eq!(last_date, date(2024, 12, 31));
                assert!(alert_days > 300);
            }
            other => panic!("expected a modeled outcome, got {other:?}"),
        }

        let steady = evaluate_pair(&model, &daily_series("Testus exemplus", 5.0, 5.0), &window(), 10);
        assert!(matches!(
            steady.status,
            OutcomeStatus::Modeled { terminal_alert: false, .. }
        ));
    }

    #[tokio::test]
    async fn failing_pairs_do_not_stop_the_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlStore::open(dir.path().join("progress.jsonl")).unwrap();
        let input = batch_input(&[("Broken", 50.0), ("Panicky", 50.0), ("Procyon lotor", 50.0), ("Vespa velutina", 5.0)]);

        let summary = run_batch(input, Arc::new(BandModel), scope(), &options(2, 0), &mut store)
            .await
            .unwrap();

        assert_eq!(summary.queued, 4);
        assert_eq!(summary.modeled, 2);
        assert_eq!(summary.alerted, 1);
        assert_eq!(summary.skipped_fit_failure, 2);
        assert!(matches!(
            summary.diagnostics[&PairKey::new("Panicky", "XX")],
            SkipReason::FitFailure { .. }
        ));

        let entries = alert_entries(&store.outcomes(&scope()).await.unwrap());
        assert_eq!(
            entries,
            vec![
                AlertEntry { entity: "Procyon lotor".into(), locale: "XX".into(), terminal_alert: true },
                AlertEntry { entity: "Vespa velutina".into(), locale: "XX".into(), terminal_alert: false },
            ]
        );
    }

    #[tokio::test]
    async fn restart_skips_completed_pairs_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.jsonl");
        let entities = [("Alpha", 50.0), ("Beta", 5.0), ("Gamma", 50.0), ("Delta", 5.0)];

        // First run is "interrupted" after processing from offset 2 only.
        {
            let mut store = JsonlStore::open(&path).unwrap();
            let summary = run_batch(batch_input(&entities), Arc::new(BandModel), scope(), &options(3, 2), &mut store)
                .await
                .unwrap();
            assert_eq!(summary.queued, 2);
        }

        let mut store = JsonlStore::open(&path).unwrap();
        let summary = run_batch(batch_input(&entities), Arc::new(BandModel), scope(), &options(3, 0), &mut store)
            .await
            .unwrap();
        assert_eq!(summary.resumed, 2);
        assert_eq!(summary.queued, 2);

        let again = run_batch(batch_input(&entities), Arc::new(BandModel), scope(), &options(3, 0), &mut store)
            .await
            .unwrap();
        assert_eq!(again.queued, 0);
        assert_eq!(again.resumed, 4);

        let outcomes = store.outcomes(&scope()).await.unwrap();
        assert_eq!(outcomes.len(), 4);
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 4);

        let entries = alert_entries(&outcomes);
        let alerted: Vec<&str> = entries
            .iter()
            .filter(|entry| entry.terminal_alert)
            .map(|entry| entry.entity.as_str())
            .collect();
        assert_eq!(alerted, vec!["Alpha", "Gamma"]);
    }

    #[tokio::test]
    async fn a_new_evaluation_year_is_modeled_afresh() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonlStore::open(dir.path().join("progress.jsonl")).unwrap();

        let surge_2024 = yearly_series("Testus exemplus", &[5.0, 5.0, 5.0, 5.0, 50.0]);
        let first_input = BTreeMap::from([(surge_2024.key.clone(), surge_2024)]);
        let first_scope = RunScope::new(
            LocaleKind::Country,
            date(2024, 1, 1),
            data_end(&first_input).unwrap(),
        );
        run_batch(first_input, Arc::new(BandModel), first_scope, &options(1, 0), &mut store)
            .await
            .unwrap();

        let calm_2025 = yearly_series("Testus exemplus", &[5.0, 5.0, 5.0, 5.0, 5.0, 5.0]);
        let second_input = BTreeMap::from([(calm_2025.key.clone(), calm_2025)]);
        let second_scope = RunScope::new(
            LocaleKind::Country,
            date(2025, 1, 1),
            data_end(&second_input).unwrap(),
        );
        assert_eq!(second_scope.data_end, date(2025, 12, 31));
        let summary = run_batch(second_input, Arc::new(BandModel), second_scope, &options(1, 0), &mut store)
            .await
            .unwrap();
        assert_eq!(summary.queued, 1);
        assert_eq!(summary.resumed, 0);

        let entries = alert_entries(&store.outcomes(&second_scope).await.unwrap());
        assert_eq!(
            entries,
            vec![AlertEntry { entity: "Testus exemplus".into(), locale: "XX".into(), terminal_alert: false }]
        );
        let earlier = alert_entries(&store.outcomes(&first_scope).await.unwrap());
        assert!(earlier[0].terminal_alert);
    }

    #[test]
    fn alert_report_csv_has_the_expected_columns() {
        let entries = vec![AlertEntry {
            entity: "Testus exemplus".into(),
            locale: "XX".into(),
            terminal_alert: true,
        }];
        let mut buffer = Vec::new();
        write_alert_report(&entries, &mut buffer).unwrap();
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            "entity,locale,terminal_alert\nTestus exemplus,XX,true\n"
        );
    }
}
