use std::collections::HashMap;

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::models::{AlertState, FittedPoint};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvaluationWindow {
    pub cutoff: NaiveDate,
}

impl EvaluationWindow {
    pub fn new(cutoff: NaiveDate) -> Self {
        Self { cutoff }
    }

    pub fn end(&self) -> NaiveDate {
        self.cutoff
            .checked_add_months(Months::new(12))
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn is_historical(&self, date: NaiveDate) -> bool {
        date < self.cutoff
    }

    pub fn is_evaluation(&self, date: NaiveDate) -> bool {
        date >= self.cutoff && date < self.end()
    }
}

pub fn historical_envelope<'a>(
    points: impl IntoIterator<Item = &'a FittedPoint>,
    window: &EvaluationWindow,
) -> HashMap<u32, f64> {
    let mut envelope: HashMap<u32, f64> = HashMap::new();
    for point in points {
        if !window.is_historical(point.date) {
            continue;
        }
        let bound = envelope.entry(point.date.ordinal()).or_insert(f64::NEG_INFINITY);
        if point.upper > *bound {
            *bound = point.upper;
        }
    }
    envelope
}

// Equal values do not alert; a day without an envelope cannot alert.
pub fn classify_point(evaluation_lower: f64, envelope: Option<f64>) -> AlertState {
    match envelope {
        Some(upper) if evaluation_lower > upper => AlertState::Alert,
        _ => AlertState::Normal,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub states: Vec<(NaiveDate, AlertState)>,
    pub alert_days: usize,
    pub terminal: AlertState,
    pub last_date: NaiveDate,
}

impl Classification {
    pub fn terminal_alert(&self) -> bool {
        self.terminal == AlertState::Alert
    }
}

pub fn classify_pair(points: &[FittedPoint], window: &EvaluationWindow) -> Option<Classification> {
    let envelope = historical_envelope(points, window);

    let mut states: Vec<(NaiveDate, AlertState)> = points
        .iter()
        .filter(|point| window.is_evaluation(point.date))
        .map(|point| {
            let bound = envelope.get(&point.date.ordinal()).copied();
            (point.date, classify_point(point.lower, bound))
        })
        .collect();
    states.sort_by_key(|(date, _)| *date);

    let &(last_date, terminal) = states.last()?;
    let alert_days = states
        .iter()
        .filter(|(_, state)| *state == AlertState::Alert)
        .count();

    Some(Classification {
        states,
        alert_days,
        terminal,
        last_date,
    })
}
