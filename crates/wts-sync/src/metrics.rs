//! Effort totals, person-days and efficiency over canonical records.

use std::collections::{BTreeMap, BTreeSet};

use chrono::NaiveDate;
use serde::Serialize;
use wts_adapters::{effort_credits, TeamMapping};
use wts_core::{CanonicalTaskRecord, TaskStatus};

pub const DEFAULT_SHIFT_MINUTES: u32 = 480;

/// Which records and people a metrics query covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsScope {
    pub person: Option<String>,
    pub team: Option<String>,
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    /// Count records that are not completed as well.
    pub include_incomplete: bool,
}

impl MetricsScope {
    fn has_date_range(&self) -> bool {
        self.from.is_some() || self.to.is_some()
    }

    fn admits_record(&self, record: &CanonicalTaskRecord) -> bool {
        if !self.include_incomplete && record.status != TaskStatus::Completed {
            return false;
        }
        if !self.has_date_range() {
            return true;
        }
        // A range query needs a date to place the record in.
        let Some(date) = record.completed_at.map(|at| at.date_naive()) else {
            return false;
        };
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffortSummary {
    /// Person identifier, team name, or `"all"`.
    pub key: String,
    pub task_minutes: f64,
    pub person_days: usize,
    pub tasks: usize,
    pub efficiency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsReport {
    pub scope: MetricsScope,
    pub shift_minutes: u32,
    pub total: EffortSummary,
    pub persons: Vec<EffortSummary>,
    pub teams: Vec<EffortSummary>,
}

/// task_minutes / (person_days x shift_minutes).
///
/// Zero person-days yields 0.0 rather than a division fault, so "no dated
/// attendance" reads as zero efficiency even when minutes were credited.
pub fn efficiency(task_minutes: f64, person_days: usize, shift_minutes: u32) -> f64 {
    if person_days == 0 || shift_minutes == 0 {
        return 0.0;
    }
    task_minutes / (person_days as f64 * f64::from(shift_minutes))
}

#[derive(Default)]
struct Accumulator {
    minutes: f64,
    tasks: usize,
    days: BTreeSet<(String, NaiveDate)>,
}

impl Accumulator {
    fn summary(&self, key: String, shift_minutes: u32) -> EffortSummary {
        EffortSummary {
            key,
            task_minutes: self.minutes,
            person_days: self.days.len(),
            tasks: self.tasks,
            efficiency: efficiency(self.minutes, self.days.len(), shift_minutes),
        }
    }
}

/// One credited share of one record, already filtered by scope.
struct Credit<'a> {
    person: String,
    team: &'a str,
    minutes: f64,
    date: Option<NaiveDate>,
}

pub struct MetricsAggregator<'a> {
    teams: &'a TeamMapping,
    shift_minutes: u32,
}

impl<'a> MetricsAggregator<'a> {
    pub fn new(teams: &'a TeamMapping, shift_minutes: u32) -> Self {
        Self {
            teams,
            shift_minutes,
        }
    }

    fn credits(
        &self,
        records: &[CanonicalTaskRecord],
        scope: &MetricsScope,
    ) -> Vec<Credit<'a>> {
        let person = scope.person.as_deref().map(str::to_uppercase);
        let mut out = Vec::new();
        for record in records.iter().filter(|r| scope.admits_record(r)) {
            let date = record.completed_at.map(|at| at.date_naive());
            for credit in effort_credits(record) {
                if person.as_deref().is_some_and(|p| p != credit.person) {
                    continue;
                }
                let team = self.teams.team_or_unknown(&credit.person);
                if scope.team.as_deref().is_some_and(|t| t != team) {
                    continue;
                }
                out.push(Credit {
                    person: credit.person,
                    team,
                    minutes: credit.minutes,
                    date,
                });
            }
        }
        out
    }

    fn group_by<F>(&self, credits: &[Credit<'_>], key_of: F) -> Vec<EffortSummary>
    where
        F: Fn(&Credit<'_>) -> String,
    {
        let mut groups: BTreeMap<String, Accumulator> = BTreeMap::new();
        for credit in credits {
            let acc = groups.entry(key_of(credit)).or_default();
            acc.minutes += credit.minutes;
            acc.tasks += 1;
            if let Some(date) = credit.date {
                acc.days.insert((credit.person.clone(), date));
            }
        }
        groups
            .into_iter()
            .map(|(key, acc)| acc.summary(key, self.shift_minutes))
            .collect()
    }

    pub fn per_person(
        &self,
        records: &[CanonicalTaskRecord],
        scope: &MetricsScope,
    ) -> Vec<EffortSummary> {
        self.group_by(&self.credits(records, scope), |c| c.person.clone())
    }

    pub fn per_team(
        &self,
        records: &[CanonicalTaskRecord],
        scope: &MetricsScope,
    ) -> Vec<EffortSummary> {
        self.group_by(&self.credits(records, scope), |c| c.team.to_string())
    }

    pub fn report(&self, records: &[CanonicalTaskRecord], scope: &MetricsScope) -> MetricsReport {
        let credits = self.credits(records, scope);
        let total = self
            .group_by(&credits, |_| "all".to_string())
            .pop()
            .unwrap_or_else(|| Accumulator::default().summary("all".into(), self.shift_minutes));
        MetricsReport {
            scope: scope.clone(),
            shift_minutes: self.shift_minutes,
            total,
            persons: self.group_by(&credits, |c| c.person.clone()),
            teams: self.group_by(&credits, |c| c.team.to_string()),
        }
    }
}
