use std::collections::HashMap;

use wts_core::{CanonicalTaskRecord, CellValue};

use crate::reference::{ReferenceError, TeamSpec};

/// Bucket for people with no team mapping.
pub const UNKNOWN_TEAM: &str = "Unknown";

/// Ordered, first-occurrence-deduplicated person identifiers from an
/// attribution cell. Strings split on commas and slashes; pre-split lists
/// are taken token by token (and each token split again).
pub fn parse_identifiers(cell: &CellValue) -> Vec<String> {
    let raw: Vec<String> = match cell {
        CellValue::List(items) => items.clone(),
        other => other.as_text().into_iter().collect(),
    };

    let mut out: Vec<String> = Vec::new();
    for token in raw
        .iter()
        .flat_map(|item| item.split([',', '/']))
        .map(|token| token.trim().to_uppercase())
        .filter(|token| !token.is_empty())
    {
        if !out.contains(&token) {
            out.push(token);
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TeamResolution {
    /// Team of the first mapped identifier, if any.
    pub team: Option<String>,
    /// Identifiers with no mapping, in list order.
    pub unknown: Vec<String>,
}

/// Person identifier to team, injected at construction and read-only.
#[derive(Debug, Clone, Default)]
pub struct TeamMapping {
    members: HashMap<String, String>,
    team_names: Vec<String>,
}

impl TeamMapping {
    pub fn from_specs(specs: &[TeamSpec]) -> Result<Self, ReferenceError> {
        let mut members: HashMap<String, String> = HashMap::new();
        let mut team_names = Vec::new();
        for spec in specs {
            team_names.push(spec.name.clone());
            for member in &spec.members {
                let key = member.trim().to_uppercase();
                if key.is_empty() {
                    continue;
                }
                if let Some(first) = members.get(&key) {
                    if first != &spec.name {
                        return Err(ReferenceError::DuplicateMember {
                            person: key,
                            first: first.clone(),
                            second: spec.name.clone(),
                        });
                    }
                    continue;
                }
                members.insert(key, spec.name.clone());
            }
        }
        Ok(Self {
            members,
            team_names,
        })
    }

    pub fn team_of(&self, person: &str) -> Option<&str> {
        self.members
            .get(&person.trim().to_uppercase())
            .map(String::as_str)
    }

    /// Team name for metrics grouping, `Unknown` when unmapped.
    pub fn team_or_unknown(&self, person: &str) -> &str {
        self.team_of(person).unwrap_or(UNKNOWN_TEAM)
    }

    pub fn team_names(&self) -> &[String] {
        &self.team_names
    }

    /// First-match team resolution over an ordered identifier list.
    pub fn resolve(&self, identifiers: &[String]) -> TeamResolution {
        let mut resolution = TeamResolution::default();
        for id in identifiers {
            match self.team_of(id) {
                Some(team) => {
                    if resolution.team.is_none() {
                        resolution.team = Some(team.to_string());
                    }
                }
                None => resolution.unknown.push(id.clone()),
            }
        }
        resolution
    }
}

/// One person's share of a record's duration.
#[derive(Debug, Clone, PartialEq)]
pub struct EffortCredit {
    pub person: String,
    pub minutes: f64,
}

/// Even split of a record's duration across its attributed people.
/// Records without a duration or without people credit nothing.
pub fn effort_credits(record: &CanonicalTaskRecord) -> Vec<EffortCredit> {
    let Some(total) = record.duration_minutes.value else {
        return Vec::new();
    };
    if record.completed_by.is_empty() {
        return Vec::new();
    }
    let share = f64::from(total) / record.completed_by.len() as f64;
    record
        .completed_by
        .iter()
        .map(|person| EffortCredit {
            person: person.clone(),
            minutes: share,
        })
        .collect()
}
