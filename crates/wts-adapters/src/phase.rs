use std::collections::{BTreeMap, HashMap};

use wts_core::normalize_task_name;

/// Spellings of one phase that always collapse to the same label.
const BUILTIN_SYNONYMS: [(&str, &str); 2] = [("CATCH BACK", "Catchback"), ("CATCHBACK", "Catchback")];

/// Normalized task name to canonical phase label.
///
/// Synonyms are collapsed while the table is built, so lookups are a plain
/// map read on the normalized task name.
#[derive(Debug, Clone, Default)]
pub struct PhaseReference {
    by_task: HashMap<String, String>,
}

impl PhaseReference {
    pub fn build<I>(entries: I, synonyms: &BTreeMap<String, String>) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut canonical: HashMap<String, String> = BUILTIN_SYNONYMS
            .iter()
            .map(|(spelling, label)| (spelling.to_string(), label.to_string()))
            .collect();
        for (spelling, label) in synonyms {
            canonical.insert(normalize_task_name(spelling), label.trim().to_string());
        }

        let mut by_task = HashMap::new();
        for (task, phase) in entries {
            let key = normalize_task_name(&task);
            let raw_phase = phase.trim();
            if key.is_empty() || raw_phase.is_empty() {
                continue;
            }
            let label = canonical
                .get(&normalize_task_name(raw_phase))
                .cloned()
                .unwrap_or_else(|| raw_phase.to_string());
            by_task.entry(key).or_insert(label);
        }
        Self { by_task }
    }

    pub fn lookup(&self, task_name: &str) -> Option<&str> {
        self.by_task
            .get(&normalize_task_name(task_name))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_task.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_task.is_empty()
    }

    /// Closest reference task by Jaro-Winkler similarity. Only a hint for
    /// reports; never used to assign a phase.
    pub fn nearest_task(&self, task_name: &str) -> Option<(String, f64)> {
        let wanted = normalize_task_name(task_name);
        self.by_task
            .keys()
            .map(|candidate| (candidate, strsim::jaro_winkler(&wanted, candidate)))
            .max_by(|a, b| a.1.total_cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(candidate, score)| (candidate.clone(), score))
    }
}
