//! In-process store for dry runs and tests. Applies by snapshot swap.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use wts_core::{CanonicalTaskRecord, Car, NaturalKey, Unit, UnitNumber};

use crate::{fetch_paginated, ApplyReport, ChangeSet, StoreError, TaskStore, DEFAULT_PAGE_SIZE};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    units: BTreeMap<UnitNumber, Unit>,
    cars: BTreeMap<(UnitNumber, String), Car>,
    tasks: BTreeMap<NaturalKey, CanonicalTaskRecord>,
}

/// Fault to raise part-way through a unit's apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFault {
    Transient,
    Semantic,
}

#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    faults: Mutex<HashMap<UnitNumber, InjectedFault>>,
    page_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl MemoryStore {
    pub fn new(page_size: usize) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            faults: Mutex::new(HashMap::new()),
            page_size: page_size.max(1),
        }
    }

    /// Make every later apply for `unit` fail after its first write.
    pub async fn inject_fault(&self, unit: UnitNumber, fault: InjectedFault) {
        self.faults.lock().await.insert(unit, fault);
    }

    pub async fn clear_faults(&self) {
        self.faults.lock().await.clear();
    }

    /// Hand edit of a persisted record, as an operator correction would.
    pub async fn amend_task<F>(&self, key: &NaturalKey, edit: F) -> bool
    where
        F: FnOnce(&mut CanonicalTaskRecord),
    {
        let mut state = self.state.lock().await;
        match state.tasks.get_mut(key) {
            Some(record) => {
                edit(record);
                true
            }
            None => false,
        }
    }

    pub async fn cars(&self, unit_number: &UnitNumber) -> Vec<Car> {
        let state = self.state.lock().await;
        state
            .cars
            .iter()
            .filter(|((unit, _), _)| unit == unit_number)
            .map(|(_, car)| car.clone())
            .collect()
    }

    async fn task_page(
        &self,
        unit_number: Option<&UnitNumber>,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<CanonicalTaskRecord>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .tasks
            .values()
            .filter(|record| unit_number.map_or(true, |unit| &record.unit_number == unit))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }
}

fn fault_error(fault: &InjectedFault, unit: &UnitNumber) -> StoreError {
    match fault {
        InjectedFault::Transient => StoreError::Transient(format!("injected timeout for {unit}")),
        InjectedFault::Semantic => StoreError::Semantic(format!("injected rejection for {unit}")),
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn fetch_unit(&self, unit_number: &UnitNumber) -> Result<Option<Unit>, StoreError> {
        Ok(self.state.lock().await.units.get(unit_number).cloned())
    }

    async fn upsert_unit(&self, unit: &Unit) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .units
            .insert(unit.unit_number.clone(), unit.clone());
        Ok(())
    }

    async fn fetch_unit_tasks(
        &self,
        unit_number: &UnitNumber,
    ) -> Result<Vec<CanonicalTaskRecord>, StoreError> {
        fetch_paginated(self.page_size, |offset, limit| {
            self.task_page(Some(unit_number), offset, limit)
        })
        .await
    }

    async fn fetch_all_tasks(&self) -> Result<Vec<CanonicalTaskRecord>, StoreError> {
        fetch_paginated(self.page_size, |offset, limit| self.task_page(None, offset, limit)).await
    }

    async fn apply_reconciliation(&self, changes: &ChangeSet) -> Result<ApplyReport, StoreError> {
        let unit_number = changes.unit_number();
        let fault = self.faults.lock().await.get(unit_number).cloned();

        let mut state = self.state.lock().await;
        let mut next = state.clone();
        let mut report = ApplyReport::default();

        next.units
            .insert(unit_number.clone(), changes.unit.clone());
        for car in &changes.cars {
            let slot = next
                .cars
                .entry((car.unit_number.clone(), car.car_type.clone()))
                .or_insert_with(|| car.clone());
            if car.car_number.is_some() {
                slot.car_number = car.car_number.clone();
            }
        }

        for record in &changes.inserts {
            let key = record.natural_key();
            if next.tasks.contains_key(&key) {
                return Err(StoreError::Conflict(format!("insert of existing key {key}")));
            }
            next.tasks.insert(key, record.clone());
            report.inserted += 1;
            if let Some(fault) = &fault {
                // `state` is untouched; the partial copy is dropped.
                return Err(fault_error(fault, unit_number));
            }
        }
        for record in &changes.updates {
            let key = record.natural_key();
            match next.tasks.get_mut(&key) {
                Some(slot) => *slot = record.clone(),
                None => return Err(StoreError::Conflict(format!("update of missing key {key}"))),
            }
            report.updated += 1;
        }
        for key in &changes.delete_keys {
            if next.tasks.remove(key).is_none() {
                return Err(StoreError::Conflict(format!("delete of missing key {key}")));
            }
            report.deleted += 1;
        }
        if let Some(fault) = &fault {
            return Err(fault_error(fault, unit_number));
        }

        *state = next;
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wts_core::{Field, TaskOwner, TaskStatus};

    fn unit() -> Unit {
        Unit {
            unit_number: UnitNumber::parse("96123").unwrap(),
            train_id: None,
            train_name: None,
            construction_phase: None,
        }
    }

    fn record(name: &str, sort_order: u32) -> CanonicalTaskRecord {
        CanonicalTaskRecord {
            unit_number: UnitNumber::parse("96123").unwrap(),
            owner: TaskOwner::Unit,
            sort_order,
            task_number: None,
            task_name: name.into(),
            description: None,
            status: TaskStatus::NotStarted,
            duration_minutes: Field::empty(),
            headcount: 1,
            phase: Field::empty(),
            completed_by: vec![],
            team: Field::empty(),
            completed_at: None,
            reference_code: None,
            position: None,
            scope_delayed: false,
            wi_reference: None,
            review_flags: Default::default(),
        }
    }

    fn inserts(records: Vec<CanonicalTaskRecord>) -> ChangeSet {
        ChangeSet {
            unit: unit(),
            cars: vec![],
            inserts: records,
            updates: vec![],
            delete_keys: vec![],
        }
    }

    #[tokio::test]
    async fn reads_page_through_all_tasks() {
        let store = MemoryStore::new(2);
        let records: Vec<_> = (1..=5).map(|i| record("Task", i)).collect();
        store.apply_reconciliation(&inserts(records)).await.unwrap();
        let unit_number = UnitNumber::parse("96123").unwrap();
        assert_eq!(store.fetch_unit_tasks(&unit_number).await.unwrap().len(), 5);
        assert_eq!(store.fetch_all_tasks().await.unwrap().len(), 5);
        assert!(store.fetch_unit(&unit_number).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_apply_leaves_previous_state() {
        let store = MemoryStore::default();
        store
            .apply_reconciliation(&inserts(vec![record("A", 1)]))
            .await
            .unwrap();

        store
            .inject_fault(unit().unit_number, InjectedFault::Transient)
            .await;
        let mut changes = inserts(vec![record("B", 2), record("C", 3)]);
        changes.delete_keys.push(record("A", 1).natural_key());
        let err = store.apply_reconciliation(&changes).await.unwrap_err();
        assert!(matches!(err, StoreError::Transient(_)));

        let tasks = store.fetch_all_tasks().await.unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_name, "A");
    }

    #[tokio::test]
    async fn conflicting_changes_are_rejected_whole() {
        let store = MemoryStore::default();
        store
            .apply_reconciliation(&inserts(vec![record("A", 1)]))
            .await
            .unwrap();
        let changes = ChangeSet {
            updates: vec![record("Z", 9)],
            ..inserts(vec![record("B", 2)])
        };
        assert!(matches!(
            store.apply_reconciliation(&changes).await,
            Err(StoreError::Conflict(_))
        ));
        assert_eq!(store.fetch_all_tasks().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cars_keep_known_numbers() {
        let store = MemoryStore::default();
        let unit_number = unit().unit_number;
        let mut changes = inserts(vec![]);
        changes.cars.push(Car {
            unit_number: unit_number.clone(),
            car_type: "DM 3 CAR".into(),
            car_number: Some("12301".into()),
        });
        store.apply_reconciliation(&changes).await.unwrap();
        changes.cars[0].car_number = None;
        store.apply_reconciliation(&changes).await.unwrap();
        let cars = store.cars(&unit_number).await;
        assert_eq!(cars.len(), 1);
        assert_eq!(cars[0].car_number.as_deref(), Some("12301"));
    }
}
