//! Tables and the input-location table of one broker.

use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::debug;

use cora_core::TimerId;
use cora_core::constants::CLASSIC_INLOCS_TABLE;
use cora_core::protocol::{RecordBatch, RecordDescription};

use super::advisor::AdvisorId;
use super::inlocs::ClassicInlocs;
use super::table::TableDataManager;
use super::{DataRequest, RestartStep, Shared, SubscriberRef, Subscription, SubscriptionFailure};
use crate::transaction::AdviseFailure;

#[derive(Debug)]
pub(crate) struct BrokerDataManager {
    name: String,
    tables: BTreeMap<String, TableDataManager>,
    classic: Option<ClassicInlocs>,
}

impl BrokerDataManager {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tables: BTreeMap::new(),
            classic: None,
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.classic.is_none()
    }

    pub(crate) fn advisor_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, TableDataManager::advisor_count)
    }

    pub(crate) fn subscription_count(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, TableDataManager::subscription_count)
    }

    #[cfg(test)]
    pub(crate) fn advisor_ids(&self, table: &str) -> Vec<AdvisorId> {
        self.tables.get(table).map(TableDataManager::advisor_ids).unwrap_or_default()
    }

    pub(crate) fn queued_count(&self) -> usize {
        self.classic.as_ref().map_or(0, ClassicInlocs::queued_count)
    }

    pub(crate) fn restart_pending(&self) -> bool {
        self.tables.values().any(TableDataManager::restart_pending)
            || self.classic.as_ref().is_some_and(ClassicInlocs::restart_pending)
    }

    fn table_mut(&mut self, table: &str) -> &mut TableDataManager {
        let broker = &self.name;
        self.tables
            .entry(table.to_string())
            .or_insert_with(|| TableDataManager::new(broker, table, table != CLASSIC_INLOCS_TABLE))
    }

    fn contains(&self, request: &DataRequest, subscriber: &SubscriberRef) -> bool {
        let in_table = self
            .tables
            .get(&request.table)
            .is_some_and(|t| t.contains(request, subscriber));
        let queued = request.is_classic_inlocs()
            && self
                .classic
                .as_ref()
                .is_some_and(|c| c.contains_queued(request, subscriber));
        in_table || queued
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    pub(crate) fn add(&mut self, shared: &mut Shared, request: DataRequest, subscriber: SubscriberRef) {
        if self.contains(&request, &subscriber) {
            debug!(request = ?request, "duplicate request ignored");
            return;
        }
        let subscription = shared.subscribe(request, subscriber);
        if subscription.request().is_classic_inlocs() {
            self.add_classic(shared, subscription);
        } else {
            let table = subscription.request().table.clone();
            self.table_mut(&table).add(shared, subscription);
        }
    }

    fn add_classic(&mut self, shared: &mut Shared, subscription: Subscription) {
        if self.classic.is_none() {
            let mut classic = ClassicInlocs::new(shared, &self.name);
            classic.enqueue(subscription);
            let started = classic.start(shared);
            self.classic = Some(classic);
            if let Err(failure) = started {
                self.on_classic_failure(shared, failure);
            }
            return;
        }
        let Some(classic) = &mut self.classic else {
            return;
        };
        if let Some(failure) = classic.inert_failure() {
            shared.reject(subscription, failure);
            return;
        }
        if !classic.is_ready() {
            classic.enqueue(subscription);
            self.update_classic_fields();
            return;
        }
        if !classic.column_known(subscription.request()) {
            shared.reject(subscription, SubscriptionFailure::InvalidColumnName);
            return;
        }
        self.table_mut(CLASSIC_INLOCS_TABLE).add(shared, subscription);
        self.update_classic_fields();
    }

    pub(crate) fn remove(&mut self, shared: &mut Shared, request: &DataRequest, subscriber: &SubscriberRef) -> bool {
        let queued = match (&mut self.classic, request.is_classic_inlocs()) {
            (Some(classic), true) => classic.remove_queued(request, subscriber),
            _ => None,
        };
        let removed = match queued {
            Some(subscription) => {
                shared.unsubscribe(subscription);
                true
            }
            None => self
                .tables
                .get_mut(&request.table)
                .is_some_and(|t| t.remove(shared, request, subscriber)),
        };
        if removed && request.is_classic_inlocs() {
            self.prune(shared);
            self.update_classic_fields();
        }
        removed
    }

    /// Release empty tables, and the input-location table once nothing
    /// refers to it.
    pub(crate) fn prune(&mut self, shared: &Shared) {
        for table in self.tables.values_mut() {
            table.prune(shared);
        }
        self.tables.retain(|_, table| !table.is_empty());
        let classic_used = self.tables.contains_key(CLASSIC_INLOCS_TABLE)
            || self.classic.as_ref().is_some_and(ClassicInlocs::has_queued);
        if !classic_used {
            if let Some(mut classic) = self.classic.take() {
                classic.teardown(shared);
            }
        }
    }

    pub(crate) fn teardown(&mut self, shared: &Shared) {
        for table in self.tables.values_mut() {
            table.teardown(shared);
        }
        self.tables.clear();
        if let Some(mut classic) = self.classic.take() {
            classic.teardown(shared);
        }
    }

    // -------------------------------------------------------------------------
    // Input-location table
    // -------------------------------------------------------------------------

    fn classic_fields(&self) -> BTreeSet<u32> {
        let Some(classic) = &self.classic else {
            return BTreeSet::new();
        };
        let served = self
            .tables
            .get(CLASSIC_INLOCS_TABLE)
            .into_iter()
            .flat_map(TableDataManager::requests);
        classic.field_ids(served.chain(classic.queued_requests()))
    }

    fn update_classic_fields(&mut self) {
        let fields = self.classic_fields();
        if let Some(classic) = &mut self.classic {
            classic.set_fields(fields);
        }
    }

    pub(crate) fn on_input_labels(&mut self, labels: Vec<String>) {
        if let Some(classic) = &mut self.classic {
            classic.set_labels(labels);
        }
    }

    pub(crate) fn on_labels_resolved(&mut self, shared: &mut Shared) {
        let Some(classic) = &mut self.classic else {
            return;
        };
        classic.finish_labels();
        let fields = self.classic_fields();
        let created = match &mut self.classic {
            Some(classic) => classic.create_area(shared, fields),
            None => Ok(()),
        };
        if let Err(failure) = created {
            self.on_classic_failure(shared, failure);
        }
    }

    pub(crate) fn on_area_ready(&mut self, shared: &mut Shared) {
        let Some(classic) = &mut self.classic else {
            return;
        };
        let queued: Vec<(Subscription, bool)> = classic
            .mark_ready()
            .into_iter()
            .map(|s| {
                let known = classic.column_known(s.request());
                (s, known)
            })
            .collect();
        // Advisors from before a failure see a recreated area.
        if let Some(table) = self.tables.get_mut(CLASSIC_INLOCS_TABLE) {
            table.restart_all(shared);
        }
        for (subscription, known) in queued {
            if known {
                self.table_mut(CLASSIC_INLOCS_TABLE).add(shared, subscription);
            } else {
                shared.reject(subscription, SubscriptionFailure::InvalidColumnName);
            }
        }
    }

    pub(crate) fn on_area_changed(&mut self, shared: &mut Shared) {
        if let Some(table) = self.tables.get_mut(CLASSIC_INLOCS_TABLE) {
            table.restart_all(shared);
        }
    }

    pub(crate) fn on_classic_failure(&mut self, shared: &mut Shared, failure: SubscriptionFailure) {
        let Some(classic) = &mut self.classic else {
            return;
        };
        classic.on_failure(shared, failure);
        if let Some(table) = self.tables.get(CLASSIC_INLOCS_TABLE) {
            table.fail_all(shared, failure);
        }
    }

    // -------------------------------------------------------------------------
    // Advise callbacks and timers
    // -------------------------------------------------------------------------

    pub(crate) fn on_advise_ready(
        &mut self,
        shared: &mut Shared,
        table: &str,
        id: AdvisorId,
        description: Rc<RecordDescription>,
    ) {
        if let Some(table) = self.tables.get_mut(table) {
            table.on_advise_ready(shared, id, description);
        }
    }

    pub(crate) fn on_advise_records(
        &mut self,
        shared: &mut Shared,
        table: &str,
        id: AdvisorId,
        batch: Rc<RecordBatch>,
        more: bool,
    ) {
        if let Some(table) = self.tables.get_mut(table) {
            table.on_advise_records(shared, id, batch, more);
        }
    }

    pub(crate) fn on_advise_failure(
        &mut self,
        shared: &mut Shared,
        table: &str,
        id: AdvisorId,
        failure: AdviseFailure,
    ) {
        if let Some(table) = self.tables.get_mut(table) {
            table.on_advise_failure(shared, id, failure.into());
        }
    }

    pub(crate) fn on_restart_timer(&mut self, shared: &mut Shared, step: RestartStep, timer: TimerId) {
        match step {
            RestartStep::Advisor { table, id } => {
                if let Some(table) = self.tables.get_mut(&table) {
                    table.on_restart_timer(shared, id, timer);
                }
            }
            RestartStep::ClassicInlocs => {
                let Some(classic) = &mut self.classic else {
                    return;
                };
                if !classic.take_restart(timer) {
                    return;
                }
                let restarted = classic.start(shared);
                if let Err(failure) = restarted {
                    self.on_classic_failure(shared, failure);
                }
            }
        }
    }
}
