//! Advisors of one broker table.

use std::collections::BTreeMap;
use std::rc::Rc;

use tracing::debug;

use cora_core::TimerId;
use cora_core::protocol::{RecordBatch, RecordDescription};

use super::advisor::{AdvisorId, AdvisorPhase, TableDataAdvisor};
use super::{DataRequest, Shared, SubscriberRef, Subscription, SubscriptionFailure};

#[derive(Debug)]
pub(crate) struct TableDataManager {
    broker: String,
    name: String,
    /// Column requests are checked against the advised schema.
    check_columns: bool,
    advisors: BTreeMap<AdvisorId, TableDataAdvisor>,
}

impl TableDataManager {
    pub(crate) fn new(broker: &str, name: &str, check_columns: bool) -> Self {
        Self {
            broker: broker.to_string(),
            name: name.to_string(),
            check_columns,
            advisors: BTreeMap::new(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.advisors.is_empty()
    }

    pub(crate) fn advisor_count(&self) -> usize {
        self.advisors.len()
    }

    #[cfg(test)]
    pub(crate) fn advisor_ids(&self) -> Vec<AdvisorId> {
        self.advisors.keys().copied().collect()
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.advisors.values().map(|a| a.subscriptions().len()).sum()
    }

    pub(crate) fn requests(&self) -> impl Iterator<Item = &DataRequest> + '_ {
        self.advisors
            .values()
            .flat_map(|a| a.subscriptions().iter().map(Subscription::request))
    }

    pub(crate) fn restart_pending(&self) -> bool {
        self.advisors.values().any(TableDataAdvisor::restart_pending)
    }

    fn is_active(&self) -> bool {
        self.advisors.values().any(|a| a.phase() == AdvisorPhase::Active)
    }

    pub(crate) fn contains(&self, request: &DataRequest, subscriber: &SubscriberRef) -> bool {
        self.advisors.values().any(|a| a.contains(request, subscriber))
    }

    /// Attach a subscription to a shared advisor, creating one if none
    /// accepts it.
    pub(crate) fn add(&mut self, shared: &mut Shared, subscription: Subscription) {
        let start = subscription.request().start;
        let active = self.is_active();
        let joined = self
            .advisors
            .values_mut()
            .find(|a| a.accepts(&start, active));
        match joined {
            Some(advisor) => {
                debug!(table = %self.name, advisor = %advisor.id(), "joining advisor");
                advisor.add(shared, subscription, self.check_columns);
            }
            None => {
                let mut advisor = TableDataAdvisor::new(shared, &self.broker, &self.name, start);
                advisor.add(shared, subscription, self.check_columns);
                advisor.launch(shared);
                self.advisors.insert(advisor.id(), advisor);
            }
        }
    }

    pub(crate) fn remove(
        &mut self,
        shared: &Shared,
        request: &DataRequest,
        subscriber: &SubscriberRef,
    ) -> bool {
        let removed = self
            .advisors
            .values_mut()
            .find_map(|a| a.remove(request, subscriber));
        match removed {
            Some(subscription) => {
                shared.unsubscribe(subscription);
                self.prune(shared);
                true
            }
            None => false,
        }
    }

    /// Release advisors nobody subscribes to.
    pub(crate) fn prune(&mut self, shared: &Shared) {
        let table = &self.name;
        self.advisors.retain(|id, advisor| {
            if !advisor.is_empty() {
                return true;
            }
            debug!(table = %table, advisor = %id, "advisor released");
            advisor.teardown(shared);
            false
        });
    }

    /// Re-issue every advise, picking up a changed table definition.
    pub(crate) fn restart_all(&mut self, shared: &Shared) {
        for advisor in self.advisors.values_mut() {
            advisor.restart(shared);
        }
    }

    /// Forward a failure that is not specific to one advise.
    pub(crate) fn fail_all(&self, shared: &Shared, failure: SubscriptionFailure) {
        for advisor in self.advisors.values() {
            for subscription in advisor.subscriptions() {
                subscription.post_failure(&shared.runtime, failure);
            }
        }
    }

    pub(crate) fn on_advise_ready(&mut self, shared: &Shared, id: AdvisorId, description: Rc<RecordDescription>) {
        let check_columns = self.check_columns;
        if let Some(advisor) = self.advisors.get_mut(&id) {
            advisor.on_ready(shared, description, check_columns);
        }
    }

    pub(crate) fn on_advise_records(&mut self, shared: &Shared, id: AdvisorId, batch: Rc<RecordBatch>, more: bool) {
        if let Some(advisor) = self.advisors.get_mut(&id) {
            advisor.on_records(shared, batch, more);
        }
    }

    pub(crate) fn on_advise_failure(&mut self, shared: &Shared, id: AdvisorId, failure: SubscriptionFailure) {
        if let Some(advisor) = self.advisors.get_mut(&id) {
            advisor.on_failure(shared, failure);
        }
    }

    pub(crate) fn on_restart_timer(&mut self, shared: &Shared, id: AdvisorId, timer: TimerId) {
        match self.advisors.get_mut(&id) {
            Some(advisor) => advisor.on_restart_timer(shared, timer),
            None => debug!(table = %self.name, advisor = %id, "restart for released advisor"),
        }
    }

    pub(crate) fn teardown(&mut self, shared: &Shared) {
        for advisor in self.advisors.values_mut() {
            advisor.teardown(shared);
        }
        self.advisors.clear();
    }
}
