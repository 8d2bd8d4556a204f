//! Transactions layered on a connection or a resource context.
//!
//! Every transaction is an `Rc<RefCell<_>>` created with `Rc::new_cyclic` so
//! it can hand itself to the runtime as the receiver of its sessions. Client
//! callbacks are always posted, never called from inside a network callback,
//! and a transaction renews its [`ReceiverId`] when it finishes so callbacks
//! it posted earlier are dropped.

pub mod collect_area;
pub mod data_advisor;
pub mod enumerator;
pub mod settings;

pub use collect_area::{CollectAreaClient, CollectAreaFailure, CollectAreaMaintainer};
pub use data_advisor::{
    AdviseFailure, DataAdvisor, DataAdvisorClient, OrderOption, StartOption, StartSpec,
};
pub use enumerator::{
    BrokerEnumerator, DeviceEnumerator, EnumeratorClient, EnumeratorFailure, NotifyMode,
    PbRouterEnumerator, ResourceEnumerator, ResourceInfo,
};
pub use settings::{SettingsEnumerator, SettingsClient, SettingsFailure};

use cora_core::{ReceiverId, Runtime};

/// Liveness id of one transaction, retired when the transaction is dropped.
#[derive(Debug)]
pub(crate) struct Liveness {
    runtime: Runtime,
    id: ReceiverId,
}

impl Liveness {
    pub(crate) fn new(runtime: &Runtime) -> Self {
        Self {
            runtime: runtime.clone(),
            id: runtime.register(),
        }
    }

    pub(crate) fn id(&self) -> ReceiverId {
        self.id
    }

    /// Retire the current id and take a fresh one.
    pub(crate) fn renew(&mut self) {
        self.runtime.retire(self.id);
        self.id = self.runtime.register();
    }
}

impl Drop for Liveness {
    fn drop(&mut self) {
        self.runtime.retire(self.id);
    }
}
