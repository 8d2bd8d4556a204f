//! cora-client: Client runtime for cora servers.
//!
//! Provides:
//! - Logon and data manager configuration
//! - The connection and its logon state machine
//! - Resource contexts for brokers, devices and PakBus routers
//! - Transactions: resource enumerators, data advisors, settings
//!   enumerators and collect area maintainers
//! - The data manager, which multiplexes subscriptions onto shared advises

pub mod config;
pub mod connection;
pub mod context;
pub mod data_manager;
pub mod transaction;

pub use config::{DataManagerConfig, LogonConfig};
pub use connection::{
    Connection, ConnectionEvent, ConnectionFailure, ConnectionState, LogonStage, LogonStrategy,
};
pub use context::{
    AttachStage, Broker, BrokerContext, ContextEvent, ContextFailure, ContextState, Device,
    DeviceContext, PbRouter, PbRouterContext, ResourceContext, ResourceKind,
};
pub use data_manager::{DataManager, DataRequest, DataSubscriber, SubscriberRef, SubscriptionFailure};
pub use transaction::{
    AdviseFailure, CollectAreaClient, CollectAreaFailure, CollectAreaMaintainer, DataAdvisor,
    DataAdvisorClient, EnumeratorClient, EnumeratorFailure, NotifyMode, SettingsClient,
    SettingsEnumerator, SettingsFailure, StartOption, StartSpec,
};
