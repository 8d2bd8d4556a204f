//! Streaming table subscription on a data broker.
//!
//! A [`DataAdvisor`] attaches to a broker, fetches the definition of one
//! table, starts a data advise for a subset of its columns and then receives
//! record notifications, answering each with a continue command.

use std::cell::RefCell;
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;
use tracing::{debug, info, warn};

use cora_core::constants::OUTCOME_SUCCESS;
use cora_core::protocol::messages::broker;
use cora_core::protocol::{
    CloseReason, LgrDate, Message, Record, RecordBatch, RecordDescription, SessionNo,
};
use cora_core::{Error, Finish, Result, Runtime, SessionReceiver};

use super::Liveness;
use crate::config::LogonConfig;
use crate::connection::Connection;
use crate::context::{BrokerContext, ContextEvent, ContextFailure};

// =============================================================================
// Start specification
// =============================================================================

/// Where in the table the advise starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StartOption {
    AtRecord,
    AtTime,
    AtNewest,
    AfterNewest,
    RelativeToNewest,
    AtOffsetFromNewest,
}

impl StartOption {
    pub fn code(&self) -> u32 {
        match self {
            StartOption::AtRecord => 1,
            StartOption::AtTime => 2,
            StartOption::AtNewest => 3,
            StartOption::AfterNewest => 4,
            StartOption::RelativeToNewest => 5,
            StartOption::AtOffsetFromNewest => 6,
        }
    }
}

/// Order in which records are delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrderOption {
    Collected,
    LoggedWithHoles,
    LoggedWithoutHoles,
    /// Only the newest record, skipping anything older.
    RealTime,
}

impl OrderOption {
    pub fn code(&self) -> u32 {
        match self {
            OrderOption::Collected => 1,
            OrderOption::LoggedWithHoles => 2,
            OrderOption::LoggedWithoutHoles => 3,
            OrderOption::RealTime => 4,
        }
    }
}

/// Start position and ordering of a data advise.
///
/// Two specifications are interchangeable only if every field matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StartSpec {
    pub start_option: StartOption,
    pub order_option: OrderOption,
    pub file_mark_no: u32,
    pub record_no: u32,
    pub start_date: LgrDate,
    /// Nanoseconds before the newest record, for `RelativeToNewest`.
    pub start_interval: i64,
    /// Records before the newest record, for `AtOffsetFromNewest`.
    pub record_offset: u32,
}

impl Default for StartSpec {
    fn default() -> Self {
        Self::newest()
    }
}

impl StartSpec {
    fn with_start(start_option: StartOption) -> Self {
        Self {
            start_option,
            order_option: OrderOption::Collected,
            file_mark_no: 0,
            record_no: 0,
            start_date: LgrDate::default(),
            start_interval: 0,
            record_offset: 0,
        }
    }

    /// Start at the newest record, in collection order.
    pub fn newest() -> Self {
        Self::with_start(StartOption::AtNewest)
    }

    /// Only the newest record as it arrives.
    pub fn real_time() -> Self {
        Self::newest().with_order(OrderOption::RealTime)
    }

    pub fn at_record(file_mark_no: u32, record_no: u32) -> Self {
        Self {
            file_mark_no,
            record_no,
            ..Self::with_start(StartOption::AtRecord)
        }
    }

    pub fn at_time(start_date: LgrDate) -> Self {
        Self {
            start_date,
            ..Self::with_start(StartOption::AtTime)
        }
    }

    pub fn relative_to_newest(start_interval: i64) -> Self {
        Self {
            start_interval,
            ..Self::with_start(StartOption::RelativeToNewest)
        }
    }

    pub fn at_offset_from_newest(record_offset: u32) -> Self {
        Self {
            record_offset,
            ..Self::with_start(StartOption::AtOffsetFromNewest)
        }
    }

    pub fn with_order(mut self, order_option: OrderOption) -> Self {
        self.order_option = order_option;
        self
    }

    pub fn is_real_time(&self) -> bool {
        self.order_option == OrderOption::RealTime
    }

    fn write(&self, msg: &mut Message) {
        msg.add_u4(self.start_option.code());
        msg.add_u4(self.order_option.code());
        msg.add_u4(self.file_mark_no);
        msg.add_u4(self.record_no);
        msg.add_stamp(self.start_date);
        msg.add_i8(self.start_interval);
        msg.add_u4(self.record_offset);
    }
}

// =============================================================================
// Client interface
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum AdviseFailure {
    #[error(transparent)]
    Context(#[from] ContextFailure),
    #[error("no table with that name")]
    InvalidTableName,
    #[error("table was deleted")]
    TableDeleted,
    #[error("start position out of range")]
    InvalidRange,
    #[error("no column with that name")]
    InvalidColumnName,
    #[error("unknown failure")]
    Unknown,
}

impl AdviseFailure {
    fn from_outcome(outcome: u32) -> Self {
        match outcome {
            broker::ADVISE_INVALID_TABLE_NAME => AdviseFailure::InvalidTableName,
            broker::ADVISE_TABLE_DELETED => AdviseFailure::TableDeleted,
            broker::ADVISE_INVALID_RANGE => AdviseFailure::InvalidRange,
            broker::ADVISE_INVALID_COLUMN => AdviseFailure::InvalidColumnName,
            _ => AdviseFailure::Unknown,
        }
    }
}

pub trait DataAdvisorClient {
    /// The advise is running; records will follow this schema.
    fn on_advise_ready(&mut self, description: Rc<RecordDescription>);

    /// A batch of records. `more` is set while the server has a backlog.
    fn on_advise_records(&mut self, batch: Rc<RecordBatch>, more: bool);

    fn on_advise_failure(&mut self, failure: AdviseFailure);
}

// =============================================================================
// Data advisor
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisorState {
    Standby,
    Connecting,
    GettingTableDef,
    Starting,
    Started,
}

impl fmt::Display for AdvisorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AdvisorState::Standby => "standby",
            AdvisorState::Connecting => "connecting",
            AdvisorState::GettingTableDef => "getting table definition",
            AdvisorState::Starting => "starting",
            AdvisorState::Started => "started",
        };
        f.write_str(text)
    }
}

pub struct DataAdvisor {
    this: Weak<RefCell<Self>>,
    liveness: Liveness,
    context: BrokerContext,
    client: Option<Weak<RefCell<dyn DataAdvisorClient>>>,
    table: String,
    columns: Vec<String>,
    start: StartSpec,
    state: AdvisorState,
    description: Option<Rc<RecordDescription>>,
    pending_tran: Option<u32>,
    advise_tran: Option<u32>,
}

impl fmt::Debug for DataAdvisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataAdvisor")
            .field("state", &self.state)
            .field("broker", &self.context.name())
            .field("table", &self.table)
            .field("columns", &self.columns)
            .field("start", &self.start)
            .finish()
    }
}

impl DataAdvisor {
    pub fn new(runtime: Runtime, logon: LogonConfig) -> Rc<RefCell<Self>> {
        Rc::new_cyclic(|this| {
            RefCell::new(Self {
                this: this.clone(),
                liveness: Liveness::new(&runtime),
                context: BrokerContext::new(runtime, logon),
                client: None,
                table: String::new(),
                columns: Vec::new(),
                start: StartSpec::default(),
                state: AdvisorState::Standby,
                description: None,
                pending_tran: None,
                advise_tran: None,
            })
        })
    }

    pub fn state(&self) -> AdvisorState {
        self.state
    }

    pub fn context(&self) -> &BrokerContext {
        &self.context
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn start_spec(&self) -> &StartSpec {
        &self.start
    }

    /// Schema of the advised columns, once known.
    pub fn description(&self) -> Option<&Rc<RecordDescription>> {
        self.description.as_ref()
    }

    fn require_standby(&self) -> Result<()> {
        if self.state != AdvisorState::Standby {
            return Err(Error::InvalidState {
                expected: AdvisorState::Standby.to_string(),
                actual: self.state.to_string(),
            });
        }
        Ok(())
    }

    pub fn set_broker_name(&mut self, name: impl Into<String>) -> Result<()> {
        self.require_standby()?;
        self.context.set_name(name)
    }

    pub fn set_broker_id(&mut self, id: u32) -> Result<()> {
        self.require_standby()?;
        self.context.set_id(id)
    }

    pub fn set_table_name(&mut self, table: impl Into<String>) -> Result<()> {
        self.require_standby()?;
        self.table = table.into();
        Ok(())
    }

    /// Columns to advise. Empty selects the whole table.
    pub fn set_columns(&mut self, columns: Vec<String>) -> Result<()> {
        self.require_standby()?;
        self.columns = columns;
        Ok(())
    }

    pub fn set_start(&mut self, start: StartSpec) -> Result<()> {
        self.require_standby()?;
        self.start = start;
        Ok(())
    }

    fn prepare_start(&mut self, client: Weak<RefCell<dyn DataAdvisorClient>>) -> Result<()> {
        self.require_standby()?;
        if self.table.is_empty() {
            return Err(Error::InvalidArgument {
                message: "table name must be set".into(),
            });
        }
        if client.upgrade().is_none() {
            return Err(Error::InvalidArgument {
                message: "advisor client is gone".into(),
            });
        }
        self.client = Some(client);
        self.state = AdvisorState::Connecting;
        Ok(())
    }

    pub fn start(&mut self, client: Weak<RefCell<dyn DataAdvisorClient>>) -> Result<()> {
        self.prepare_start(client)?;
        let receiver: Weak<RefCell<dyn SessionReceiver>> = self.this.clone();
        if let Err(e) = self.context.start(receiver) {
            self.finish();
            return Err(e);
        }
        debug!(broker = %self.context.name(), table = %self.table, "advisor starting");
        Ok(())
    }

    pub fn start_from(
        &mut self,
        other: &Connection,
        client: Weak<RefCell<dyn DataAdvisorClient>>,
        use_own_logon: bool,
    ) -> Result<()> {
        self.prepare_start(client)?;
        let receiver: Weak<RefCell<dyn SessionReceiver>> = self.this.clone();
        if let Err(e) = self.context.start_from(other, receiver, use_own_logon) {
            self.finish();
            return Err(e);
        }
        Ok(())
    }

    pub fn finish(&mut self) {
        if let Some(tran) = self.advise_tran.take() {
            if let Ok(mut stop) = self.context.new_command(broker::DATA_ADVISE_STOP_CMD) {
                stop.add_u4(tran);
                if let Err(e) = self.context.send(stop) {
                    debug!(table = %self.table, error = %e, "could not stop advise");
                }
            }
        }
        self.context.finish();
        if self.state != AdvisorState::Standby {
            debug!(table = %self.table, from = %self.state, "advisor finished");
            self.liveness.renew();
        }
        self.state = AdvisorState::Standby;
        self.client = None;
        self.description = None;
        self.pending_tran = None;
    }

    fn post(&self, deliver: impl FnOnce(&mut (dyn DataAdvisorClient + 'static)) + 'static) {
        if let Some(client) = self.client.clone() {
            self.context
                .runtime()
                .post_to_client(self.liveness.id(), self.this.clone(), client, deliver);
        }
    }

    fn fail(&mut self, failure: AdviseFailure) {
        warn!(
            broker = %self.context.name(),
            table = %self.table,
            state = %self.state,
            failure = %failure,
            "advise failed"
        );
        let client = self.client.clone();
        self.finish();
        if let Some(client) = client {
            self.context.runtime().post_to_client(
                self.liveness.id(),
                self.this.clone(),
                client,
                move |c| c.on_advise_failure(failure),
            );
        }
    }

    fn send_command(&mut self, message_type: u32, fill: impl FnOnce(&mut Message)) -> Result<u32> {
        let mut msg = self.context.new_command(message_type)?;
        fill(&mut msg);
        let tran = msg.tran_no().unwrap_or_default();
        self.context.send(msg)?;
        Ok(tran)
    }

    fn on_context_ready(&mut self) {
        let table = self.table.clone();
        match self.send_command(broker::TABLE_DEF_GET_CMD, |msg| msg.add_str(&table)) {
            Ok(tran) => {
                self.pending_tran = Some(tran);
                self.state = AdvisorState::GettingTableDef;
            }
            Err(e) => {
                warn!(error = %e, "could not request table definition");
                self.fail(ContextFailure::Session.into());
            }
        }
    }

    fn on_broker_message(&mut self, mut msg: Message) {
        let tran = msg.tran_no();
        match (self.state, msg.message_type()) {
            (AdvisorState::GettingTableDef, broker::TABLE_DEF_GET_ACK) if tran == self.pending_tran => {
                self.on_table_def(&mut msg)
            }
            (AdvisorState::Starting, broker::DATA_ADVISE_START_ACK) if tran == self.advise_tran => {
                self.on_start_ack(&mut msg)
            }
            (AdvisorState::Starting | AdvisorState::Started, broker::DATA_ADVISE_NOT)
                if tran == self.advise_tran =>
            {
                self.on_records(&mut msg)
            }
            (state, message_type) => {
                debug!(state = %state, message_type, "ignoring broker message");
            }
        }
    }

    fn on_table_def(&mut self, msg: &mut Message) {
        self.pending_tran = None;
        let broker_name = self.context.resolved_name().to_string();
        let parsed = msg.read_u4().and_then(|_| msg.read_u4()).and_then(|outcome| {
            if outcome != OUTCOME_SUCCESS {
                return Ok(Err(AdviseFailure::from_outcome(outcome)));
            }
            RecordDescription::read(&broker_name, msg).map(Ok)
        });
        let full = match parsed {
            Ok(Ok(full)) => full,
            Ok(Err(failure)) => return self.fail(failure),
            Err(e) => {
                debug!(error = %e, "malformed table definition");
                return self.fail(AdviseFailure::Unknown);
            }
        };
        let selected = match full.select(&self.columns) {
            Ok(selected) => selected,
            Err(_) => return self.fail(AdviseFailure::InvalidColumnName),
        };
        self.description = Some(Rc::new(selected));

        let table = self.table.clone();
        let columns = self.columns.clone();
        let start = self.start;
        let sent = self.send_command(broker::DATA_ADVISE_START_CMD, |out| {
            out.add_str(&table);
            start.write(out);
            out.add_u4(columns.len() as u32);
            for column in &columns {
                out.add_str(column);
            }
        });
        match sent {
            Ok(tran) => {
                self.advise_tran = Some(tran);
                self.state = AdvisorState::Starting;
            }
            Err(e) => {
                warn!(error = %e, "could not start advise");
                self.fail(ContextFailure::Session.into());
            }
        }
    }

    fn on_start_ack(&mut self, msg: &mut Message) {
        let outcome = match msg.read_u4().and_then(|_| msg.read_u4()) {
            Ok(outcome) => outcome,
            Err(_) => return self.fail(AdviseFailure::Unknown),
        };
        if outcome != OUTCOME_SUCCESS {
            // The server holds no advise to stop.
            self.advise_tran = None;
            return self.fail(AdviseFailure::from_outcome(outcome));
        }
        self.state = AdvisorState::Started;
        info!(broker = %self.context.resolved_name(), table = %self.table, "advise started");
        if let Some(description) = self.description.clone() {
            self.post(move |c| c.on_advise_ready(description));
        }
    }

    fn on_records(&mut self, msg: &mut Message) {
        let Some(description) = self.description.clone() else {
            return self.fail(AdviseFailure::Unknown);
        };
        let decoded = read_notification(msg, &description);
        let (batch, more) = match decoded {
            Ok(Ok(decoded)) => decoded,
            Ok(Err(outcome)) => {
                self.advise_tran = None;
                return self.fail(AdviseFailure::from_outcome(outcome));
            }
            Err(e) => {
                debug!(error = %e, "malformed record notification");
                return self.fail(AdviseFailure::Unknown);
            }
        };

        let advise_tran = self.advise_tran.unwrap_or_default();
        if let Err(e) = self.send_command(broker::DATA_ADVISE_CONT_CMD, |out| out.add_u4(advise_tran)) {
            warn!(error = %e, "could not continue advise");
            return self.fail(ContextFailure::Session.into());
        }
        debug!(table = %self.table, records = batch.len(), more, "records received");
        let batch = Rc::new(batch);
        self.post(move |c| c.on_advise_records(batch, more));
    }
}

/// Decode a record notification. The inner error is a failure outcome.
fn read_notification(
    msg: &mut Message,
    description: &Rc<RecordDescription>,
) -> Result<std::result::Result<(RecordBatch, bool), u32>> {
    msg.read_u4()?;
    let outcome = msg.read_u4()?;
    if outcome != OUTCOME_SUCCESS {
        return Ok(Err(outcome));
    }
    let more = msg.read_bool()?;
    let count = msg.read_u4()?;
    let mut records = Vec::new();
    for _ in 0..count {
        records.push(Record::read(description.clone(), msg)?);
    }
    Ok(Ok((RecordBatch::new(description.clone(), records), more)))
}

impl SessionReceiver for DataAdvisor {
    fn on_message(&mut self, msg: Message) {
        match self.context.handle_message(msg) {
            Some(ContextEvent::Ready) => self.on_context_ready(),
            Some(ContextEvent::Failed(failure)) => self.fail(failure.into()),
            Some(ContextEvent::Message(msg)) => self.on_broker_message(msg),
            Some(ContextEvent::NetMessage(_)) | None => {}
        }
    }

    fn on_session_broken(&mut self, session: SessionNo, reason: CloseReason) {
        if let Some(ContextEvent::Failed(failure)) = self.context.handle_session_broken(session, reason) {
            self.fail(failure.into());
        }
    }
}

impl Finish for DataAdvisor {
    fn finish(&mut self) {
        DataAdvisor::finish(self);
    }
}

impl Drop for DataAdvisor {
    fn drop(&mut self) {
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use cora_core::protocol::messages::lgrnet;
    use cora_core::protocol::{Value, ValueDesc, ValueType};
    use cora_test_utils::{FakeServer, fake_runtime};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        ready: Vec<Rc<RecordDescription>>,
        batches: Vec<(Rc<RecordBatch>, bool)>,
        failures: Vec<AdviseFailure>,
    }

    impl DataAdvisorClient for Recorder {
        fn on_advise_ready(&mut self, description: Rc<RecordDescription>) {
            self.ready.push(description);
        }
        fn on_advise_records(&mut self, batch: Rc<RecordBatch>, more: bool) {
            self.batches.push((batch, more));
        }
        fn on_advise_failure(&mut self, failure: AdviseFailure) {
            self.failures.push(failure);
        }
    }

    fn status_table() -> RecordDescription {
        RecordDescription::new(
            "ws1",
            "Status",
            vec![
                ValueDesc::scalar("Battery", ValueType::Ieee4),
                ValueDesc::scalar("PanelTemp", ValueType::Ieee8),
                ValueDesc::scalar("Flags", ValueType::UInt2),
            ],
        )
    }

    fn advisor(
        table: &str,
        columns: &[&str],
    ) -> (FakeServer, Rc<RefCell<DataAdvisor>>, Rc<RefCell<Recorder>>) {
        let (runtime, mut server) = fake_runtime();
        server.add_broker("ws1", vec![status_table()]);
        let advisor = DataAdvisor::new(runtime, LogonConfig::default());
        {
            let mut a = advisor.borrow_mut();
            a.set_broker_name("ws1").unwrap();
            a.set_table_name(table).unwrap();
            a.set_columns(columns.iter().map(|c| c.to_string()).collect()).unwrap();
            a.set_start(StartSpec::real_time()).unwrap();
        }
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let client: Weak<RefCell<dyn DataAdvisorClient>> = Rc::downgrade(&recorder) as _;
        advisor.borrow_mut().start(client).unwrap();
        server.pump();
        (server, advisor, recorder)
    }

    #[test]
    fn start_spec_equality_covers_every_field() {
        assert_eq!(StartSpec::real_time(), StartSpec::real_time());
        assert_ne!(StartSpec::real_time(), StartSpec::newest());
        assert_ne!(StartSpec::at_record(1, 10), StartSpec::at_record(1, 11));
        assert_ne!(
            StartSpec::relative_to_newest(5),
            StartSpec::relative_to_newest(6)
        );
        assert!(StartSpec::real_time().is_real_time());
        assert!(!StartSpec::at_record(1, 1).is_real_time());
    }

    #[test]
    fn advise_delivers_selected_columns() {
        let (mut server, advisor, recorder) = advisor("Status", &["PanelTemp"]);
        assert_eq!(advisor.borrow().state(), AdvisorState::Started);
        assert_eq!(recorder.borrow().ready.len(), 1);
        assert_eq!(recorder.borrow().ready[0].values.len(), 1);

        let start = &server.advise_starts()[0];
        assert_eq!(start.columns, ["PanelTemp"]);
        assert_eq!(start.order_option, OrderOption::RealTime.code());

        server.push_records("ws1", "Status", 2, false);
        server.pump();
        let recorder = recorder.borrow();
        let (batch, more) = &recorder.batches[0];
        assert!(!more);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.records[0].value("PanelTemp"), Some(&[Value::Float(0.5)][..]));
        assert!(Rc::ptr_eq(batch.records[0].description(), &recorder.ready[0]));
        assert_eq!(server.handle().count_of_type(broker::DATA_ADVISE_CONT_CMD), 1);
    }

    #[test]
    fn unknown_table_fails() {
        let (_server, advisor, recorder) = advisor("Nope", &[]);
        assert_eq!(recorder.borrow().failures, [AdviseFailure::InvalidTableName]);
        assert_eq!(advisor.borrow().state(), AdvisorState::Standby);
    }

    #[test]
    fn unknown_column_fails() {
        let (server, _advisor, recorder) = advisor("Status", &["Nope"]);
        assert_eq!(recorder.borrow().failures, [AdviseFailure::InvalidColumnName]);
        assert_eq!(server.handle().count_of_type(broker::DATA_ADVISE_START_CMD), 0);
    }

    #[test]
    fn failure_notification_maps_outcome() {
        let (mut server, _advisor, recorder) = advisor("Status", &[]);
        server.fail_advises("ws1", "Status", broker::ADVISE_TABLE_DELETED);
        assert_eq!(recorder.borrow().failures, [AdviseFailure::TableDeleted]);
    }

    #[test]
    fn missing_broker_fails_with_context_failure() {
        let (runtime, mut server) = fake_runtime();
        let advisor = DataAdvisor::new(runtime, LogonConfig::default());
        advisor.borrow_mut().set_broker_name("ghost").unwrap();
        advisor.borrow_mut().set_table_name("Status").unwrap();
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let client: Weak<RefCell<dyn DataAdvisorClient>> = Rc::downgrade(&recorder) as _;
        advisor.borrow_mut().start(client).unwrap();
        server.pump();
        assert_eq!(
            recorder.borrow().failures,
            [AdviseFailure::Context(ContextFailure::InvalidName)]
        );
        assert_eq!(server.handle().count_of_type(lgrnet::OPEN_BROKER_CMD), 1);
    }

    #[test]
    fn finish_stops_the_advise_once() {
        let (mut server, advisor, recorder) = advisor("Status", &[]);
        assert_eq!(server.active_advises("ws1", "Status"), 1);
        advisor.borrow_mut().finish();
        advisor.borrow_mut().finish();
        server.pump();
        assert_eq!(server.handle().count_of_type(broker::DATA_ADVISE_STOP_CMD), 1);
        assert!(server.handle().open_sessions().is_empty());
        assert!(recorder.borrow().failures.is_empty());
    }

    #[test]
    fn records_queued_before_finish_are_dropped() {
        let (mut server, advisor, recorder) = advisor("Status", &[]);
        let runtime = advisor.borrow().context().runtime().clone();
        let session = advisor.borrow().context().session().unwrap();
        let tran = advisor.borrow().advise_tran.unwrap();
        advisor.borrow_mut().on_records(&mut {
            let mut msg = Message::command(session, broker::DATA_ADVISE_NOT, tran);
            msg.add_u4(OUTCOME_SUCCESS);
            msg.add_bool(false);
            msg.add_u4(0);
            msg
        });
        assert_eq!(runtime.pending_count(), 1);
        advisor.borrow_mut().finish();
        runtime.run_pending();
        server.pump();
        assert!(recorder.borrow().batches.is_empty());
    }

    #[test]
    fn dropping_the_advisor_closes_its_sessions() {
        let (server, advisor, _recorder) = advisor("Status", &[]);
        assert_eq!(server.handle().open_sessions().len(), 2);
        drop(advisor);
        assert!(server.handle().open_sessions().is_empty());
    }
}
