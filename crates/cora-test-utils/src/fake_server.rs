//! Scripted in-process server.
//!
//! [`FakeServer`] reads the outbound log of a [`MockHandle`] and answers each
//! command by injecting replies into the [`Runtime`], the same way a network
//! driver would. Answers are produced only from [`FakeServer::pump`], so the
//! client never sees a reply while it is still inside its own `send`.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::rc::Rc;

use tracing::debug;

use cora_core::auth;
use cora_core::constants::{
    CHANGE_ADDED, CHANGE_DELETED, DEFAULT_INLOC_COUNT, DEFAULT_INLOC_PREFIX, OUTCOME_SUCCESS,
};
use cora_core::protocol::messages::{broker, device, lgrnet, router, settings};
use cora_core::protocol::{
    CloseReason, InputLocationLabels, LgrDate, Message, RecordDescription, SessionNo, Setting,
    ValueDesc, ValueType,
};
use cora_core::transport::Outbound;
use cora_core::{Result, Runtime};

use crate::mock_transport::{MockHandle, MockTransport};

/// Which resource list an item belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceType {
    Broker,
    Device,
    Router,
}

impl ResourceType {
    fn enum_not(&self) -> u32 {
        match self {
            ResourceType::Broker => lgrnet::BROKERS_ENUM_NOT,
            ResourceType::Device => lgrnet::DEVICES_ENUM_NOT,
            ResourceType::Router => lgrnet::ROUTERS_ENUM_NOT,
        }
    }
}

#[derive(Debug)]
struct Resource {
    kind: ResourceType,
    id: u32,
    name: String,
}

#[derive(Debug)]
struct Binding {
    kind: ResourceType,
    name: String,
}

#[derive(Debug)]
struct EnumWatch {
    session: SessionNo,
    tran_no: u32,
    kind: ResourceType,
}

#[derive(Debug)]
struct Advise {
    session: SessionNo,
    tran_no: u32,
    broker: String,
    table: String,
    description: Rc<RecordDescription>,
}

#[derive(Debug)]
struct CollectArea {
    session: SessionNo,
    device: String,
    name: String,
}

/// Start parameters of one accepted data advise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdviseStart {
    pub broker: String,
    pub table: String,
    pub start_option: u32,
    pub order_option: u32,
    pub columns: Vec<String>,
}

/// Scripted server answering the client side of a [`MockTransport`].
#[derive(Debug)]
pub struct FakeServer {
    runtime: Runtime,
    handle: MockHandle,
    cursor: usize,
    server_name: String,
    version: String,
    access_level: u32,
    users: BTreeMap<String, String>,
    tokens: BTreeMap<String, u32>,
    resources: Vec<Resource>,
    tables: BTreeMap<String, BTreeMap<String, RecordDescription>>,
    labels: BTreeMap<String, Option<Vec<String>>>,
    next_id: u32,
    omit_open_names: bool,
    scripted: HashMap<u32, VecDeque<u32>>,
    held: HashSet<u32>,
    held_messages: Vec<Message>,
    released: VecDeque<Message>,
    bindings: HashMap<SessionNo, Binding>,
    challenges: HashMap<SessionNo, (String, Vec<u8>)>,
    enums: Vec<EnumWatch>,
    advises: Vec<Advise>,
    advise_starts: Vec<AdviseStart>,
    areas: Vec<CollectArea>,
    next_record_no: u32,
}

/// Create a runtime over a mock transport together with a server answering it.
pub fn fake_runtime() -> (Runtime, FakeServer) {
    let (transport, handle) = MockTransport::new();
    let runtime = Runtime::new(transport);
    let server = FakeServer::new(runtime.clone(), handle);
    (runtime, server)
}

impl FakeServer {
    pub fn new(runtime: Runtime, handle: MockHandle) -> Self {
        Self {
            runtime,
            handle,
            cursor: 0,
            server_name: "fake-loggernet".into(),
            version: "1.3.1.20".into(),
            access_level: 1000,
            users: BTreeMap::new(),
            tokens: BTreeMap::new(),
            resources: Vec::new(),
            tables: BTreeMap::new(),
            labels: BTreeMap::new(),
            next_id: 1,
            omit_open_names: false,
            scripted: HashMap::new(),
            held: HashSet::new(),
            held_messages: Vec::new(),
            released: VecDeque::new(),
            bindings: HashMap::new(),
            challenges: HashMap::new(),
            enums: Vec::new(),
            advises: Vec::new(),
            advise_starts: Vec::new(),
            areas: Vec::new(),
            next_record_no: 1,
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn handle(&self) -> &MockHandle {
        &self.handle
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Version reported by the server; decides the logon strategy.
    pub fn set_version(&mut self, version: &str) {
        self.version = version.into();
    }

    /// Register an account. With no accounts registered every logon succeeds.
    pub fn add_user(&mut self, name: &str, password: &str) {
        self.users.insert(name.into(), password.into());
    }

    /// Register an access token and the outcome its logon yields.
    pub fn add_token(&mut self, token: &str, outcome: u32) {
        self.tokens.insert(token.into(), outcome);
    }

    /// Answer opens by id with an empty name.
    pub fn set_omit_open_names(&mut self, omit: bool) {
        self.omit_open_names = omit;
    }

    /// Add a data broker with its tables; returns its id.
    pub fn add_broker(&mut self, name: &str, tables: Vec<RecordDescription>) -> u32 {
        let id = self.add_resource(ResourceType::Broker, name);
        let entry = self.tables.entry(name.into()).or_default();
        for table in tables {
            entry.insert(table.table.clone(), table);
        }
        id
    }

    /// Define or replace one table of an existing broker.
    pub fn add_table(&mut self, broker: &str, table: RecordDescription) {
        self.tables
            .entry(broker.into())
            .or_default()
            .insert(table.table.clone(), table);
    }

    /// Add a device. `labels` is its input-location label setting, if it has one.
    pub fn add_device(&mut self, name: &str, labels: Option<Vec<String>>) -> u32 {
        self.labels.insert(name.into(), labels);
        self.add_resource(ResourceType::Device, name)
    }

    pub fn add_router(&mut self, name: &str) -> u32 {
        self.add_resource(ResourceType::Router, name)
    }

    /// Remove a resource and report the deletion to running enumerations.
    pub fn remove_resource(&mut self, kind: ResourceType, name: &str) {
        let Some(pos) = self
            .resources
            .iter()
            .position(|r| r.kind == kind && r.name == name)
        else {
            return;
        };
        let resource = self.resources.remove(pos);
        self.notify_change(kind, CHANGE_DELETED, resource.id, &resource.name);
    }

    fn add_resource(&mut self, kind: ResourceType, name: &str) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.resources.push(Resource {
            kind,
            id,
            name: name.into(),
        });
        self.notify_change(kind, CHANGE_ADDED, id, name);
        id
    }

    // =========================================================================
    // Scripting
    // =========================================================================

    /// Answer the next command of `command_type` with `outcome`.
    pub fn fail_next(&mut self, command_type: u32, outcome: u32) {
        self.scripted.entry(command_type).or_default().push_back(outcome);
    }

    /// Leave commands of `command_type` unanswered until released.
    pub fn hold(&mut self, command_type: u32) {
        self.held.insert(command_type);
    }

    /// Answer held commands of `command_type` at the next pump.
    pub fn release(&mut self, command_type: u32) {
        self.held.remove(&command_type);
        let (ready, kept): (Vec<_>, Vec<_>) = self
            .held_messages
            .drain(..)
            .partition(|msg| msg.message_type() == command_type);
        self.held_messages = kept;
        self.released.extend(ready);
    }

    pub fn held_count(&self) -> usize {
        self.held_messages.len()
    }

    /// Report a session as broken to the client.
    pub fn break_session(&mut self, session: SessionNo, reason: CloseReason) {
        self.forget_session(session);
        self.runtime.on_session_broken(session, reason);
    }

    /// Sessions currently attached to the named resource.
    pub fn sessions_bound_to(&self, kind: ResourceType, name: &str) -> Vec<SessionNo> {
        let mut sessions: Vec<SessionNo> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.kind == kind && b.name == name)
            .map(|(s, _)| *s)
            .collect();
        sessions.sort();
        sessions
    }

    /// Deliver a hand-built message to the client.
    pub fn deliver(&mut self, msg: Message) {
        self.runtime.on_message(msg);
    }

    /// Advises accepted so far, in order.
    pub fn advise_starts(&self) -> &[AdviseStart] {
        &self.advise_starts
    }

    /// Advises currently running for a table.
    pub fn active_advises(&self, broker: &str, table: &str) -> usize {
        self.advises
            .iter()
            .filter(|a| a.broker == broker && a.table == table)
            .count()
    }

    /// Send `count` synthesized records to every advise on a table.
    ///
    /// Returns the number of notifications delivered.
    pub fn push_records(&mut self, broker_name: &str, table: &str, count: u32, more: bool) -> usize {
        let first = self.next_record_no;
        self.next_record_no += count;
        let targets: Vec<Message> = self
            .advises
            .iter()
            .filter(|a| a.broker == broker_name && a.table == table)
            .map(|a| {
                let mut msg = Message::command(a.session, broker::DATA_ADVISE_NOT, a.tran_no);
                msg.add_u4(OUTCOME_SUCCESS);
                msg.add_bool(more);
                msg.add_u4(count);
                for record_no in first..first + count {
                    write_sample_record(&mut msg, &a.description, record_no);
                }
                msg
            })
            .collect();
        let delivered = targets.len();
        for msg in targets {
            self.runtime.on_message(msg);
        }
        delivered
    }

    /// Fail every advise on a table with `outcome` and forget them.
    pub fn fail_advises(&mut self, broker_name: &str, table: &str, outcome: u32) -> usize {
        let (failed, kept): (Vec<_>, Vec<_>) = self
            .advises
            .drain(..)
            .partition(|a| a.broker == broker_name && a.table == table);
        self.advises = kept;
        let delivered = failed.len();
        for advise in failed {
            let mut msg = Message::command(advise.session, broker::DATA_ADVISE_NOT, advise.tran_no);
            msg.add_u4(outcome);
            msg.add_bool(false);
            msg.add_u4(0);
            self.runtime.on_message(msg);
        }
        delivered
    }

    // =========================================================================
    // Pumping
    // =========================================================================

    /// Answer everything the client has sent, including what it sends in
    /// response to the answers. Returns the number of commands answered.
    pub fn pump(&mut self) -> usize {
        // Events the application posted outside any network callback.
        self.runtime.run_pending();
        let mut answered = 0;
        loop {
            let mut work: Vec<Outbound> = self.released.drain(..).map(Outbound::Send).collect();
            let fresh = self.handle.events_since(self.cursor);
            self.cursor += fresh.len();
            work.extend(fresh);
            if work.is_empty() {
                break;
            }
            for event in work {
                match event {
                    Outbound::Open(_) => {}
                    Outbound::Close(session) => self.forget_session(session),
                    Outbound::Send(msg) if self.held.contains(&msg.message_type()) => {
                        self.held_messages.push(msg);
                    }
                    Outbound::Send(msg) => {
                        answered += 1;
                        let message_type = msg.message_type();
                        match self.answer(msg) {
                            Ok(replies) => {
                                for reply in replies {
                                    self.runtime.on_message(reply);
                                }
                            }
                            Err(e) => debug!(message_type, error = %e, "malformed command"),
                        }
                    }
                }
            }
        }
        answered
    }

    fn forget_session(&mut self, session: SessionNo) {
        self.bindings.remove(&session);
        self.challenges.remove(&session);
        self.enums.retain(|e| e.session != session);
        self.advises.retain(|a| a.session != session);
        self.areas.retain(|a| a.session != session);
    }

    fn scripted_outcome(&mut self, command_type: u32) -> Option<u32> {
        self.scripted.get_mut(&command_type)?.pop_front()
    }

    fn answer(&mut self, mut msg: Message) -> Result<Vec<Message>> {
        let session = msg.session_no();
        let command = msg.message_type();
        let tran_no = msg.read_u4()?;
        let reply = |message_type: u32| Message::command(session, message_type, tran_no);

        let out = match command {
            lgrnet::QUERY_SERVER_CMD => {
                let mut ack = reply(lgrnet::QUERY_SERVER_ACK);
                ack.add_str(&self.server_name);
                ack.add_str(&self.version);
                ack
            }
            lgrnet::LOGON_CMD => {
                let user = msg.read_str()?;
                let password = msg.read_str()?;
                let accepted = self.scripted_outcome(command).is_none()
                    && self.users.get(&user).map_or(self.users.is_empty(), |p| *p == password);
                let mut ack = reply(lgrnet::LOGON_ACK);
                ack.add_bool(accepted);
                ack.add_u4(self.access_level);
                ack
            }
            lgrnet::LOGON_CHALLENGE_CMD => {
                let user = msg.read_str()?;
                let outcome = self.scripted_outcome(command).unwrap_or(OUTCOME_SUCCESS);
                let server_token = format!("token-{}-{}", session, tran_no).into_bytes();
                self.challenges.insert(session, (user, server_token.clone()));
                let mut ack = reply(lgrnet::LOGON_CHALLENGE_ACK);
                ack.add_u4(outcome);
                ack.add_bytes(&server_token);
                ack.add_u4(0x5eed_0000 + tran_no);
                ack
            }
            lgrnet::LOGON_RESPONSE_CMD => {
                let client_token = msg.read_bytes()?;
                let digest = msg.read_bytes()?;
                let accepted = match self.challenges.remove(&session) {
                    Some((user, server_token)) => match self.users.get(&user) {
                        Some(password) => {
                            auth::verify_response(&client_token, &server_token, password, &digest)
                        }
                        None => self.users.is_empty(),
                    },
                    None => false,
                };
                let mut ack = reply(lgrnet::LOGON_RESPONSE_ACK);
                ack.add_bool(accepted);
                ack.add_u4(self.access_level);
                ack
            }
            lgrnet::TOKEN_LOGON_CMD => {
                let token = msg.read_str()?;
                let outcome = self
                    .scripted_outcome(command)
                    .or_else(|| self.tokens.get(&token).copied())
                    .unwrap_or(lgrnet::TOKEN_INVALID);
                let mut ack = reply(lgrnet::TOKEN_LOGON_ACK);
                ack.add_u4(outcome);
                ack.add_u4(self.access_level);
                ack
            }
            lgrnet::OPEN_BROKER_CMD | lgrnet::OPEN_DEVICE_CMD | lgrnet::OPEN_ROUTER_CMD => {
                let kind = open_kind(command);
                let name = msg.read_str()?;
                let found = self.resources.iter().any(|r| r.kind == kind && r.name == name);
                self.open_ack(session, tran_no, command, command + 1, kind, found.then_some(name), false)
            }
            lgrnet::OPEN_BROKER_BY_ID_CMD
            | lgrnet::OPEN_DEVICE_BY_ID_CMD
            | lgrnet::OPEN_ROUTER_BY_ID_CMD => {
                let kind = open_kind(command);
                let id = msg.read_u4()?;
                let name = self
                    .resources
                    .iter()
                    .find(|r| r.kind == kind && r.id == id)
                    .map(|r| r.name.clone());
                let omit = self.omit_open_names;
                self.open_ack(session, tran_no, command, command + 1, kind, name, omit)
            }
            lgrnet::BROKERS_ENUM_CMD | lgrnet::DEVICES_ENUM_CMD | lgrnet::ROUTERS_ENUM_CMD => {
                let kind = match command {
                    lgrnet::BROKERS_ENUM_CMD => ResourceType::Broker,
                    lgrnet::DEVICES_ENUM_CMD => ResourceType::Device,
                    _ => ResourceType::Router,
                };
                let outcome = self.scripted_outcome(command).unwrap_or(OUTCOME_SUCCESS);
                let mut not = reply(kind.enum_not());
                not.add_u4(outcome);
                if outcome == OUTCOME_SUCCESS {
                    let items: Vec<&Resource> =
                        self.resources.iter().filter(|r| r.kind == kind).collect();
                    not.add_u4(items.len() as u32);
                    for item in items {
                        write_enum_item(&mut not, CHANGE_ADDED, item.id, &item.name);
                    }
                    self.enums.push(EnumWatch {
                        session,
                        tran_no,
                        kind,
                    });
                } else {
                    not.add_u4(0);
                }
                not
            }
            lgrnet::BROKERS_ENUM_STOP_CMD
            | lgrnet::DEVICES_ENUM_STOP_CMD
            | lgrnet::ROUTERS_ENUM_STOP_CMD => {
                let enum_tran = msg.read_u4()?;
                self.enums
                    .retain(|e| !(e.session == session && e.tran_no == enum_tran));
                return Ok(Vec::new());
            }
            broker::TABLE_DEF_GET_CMD => {
                let Some(broker_name) = self.bound_name(session, ResourceType::Broker) else {
                    return Ok(vec![unsupported(session, command)]);
                };
                let table = msg.read_str()?;
                let description = self.table(&broker_name, &table);
                let outcome = self.scripted_outcome(command).unwrap_or(if description.is_some() {
                    OUTCOME_SUCCESS
                } else {
                    broker::ADVISE_INVALID_TABLE_NAME
                });
                let mut ack = reply(broker::TABLE_DEF_GET_ACK);
                ack.add_u4(outcome);
                if let (OUTCOME_SUCCESS, Some(description)) = (outcome, description) {
                    description.write(&mut ack);
                }
                ack
            }
            broker::DATA_ADVISE_START_CMD => {
                let Some(broker_name) = self.bound_name(session, ResourceType::Broker) else {
                    return Ok(vec![unsupported(session, command)]);
                };
                let table = msg.read_str()?;
                let start_option = msg.read_u4()?;
                let order_option = msg.read_u4()?;
                msg.skip(4 + 4 + 8 + 8 + 4)?;
                let column_count = msg.read_u4()?;
                let mut columns = Vec::new();
                for _ in 0..column_count {
                    columns.push(msg.read_str()?);
                }

                let selected = match self.table(&broker_name, &table) {
                    None => Err(broker::ADVISE_INVALID_TABLE_NAME),
                    Some(description) => description
                        .select(&columns)
                        .map_err(|_| broker::ADVISE_INVALID_COLUMN),
                };
                let outcome = match (self.scripted_outcome(command), &selected) {
                    (Some(outcome), _) => outcome,
                    (None, Ok(_)) => OUTCOME_SUCCESS,
                    (None, Err(outcome)) => *outcome,
                };
                if let (OUTCOME_SUCCESS, Ok(description)) = (outcome, selected) {
                    self.advises.push(Advise {
                        session,
                        tran_no,
                        broker: broker_name.clone(),
                        table: table.clone(),
                        description: Rc::new(description),
                    });
                    self.advise_starts.push(AdviseStart {
                        broker: broker_name,
                        table,
                        start_option,
                        order_option,
                        columns,
                    });
                }
                let mut ack = reply(broker::DATA_ADVISE_START_ACK);
                ack.add_u4(outcome);
                ack
            }
            broker::DATA_ADVISE_CONT_CMD | device::SETTINGS_ENUM_STOP_CMD => return Ok(Vec::new()),
            broker::DATA_ADVISE_STOP_CMD => {
                let advise_tran = msg.read_u4()?;
                self.advises
                    .retain(|a| !(a.session == session && a.tran_no == advise_tran));
                return Ok(Vec::new());
            }
            device::SETTINGS_ENUM_CMD => {
                let Some(device_name) = self.bound_name(session, ResourceType::Device) else {
                    return Ok(vec![unsupported(session, command)]);
                };
                let outcome = self.scripted_outcome(command).unwrap_or(OUTCOME_SUCCESS);
                let mut not = reply(device::SETTINGS_ENUM_NOT);
                not.add_u4(outcome);
                let labels = self.labels.get(&device_name).cloned().flatten();
                match (outcome, labels) {
                    (OUTCOME_SUCCESS, Some(labels)) => {
                        not.add_u4(2);
                        // A setting the client does not know, to be skipped.
                        not.add_u4(9999);
                        not.add_bytes(&[1, 2, 3]);
                        let mut body = Message::new(session, 0);
                        InputLocationLabels { labels }.write(&mut body);
                        not.add_u4(settings::INPUT_LOCATION_LABELS);
                        not.add_bytes(body.body());
                    }
                    _ => not.add_u4(0),
                }
                not
            }
            device::COLLECT_AREA_CREATE_CMD | device::COLLECT_AREA_UPDATE_CMD => {
                let Some(device_name) = self.bound_name(session, ResourceType::Device) else {
                    return Ok(vec![unsupported(session, command)]);
                };
                let create = command == device::COLLECT_AREA_CREATE_CMD;
                let area_name = if create {
                    msg.read_str()?
                } else {
                    match self.areas.iter().find(|a| a.session == session) {
                        Some(area) => area.name.clone(),
                        None => return Ok(vec![unsupported(session, command)]),
                    }
                };
                let count = msg.read_u4()?;
                let mut ids = Vec::new();
                for _ in 0..count {
                    ids.push(msg.read_u4()?);
                }
                let outcome = self.scripted_outcome(command).unwrap_or_else(|| {
                    self.collect_area_outcome(session, &device_name, &area_name, &ids, create)
                });
                if outcome == OUTCOME_SUCCESS {
                    if create {
                        self.areas.push(CollectArea {
                            session,
                            device: device_name.clone(),
                            name: area_name.clone(),
                        });
                    }
                    let table = self.area_table(&device_name, &area_name, &ids);
                    self.add_table(&device_name, table);
                }
                let mut ack = reply(command + 1);
                ack.add_u4(outcome);
                ack
            }
            other => {
                debug!(message_type = other, "unsupported command");
                unsupported(session, other)
            }
        };
        Ok(vec![out])
    }

    #[allow(clippy::too_many_arguments)]
    fn open_ack(
        &mut self,
        session: SessionNo,
        tran_no: u32,
        command: u32,
        ack_type: u32,
        kind: ResourceType,
        name: Option<String>,
        omit_name: bool,
    ) -> Message {
        let outcome = self.scripted_outcome(command).unwrap_or(if name.is_some() {
            OUTCOME_SUCCESS
        } else {
            lgrnet::OPEN_INVALID_NAME
        });
        let mut ack = Message::command(session, ack_type, tran_no);
        ack.add_u4(outcome);
        ack.add_u4(self.access_level);
        if let (OUTCOME_SUCCESS, Some(name)) = (outcome, name) {
            if !omit_name {
                ack.add_str(&name);
            }
            self.bindings.insert(session, Binding { kind, name });
        }
        ack
    }

    fn bound_name(&self, session: SessionNo, kind: ResourceType) -> Option<String> {
        self.bindings
            .get(&session)
            .filter(|b| b.kind == kind)
            .map(|b| b.name.clone())
    }

    fn table(&self, broker: &str, table: &str) -> Option<RecordDescription> {
        self.tables.get(broker)?.get(table).cloned()
    }

    fn field_labels(&self, device: &str) -> Vec<String> {
        match self.labels.get(device).cloned().flatten() {
            Some(labels) if !labels.is_empty() => labels,
            _ => (1..=DEFAULT_INLOC_COUNT)
                .map(|i| format!("{}{}", DEFAULT_INLOC_PREFIX, i))
                .collect(),
        }
    }

    fn collect_area_outcome(
        &self,
        session: SessionNo,
        device: &str,
        area: &str,
        ids: &[u32],
        create: bool,
    ) -> u32 {
        let field_count = self.field_labels(device).len() as u32;
        if ids.iter().any(|id| *id == 0 || *id > field_count) {
            return device::AREA_INVALID_FIELD;
        }
        let taken = self
            .areas
            .iter()
            .any(|a| a.device == device && a.name == area && a.session != session);
        if create && taken {
            return device::AREA_NAME_IN_USE;
        }
        OUTCOME_SUCCESS
    }

    fn area_table(&self, device: &str, area: &str, ids: &[u32]) -> RecordDescription {
        let labels = self.field_labels(device);
        let values = ids
            .iter()
            .filter_map(|id| labels.get(*id as usize - 1))
            .map(|label| ValueDesc::scalar(label.clone(), ValueType::Ieee4))
            .collect();
        RecordDescription::new(device, area, values)
    }

    fn notify_change(&mut self, kind: ResourceType, change: u32, id: u32, name: &str) {
        let targets: Vec<Message> = self
            .enums
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| {
                let mut not = Message::command(e.session, kind.enum_not(), e.tran_no);
                not.add_u4(OUTCOME_SUCCESS);
                not.add_u4(1);
                write_enum_item(&mut not, change, id, name);
                not
            })
            .collect();
        for msg in targets {
            self.runtime.on_message(msg);
        }
    }
}

fn open_kind(command: u32) -> ResourceType {
    match command {
        lgrnet::OPEN_BROKER_CMD | lgrnet::OPEN_BROKER_BY_ID_CMD => ResourceType::Broker,
        lgrnet::OPEN_DEVICE_CMD | lgrnet::OPEN_DEVICE_BY_ID_CMD => ResourceType::Device,
        _ => ResourceType::Router,
    }
}

fn unsupported(session: SessionNo, message_type: u32) -> Message {
    let mut msg = Message::new(session, router::UNSUPPORTED_MESSAGE);
    msg.add_u4(message_type);
    msg
}

fn write_enum_item(msg: &mut Message, change: u32, id: u32, name: &str) {
    msg.add_u4(change);
    msg.add_u4(id);
    msg.add_str(name);
    msg.add_u4(0);
}

fn write_sample_record(msg: &mut Message, description: &RecordDescription, record_no: u32) {
    msg.add_u4(1);
    msg.add_u4(record_no);
    msg.add_stamp(LgrDate::from_secs(i64::from(record_no)));
    for desc in &description.values {
        for _ in 0..desc.element_count().unwrap_or(0) {
            match desc.value_type {
                ValueType::UInt1 => msg.add_u1((record_no % 200) as u8),
                ValueType::UInt2 => msg.add_u2((record_no % 60_000) as u16),
                ValueType::UInt4 => msg.add_u4(record_no),
                ValueType::Int1 => msg.add_i1((record_no % 100) as i8),
                ValueType::Int2 => msg.add_i2((record_no % 30_000) as i16),
                ValueType::Int4 => msg.add_i4(record_no as i32),
                ValueType::Int8 => msg.add_i8(i64::from(record_no)),
                ValueType::Ieee4 => msg.add_f4(record_no as f32 * 0.5),
                ValueType::Ieee8 => msg.add_f8(f64::from(record_no) * 0.5),
                ValueType::Bool => msg.add_bool(record_no % 2 == 0),
                ValueType::Ascii => msg.add_str(&format!("r{}", record_no)),
                ValueType::Stamp => msg.add_stamp(LgrDate::from_secs(i64::from(record_no))),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Weak;

    use cora_core::SessionReceiver;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        messages: Vec<Message>,
    }

    impl SessionReceiver for Recorder {
        fn on_message(&mut self, msg: Message) {
            self.messages.push(msg);
        }
        fn on_session_broken(&mut self, _session: SessionNo, _reason: CloseReason) {}
    }

    fn open(runtime: &Runtime) -> (Rc<RefCell<Recorder>>, SessionNo) {
        let recorder = Rc::new(RefCell::new(Recorder::default()));
        let weak: Weak<RefCell<dyn SessionReceiver>> = Rc::downgrade(&recorder) as _;
        let session = runtime.open_session(weak).unwrap();
        (recorder, session)
    }

    #[test]
    fn answers_query_server() {
        let (runtime, mut server) = fake_runtime();
        server.set_version("1.3.11.21");
        let (recorder, session) = open(&runtime);
        runtime
            .send(Message::command(session, lgrnet::QUERY_SERVER_CMD, 4))
            .unwrap();
        assert_eq!(server.pump(), 1);

        let mut ack = recorder.borrow().messages[0].clone();
        assert_eq!(ack.message_type(), lgrnet::QUERY_SERVER_ACK);
        assert_eq!(ack.read_u4().unwrap(), 4);
        assert_eq!(ack.read_str().unwrap(), "fake-loggernet");
        assert_eq!(ack.read_str().unwrap(), "1.3.11.21");
    }

    #[test]
    fn held_commands_wait_for_release() {
        let (runtime, mut server) = fake_runtime();
        let (recorder, session) = open(&runtime);
        server.hold(lgrnet::QUERY_SERVER_CMD);
        runtime
            .send(Message::command(session, lgrnet::QUERY_SERVER_CMD, 1))
            .unwrap();
        server.pump();
        assert!(recorder.borrow().messages.is_empty());
        assert_eq!(server.held_count(), 1);

        server.release(lgrnet::QUERY_SERVER_CMD);
        server.pump();
        assert_eq!(recorder.borrow().messages.len(), 1);
        assert_eq!(server.held_count(), 0);
    }

    #[test]
    fn unknown_commands_are_unsupported() {
        let (runtime, mut server) = fake_runtime();
        let (recorder, session) = open(&runtime);
        runtime.send(Message::command(session, 4242, 1)).unwrap();
        server.pump();
        assert_eq!(
            recorder.borrow().messages[0].message_type(),
            router::UNSUPPORTED_MESSAGE
        );
    }

    #[test]
    fn open_by_name_binds_session() {
        let (runtime, mut server) = fake_runtime();
        server.add_broker("ws1", Vec::new());
        let (recorder, session) = open(&runtime);
        let mut open = Message::command(session, lgrnet::OPEN_BROKER_CMD, 9);
        open.add_str("ws1");
        runtime.send(open).unwrap();
        server.pump();

        let mut ack = recorder.borrow().messages[0].clone();
        assert_eq!(ack.message_type(), lgrnet::OPEN_BROKER_ACK);
        assert_eq!(ack.read_u4().unwrap(), 9);
        assert_eq!(ack.read_u4().unwrap(), OUTCOME_SUCCESS);
        assert_eq!(server.sessions_bound_to(ResourceType::Broker, "ws1"), [session]);

        runtime.close_session(session);
        server.pump();
        assert!(server.sessions_bound_to(ResourceType::Broker, "ws1").is_empty());
    }
}
