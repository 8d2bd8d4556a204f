//! Logon strategies end to end against the scripted server.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use cora_client::transaction::{BrokerEnumerator, ResourceInfo};
use cora_client::{
    ConnectionFailure, ConnectionState, EnumeratorClient, EnumeratorFailure, LogonConfig,
};
use cora_core::constants::OUTCOME_SUCCESS;
use cora_core::logging::init_test_logging;
use cora_core::protocol::messages::lgrnet;
use cora_test_utils::{FakeServer, fake_runtime};

#[derive(Default)]
struct Recorder {
    started: Vec<Vec<String>>,
    failures: Vec<EnumeratorFailure>,
}

impl EnumeratorClient for Recorder {
    fn on_started(&mut self, resources: &[ResourceInfo]) {
        self.started.push(resources.iter().map(|r| r.name.clone()).collect());
    }

    fn on_failure(&mut self, failure: EnumeratorFailure) {
        self.failures.push(failure);
    }
}

fn enumerate(
    server: &mut FakeServer,
    logon: LogonConfig,
) -> (Rc<RefCell<BrokerEnumerator>>, Rc<RefCell<Recorder>>) {
    init_test_logging();
    server.add_broker("ws1", Vec::new());
    let enumerator = BrokerEnumerator::new(server.runtime().clone(), logon);
    let recorder = Rc::new(RefCell::new(Recorder::default()));
    let client: Weak<RefCell<dyn EnumeratorClient>> = Rc::downgrade(&recorder) as _;
    enumerator.borrow_mut().start(client).unwrap();
    server.pump();
    (enumerator, recorder)
}

#[test]
fn plain_logon_on_old_servers() {
    let (_runtime, mut server) = fake_runtime();
    server.set_version("1.3.1.20");
    server.add_user("bob", "secret");

    let logon = LogonConfig::new().with_user("bob", "secret");
    let (_enumerator, recorder) = enumerate(&mut server, logon);

    assert_eq!(recorder.borrow().started, [vec!["ws1".to_string()]]);
    assert_eq!(server.handle().count_of_type(lgrnet::LOGON_CMD), 1);
    assert_eq!(server.handle().count_of_type(lgrnet::LOGON_CHALLENGE_CMD), 0);
}

#[test]
fn rejected_plain_logon_resets_the_connection() {
    let (_runtime, mut server) = fake_runtime();
    server.set_version("1.3.1.20");
    server.add_user("bob", "secret");

    let logon = LogonConfig::new().with_user("bob", "guess");
    let (enumerator, recorder) = enumerate(&mut server, logon);

    assert_eq!(
        recorder.borrow().failures,
        [EnumeratorFailure::Connection(ConnectionFailure::Logon)]
    );
    assert_eq!(enumerator.borrow().connection().state(), ConnectionState::Standby);
    assert!(server.handle().open_sessions().is_empty());
}

#[test]
fn challenge_logon_proves_the_password() {
    let (_runtime, mut server) = fake_runtime();
    server.set_version("1.3.1.28");
    server.add_user("bob", "secret");

    let logon = LogonConfig::new().with_user("bob", "secret");
    let (_enumerator, recorder) = enumerate(&mut server, logon);

    assert!(recorder.borrow().failures.is_empty());
    assert_eq!(recorder.borrow().started.len(), 1);
    assert_eq!(server.handle().count_of_type(lgrnet::LOGON_CHALLENGE_CMD), 1);
    assert_eq!(server.handle().count_of_type(lgrnet::LOGON_RESPONSE_CMD), 1);
    assert_eq!(server.handle().count_of_type(lgrnet::LOGON_CMD), 0);
}

#[test]
fn challenge_logon_with_wrong_password_fails() {
    let (_runtime, mut server) = fake_runtime();
    server.set_version("1.3.1.28");
    server.add_user("bob", "secret");

    let logon = LogonConfig::new().with_user("bob", "guess");
    let (_enumerator, recorder) = enumerate(&mut server, logon);

    assert!(recorder.borrow().started.is_empty());
    assert_eq!(
        recorder.borrow().failures,
        [EnumeratorFailure::Connection(ConnectionFailure::Logon)]
    );
    assert!(server.handle().open_sessions().is_empty());
}

#[test]
fn token_logon_on_recent_servers() {
    let (_runtime, mut server) = fake_runtime();
    server.set_version("1.3.11.21");
    server.add_token("tok", OUTCOME_SUCCESS);

    let logon = LogonConfig::new().with_access_token("tok");
    let (_enumerator, recorder) = enumerate(&mut server, logon);

    assert_eq!(recorder.borrow().started.len(), 1);
    assert_eq!(server.handle().count_of_type(lgrnet::TOKEN_LOGON_CMD), 1);
    assert_eq!(server.handle().count_of_type(lgrnet::LOGON_CHALLENGE_CMD), 0);
}

#[test]
fn expired_token_is_reported() {
    let (_runtime, mut server) = fake_runtime();
    server.set_version("1.3.11.21");
    server.add_token("old", lgrnet::TOKEN_EXPIRED);

    let logon = LogonConfig::new().with_access_token("old");
    let (_enumerator, recorder) = enumerate(&mut server, logon);

    assert_eq!(
        recorder.borrow().failures,
        [EnumeratorFailure::Connection(ConnectionFailure::AccessExpired)]
    );
}

#[test]
fn token_is_ignored_by_older_servers() {
    let (_runtime, mut server) = fake_runtime();
    server.set_version("1.3.1.28");

    let logon = LogonConfig::new().with_access_token("tok");
    let (_enumerator, recorder) = enumerate(&mut server, logon);

    assert_eq!(recorder.borrow().started.len(), 1);
    assert_eq!(server.handle().count_of_type(lgrnet::TOKEN_LOGON_CMD), 0);
    assert_eq!(server.handle().count_of_type(lgrnet::LOGON_CHALLENGE_CMD), 1);
}

#[test]
fn transaction_numbers_increase_on_the_net_session() {
    let (_runtime, mut server) = fake_runtime();
    server.set_version("1.3.1.28");
    let (enumerator, _recorder) = enumerate(&mut server, LogonConfig::default());
    enumerator.borrow_mut().finish();

    let session = server.handle().opened()[0];
    let numbers: Vec<u32> = server
        .handle()
        .sent()
        .iter()
        .filter(|m| m.session_no() == session)
        .filter_map(|m| m.tran_no())
        .collect();
    // Query, challenge, response, enumeration start and stop.
    assert_eq!(numbers.len(), 5);
    assert!(numbers[0] >= 1);
    assert!(numbers.windows(2).all(|w| w[0] < w[1]));
}
