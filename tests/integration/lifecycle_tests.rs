//! Library lifecycle, applet management and instance ownership.

use ihaproxy::app::ports::Caller;
use ihaproxy::app::service::{SERVICE_VERSION, ServiceOptions};
use ihaproxy::error::Status;
use ihaproxy::rpc::client::IhaClient;
use ihaproxy::rpc::messages::Request;
use ihaproxy::rpc::parcel::Parcel;
use ihaproxy::rpc::pool::DirectRemote;

use crate::harness::{APP, OTHER_APP, Stack, recording_handler};

#[test]
fn deinit_is_idempotent_and_releases_everything() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    client.start_provisioning(APP).unwrap();
    let (handler, _rx) = recording_handler();
    client.register_events(OTHER_APP, handler).unwrap();
    assert!(stack.sim.is_open(APP));

    assert_eq!(client.deinit(), Ok(()));
    assert!(!stack.sim.is_open(APP));
    assert!(!stack.sim.is_subscribed(OTHER_APP));
    assert!(stack.service.registry().is_empty());

    assert_eq!(client.deinit(), Ok(()));
    assert_eq!(
        client.start_provisioning(APP),
        Err(Status::LibraryNotInitialized)
    );

    // A fresh init starts from a clean slate.
    client.init().unwrap();
    assert!(client.start_provisioning(APP).is_ok());
}

#[test]
fn version_and_firmware_update() {
    let stack = Stack::new();
    let client = stack.client();
    assert_eq!(client.version(), Ok(SERVICE_VERSION));
    assert_eq!(client.do_fw_update(), Err(Status::NotImplemented));
}

#[test]
fn install_and_uninstall() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    assert_eq!(
        client.install("new-applet", "/data/new-applet.bin"),
        Err(Status::AppletInvalidFileExt)
    );
    client.install("new-applet", "/data/new-applet.dalp").unwrap();
    assert!(stack.sim.is_installed("new-applet"));
    assert!(stack.sim.is_open("new-applet"));

    client.uninstall("new-applet").unwrap();
    assert!(!stack.sim.is_installed("new-applet"));
    assert_eq!(
        client.uninstall("new-applet"),
        Err(Status::AppletNotInstalled)
    );
}

#[test]
fn otps_aliases_manage_the_same_applets() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();
    client.install_otps("otps", "/vendor/otps.dalp").unwrap();
    assert!(stack.sim.is_installed("otps"));
    client.uninstall_otps("otps").unwrap();
    assert!(!stack.sim.is_installed("otps"));
}

#[test]
fn install_can_be_switched_off() {
    let stack = Stack::with_options(ServiceOptions {
        install_enabled: false,
        events_enabled: true,
    });
    let client = stack.client();
    client.init().unwrap();
    assert_eq!(
        client.install("x", "/data/x.dalp"),
        Err(Status::NotImplemented)
    );
    assert_eq!(client.uninstall(APP), Err(Status::NotImplemented));
    assert!(stack.sim.is_installed(APP));
}

#[test]
fn instances_belong_to_their_starting_process() {
    let stack = Stack::new();
    let owner = stack.client_as(Caller::new(100, 1000));
    let intruder = stack.client_as(Caller::new(200, 1000));
    owner.init().unwrap();

    let id = owner.start_instance(APP, None).unwrap();
    assert_eq!(
        owner.start_instance(APP, None),
        Err(Status::InstanceAlreadyAvailable)
    );
    assert_eq!(intruder.stop_instance(id), Err(Status::InvalidProcess));
    assert_eq!(owner.stop_instance(id), Ok(()));
    assert_eq!(owner.stop_instance(id), Err(Status::InvalidInstanceId));
    assert_eq!(owner.stop_instance(0), Err(Status::InvalidInstanceId));

    // The app can be started again once the instance is gone.
    assert!(owner.start_instance(APP, None).is_ok());
}

#[test]
fn app_instance_id_needs_an_exclusive_session() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    assert_eq!(client.app_instance(APP), Err(Status::AppletSessionUnavailable));
    let (handler, _rx) = recording_handler();
    client.register_events(APP, handler).unwrap();
    let (id, _flags) = client.app_instance(APP).unwrap();
    assert_eq!(client.app_instance(APP).unwrap().0, id);
}

#[test]
fn wrong_interface_token_is_an_internal_error() {
    let stack = Stack::new();
    let stranger = IhaClient::new(
        DirectRemote::new(
            std::sync::Arc::clone(&stack.engine),
            Caller::new(1, 1),
        ),
        "com.example.NotTheService",
        64,
    );
    assert_eq!(stranger.version(), Err(Status::InternalError));
}

#[test]
fn unknown_transaction_code_is_not_implemented() {
    let stack = Stack::new();
    let data = Request::GetVersion.encode(stack.engine.descriptor());
    let reply: Parcel = stack.engine.on_transact(Caller::default(), 99, &data);
    let status = reply.reader().read_i32().map(Status::from_wire);
    assert_eq!(status, Ok(Status::NotImplemented));
}

#[test]
fn missing_app_id_is_invalid_input() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();
    assert_eq!(client.start_provisioning(""), Err(Status::InvalidInput));
    let long = "a".repeat(33);
    assert_eq!(client.start_provisioning(&long), Err(Status::InvalidInput));
}
