//! Provisioning sessions driven end to end through the client stub.

use ihaproxy::app::ports::OtpRequest;
use ihaproxy::error::Status;
use ihaproxy::rpc::negotiate::{Negotiated, lengths};

use crate::harness::{APP, OTHER_APP, Stack};

#[test]
fn provisioning_round_trip_with_short_first_buffer() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    let handle = client.start_provisioning(APP).unwrap();
    assert_ne!(handle, 0);

    // Too small: the handle stays active and the reply names the size.
    assert_eq!(
        client.end_provisioning(APP, handle, 4),
        Ok(Negotiated::TooSmall(lengths(&[16])))
    );
    let token = client
        .end_provisioning(APP, handle, 16)
        .unwrap()
        .complete()
        .unwrap();
    assert_eq!(token.len(), 16);

    // Handle is gone once the token has been delivered.
    assert_eq!(
        client.end_provisioning(APP, handle, 16),
        Err(Status::InvalidRequest)
    );
}

#[test]
fn only_one_provisioning_session_per_app() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    let h = client.start_provisioning(APP).unwrap();
    assert_eq!(client.start_provisioning(APP), Err(Status::InvalidRequest));

    // Other apps are independent.
    let other = client.start_provisioning(OTHER_APP).unwrap();
    assert_ne!(other, h);

    client.end_provisioning_negotiated(APP, h).unwrap();
    assert!(client.start_provisioning(APP).is_ok());
}

#[test]
fn svp_messages_travel_under_the_provisioning_handle() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    let h = client.start_provisioning(APP).unwrap();
    client.process_svp_message(APP, h, b"svp-blob").unwrap();
    assert_eq!(client.get_svp_message(APP, h).unwrap(), b"svp-blob".to_vec());

    // A stale or foreign handle is rejected before reaching the device.
    assert_eq!(
        client.process_svp_message(APP, h + 7, b"x"),
        Err(Status::InvalidRequest)
    );
}

#[test]
fn data_exchange_without_handle_uses_a_shared_session() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    client.send_data(APP, 0, 3, b"hello").unwrap();
    assert!(stack.sim.is_open(APP));
    assert_eq!(
        client.receive_data_negotiated(APP, 0, 3).unwrap(),
        b"hello".to_vec()
    );
    // Mailbox is empty now; the device's own code comes back verbatim.
    assert_eq!(
        client.receive_data_negotiated(APP, 0, 3),
        Err(Status::AppletInvalidMessage)
    );
    assert_eq!(
        client.send_and_receive_negotiated(APP, 0, 3, b"abc").unwrap(),
        b"cba".to_vec()
    );
}

#[test]
fn otp_by_token_and_by_handle() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    let h = client.start_provisioning(APP).unwrap();
    let by_handle = client
        .get_otp_negotiated(
            APP,
            &OtpRequest {
                handle: Some(h),
                otp_capacity: 8,
                ..OtpRequest::default()
            },
        )
        .unwrap();
    assert_eq!(by_handle.otp.len(), 8);
    assert!(by_handle.token.is_empty());
    assert_eq!(client.otps_status(APP, h, 0), Ok(1));

    let token = client.end_provisioning_negotiated(APP, h).unwrap();
    let by_token = client
        .get_otp_negotiated(
            APP,
            &OtpRequest {
                token: token.clone(),
                otp_capacity: 8,
                token_capacity: token.len() as u32,
                ..OtpRequest::default()
            },
        )
        .unwrap();
    assert_eq!(by_token.otp.len(), 8);
    assert_eq!(by_token.token.len(), token.len());
    assert_ne!(by_token.otp, by_handle.otp);
}

#[test]
fn otp_without_handle_or_token_is_invalid_input() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();
    let req = OtpRequest {
        otp_capacity: 8,
        ..OtpRequest::default()
    };
    assert_eq!(client.get_otp(APP, &req), Err(Status::InvalidInput));
}

#[test]
fn capabilities_are_reported_as_strings() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    assert_eq!(client.capabilities_negotiated(APP, 1).unwrap(), b"2.1.0\0".to_vec());
    assert_eq!(client.otp_capabilities(APP, 2).unwrap(), b"3.0.1\0".to_vec());
    assert_eq!(
        client.capabilities_negotiated(APP, 99),
        Err(Status::AppletInvalidType)
    );
}

#[test]
fn requests_before_init_are_refused() {
    let stack = Stack::new();
    let client = stack.client();
    assert_eq!(
        client.start_provisioning(APP),
        Err(Status::LibraryNotInitialized)
    );
    assert!(stack.sim.requests().is_empty());
}

#[test]
fn event_flood_does_not_shift_replies() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    for i in 0..1100u32 {
        stack.sim.inject_event(APP, i.to_le_bytes().to_vec());
    }
    assert_eq!(client.send_data(APP, 0, 7, b"hello"), Ok(()));

    let handle = client.start_provisioning(APP).unwrap();
    assert_eq!(handle, 0x1000);
    assert_eq!(client.end_provisioning_negotiated(APP, handle).unwrap().len(), 16);
    assert_eq!(client.start_provisioning(APP), Ok(0x1001));
}

#[test]
fn garbled_reply_costs_one_call_not_the_next() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();
    client.send_data(APP, 0, 7, b"hello").unwrap();
    assert!(stack.sim.is_open(APP));

    stack.sim.garble_next();
    assert_eq!(client.start_provisioning(APP), Err(Status::InternalError));
    assert!(!stack.sim.is_open(APP));

    // The session is reopened on the new connection and every reply
    // lines up with its own request.
    assert_eq!(client.start_provisioning(APP), Ok(0x1001));
    assert!(stack.sim.is_open(APP));
    assert_eq!(client.end_provisioning_negotiated(APP, 0x1001).unwrap().len(), 16);
}
