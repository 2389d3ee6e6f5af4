//! Buffer-length negotiation over the wire envelope.

use ihaproxy::app::ports::OtpRequest;
use ihaproxy::error::Status;
use ihaproxy::rpc::negotiate::{Negotiated, lengths};

use crate::harness::{APP, Stack};

#[test]
fn short_receive_reports_the_exact_length() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    let payload = vec![0x5a; 40];
    client.send_data(APP, 0, 9, &payload).unwrap();
    assert_eq!(
        client.receive_data(APP, 0, 9, 10),
        Ok(Negotiated::TooSmall(lengths(&[40])))
    );
    // Nothing was consumed by the short attempt.
    assert_eq!(
        client.receive_data(APP, 0, 9, 40),
        Ok(Negotiated::Complete(payload))
    );
}

#[test]
fn negotiated_receive_retries_once_above_the_default() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    // Larger than the client's 64-byte first attempt.
    let payload: Vec<u8> = (0..200u8).collect();
    client.send_data(APP, 0, 2, &payload).unwrap();
    assert_eq!(client.receive_data_negotiated(APP, 0, 2).unwrap(), payload);
}

#[test]
fn otp_reports_both_lengths_when_both_are_short() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();

    let out = client
        .get_otp(
            APP,
            &OtpRequest {
                token: vec![1; 16],
                otp_capacity: 2,
                token_capacity: 4,
                ..OtpRequest::default()
            },
        )
        .unwrap();
    assert_eq!(out, Negotiated::TooSmall(lengths(&[8, 16])));
}

#[test]
fn zero_capacity_is_invalid_input() {
    let stack = Stack::new();
    let client = stack.client();
    client.init().unwrap();
    assert_eq!(client.receive_data(APP, 0, 1, 0), Err(Status::InvalidInput));
    assert_eq!(client.capabilities(APP, 1, 0), Err(Status::InvalidInput));
}
