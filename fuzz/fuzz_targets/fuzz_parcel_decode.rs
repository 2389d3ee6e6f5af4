//! Fuzz target: request envelope decoding
//!
//! The first byte picks a transaction code; the rest is taken as the
//! envelope body behind a valid interface token. Decoding must never
//! panic, and a decoded request must re-encode to something that decodes
//! to the same request.
//!
//! cargo fuzz run fuzz_parcel_decode

#![no_main]

use ihaproxy::config::INTERFACE_DESCRIPTOR;
use ihaproxy::rpc::messages::Request;
use ihaproxy::rpc::parcel::Parcel;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Some((&code, body)) = data.split_first() else {
        return;
    };
    let code = u32::from(code % 32);

    let mut envelope = Parcel::new();
    envelope.write_interface_token(INTERFACE_DESCRIPTOR);
    let (mut bytes, objects) = envelope.into_parts();
    bytes.extend_from_slice(body);
    let parcel = Parcel::from_parts(bytes, objects);

    if let Ok(request) = Request::from_parcel(code, INTERFACE_DESCRIPTOR, &parcel) {
        let again = request.encode(INTERFACE_DESCRIPTOR);
        assert_eq!(
            Request::from_parcel(code, INTERFACE_DESCRIPTOR, &again).as_ref(),
            Ok(&request)
        );
    }
});
