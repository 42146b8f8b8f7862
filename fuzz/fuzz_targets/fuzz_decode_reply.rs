#![no_main]

use bytes::BytesMut;
use conn_churn::protocol::decode_reply;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let buf = BytesMut::from(data);
    if let Ok((reply, consumed)) = decode_reply(&buf) {
        assert!(consumed > 0 && consumed <= data.len());
        assert!((100..600).contains(&reply.code));
        let _ = reply.message();
    }
});
