#![no_main]

use libfuzzer_sys::fuzz_target;
use shelfcast_types::{ChatFrame, MAX_MESSAGE_LEN};

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    if let Ok(frame) = ChatFrame::decode_client(text) {
        match &frame {
            ChatFrame::Message { message, .. } => assert!(message.len() <= MAX_MESSAGE_LEN),
            ChatFrame::UserList { .. } | ChatFrame::Error { .. } => {
                panic!("server-only frame accepted from a client")
            }
            _ => {}
        }
        let _ = frame.encode();
    }
});
