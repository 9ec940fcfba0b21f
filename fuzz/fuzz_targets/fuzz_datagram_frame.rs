#![no_main]

use libfuzzer_sys::fuzz_target;
use shelfcast_types::{Control, DatagramFrame, MAX_DATAGRAM_SIZE};

fuzz_target!(|data: &[u8]| {
    if data.len() > MAX_DATAGRAM_SIZE {
        return;
    }
    if let DatagramFrame::Control(control) = DatagramFrame::parse(data) {
        assert_eq!(Control::parse(control.as_str()), Some(control));
    }
});
