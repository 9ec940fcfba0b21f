#![no_main]

use libfuzzer_sys::fuzz_target;
use shelfcast_types::StreamFrame;

fuzz_target!(|data: &[u8]| {
    // Raw lines, including invalid UTF-8, never panic.
    for line in data.split(|b| *b == b'\n') {
        let _ = StreamFrame::decode(line);
    }

    let text = String::from_utf8_lossy(data);
    for line in text.lines() {
        // The trailing newline is optional on the wire.
        assert_eq!(
            StreamFrame::parse(line),
            StreamFrame::parse(&format!("{line}\n"))
        );
    }
});
