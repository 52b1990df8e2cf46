//! The header codec must classify arbitrary bytes without panicking:
//! detection runs it over whatever the system header page contains.

#![no_main]

use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = dblwr::DoublewriteHeader::read_from(data) {
        let _ = header.is_valid();
        let _ = header.space_ids_current();
        let _ = (header.block1(), header.block2(), header.space_ids_stored());
    }
});
