//! The page oracle and layout readers face raw frames straight off a
//! possibly-torn disk; none of them may panic on arbitrary page bytes.

#![no_main]

use dblwr::config::PAGE_SIZE;
use dblwr::page;
use dblwr::{CrcPageOracle, PageOracle};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < PAGE_SIZE {
        return;
    }
    let frame = &data[..PAGE_SIZE];

    let oracle = CrcPageOracle;
    let _ = oracle.is_corrupted(frame, None);
    let _ = oracle.is_zeroes(frame, None);
    let _ = oracle.validate_index_page(frame);
    let _ = (page::space_id(frame), page::page_no(frame), page::page_lsn(frame));
    let _ = page::lsn_stamps_match(frame);
});
