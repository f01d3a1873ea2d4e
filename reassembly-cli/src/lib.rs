//! Library half of the CLI, split out the way `extract-sequence` keeps its
//! pcap-parsing and sequence-building logic in `lib.rs` and leaves `main.rs`
//! as a thin argument-parsing shell, so it can be exercised by integration
//! tests without spawning the binary.

pub mod pcap_source;
