//! Crate-wide error type.
//!
//! `Full` (allocation/leaf/snapshot-table exhaustion,
//! recoverable by the caller), `Corrupt` (bad magic/checksum/impossible
//! invariant, fatal at startup and treated as `Io` at runtime), `Protocol`
//! (bad opcode/tag, connection survives) and `Busy` (a second attach to a
//! dirty store, triggers recovery rather than failing). `Io` comes in through
//! `foreign_links` since every on-disk operation ultimately bottoms out in a
//! `std::io::Error`.

use error_chain::error_chain;

error_chain! {
    errors {
        /// Allocation exhausted in the named space, a B-tree leaf could not
        /// accept another exception, or the snapshot table is saturated.
        Full(what: &'static str) {
            description("allocation exhausted")
            display("allocation exhausted: {}", what)
        }
        /// Bad magic, bad checksum during recovery, a sharemap with bits
        /// outside the active mask, or an impossible journal sequence gap.
        Corrupt(what: String) {
            description("on-disk structure corrupt")
            display("corrupt: {}", what)
        }
        /// Unknown opcode, body-length mismatch, or invalid snapshot tag.
        Protocol(what: String) {
            description("protocol error")
            display("protocol error: {}", what)
        }
        /// A second server attached to a store whose superblock already has
        /// BUSY set; the caller should run recovery, not treat this as fatal.
        Busy {
            description("snapshot store is busy")
            display("snapshot store is marked busy")
        }
    }

    foreign_links {
        Io(::std::io::Error);
    }
}
