//! Architecture-neutral page-fault description.

use crate::protection::Protection;
use bitfield_struct::bitfield;

/// What the faulting access was. The interrupt layer builds one of these
/// from the CPU's error code before calling into the VMM.
#[bitfield(u8)]
#[derive(PartialEq, Eq)]
pub struct FaultCode {
    /// 0 = the page was not present.
    /// 1 = the page was present, the access was not allowed.
    pub present: bool,

    /// 1 = write access.
    pub write: bool,

    /// 1 = access from user mode.
    pub user: bool,

    /// 1 = instruction fetch.
    pub execute: bool,

    #[bits(4)]
    __: u8,
}

impl FaultCode {
    /// Decode the x86-64 `#PF` error code (Intel SDM Vol. 3A, §6.15).
    #[must_use]
    pub const fn from_x86_error_code(code: u64) -> Self {
        Self::new()
            .with_present(code & (1 << 0) != 0)
            .with_write(code & (1 << 1) != 0)
            .with_user(code & (1 << 2) != 0)
            .with_execute(code & (1 << 4) != 0)
    }

    /// The right the faulting access needed.
    #[must_use]
    pub const fn access(self) -> Protection {
        if self.execute() {
            Protection::EXECUTE
        } else if self.write() {
            Protection::WRITE
        } else {
            Protection::READ
        }
    }

    #[must_use]
    pub const fn explain(self) -> &'static str {
        if !self.present() {
            "non-present page"
        } else if self.execute() {
            "instruction fetch on protected page"
        } else if self.write() {
            "write access to protected page"
        } else {
            "read access to protected page"
        }
    }
}
