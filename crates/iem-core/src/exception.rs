/// Architectural exceptions raised while translating or executing guest code.
///
/// Faulting exceptions leave RIP at the start of the faulting instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Exception {
    #[error("#DE")]
    DivideError,
    #[error("#DB")]
    Debug,
    #[error("#BP")]
    Breakpoint,
    #[error("#OF")]
    Overflow,
    #[error("#UD")]
    InvalidOpcode,
    #[error("#NM")]
    DeviceNotAvailable,
    #[error("#NP({0:#x})")]
    SegmentNotPresent(u16),
    #[error("#SS({0:#x})")]
    StackFault(u16),
    #[error("#GP({0:#x})")]
    GeneralProtection(u16),
    #[error("#PF(addr={addr:#x}, error_code={error_code:#x})")]
    PageFault { addr: u64, error_code: u32 },
    #[error("#AC")]
    AlignmentCheck,
}

impl Exception {
    #[inline]
    pub const fn gp0() -> Self {
        Exception::GeneralProtection(0)
    }

    pub const fn vector(&self) -> u8 {
        match self {
            Exception::DivideError => 0,
            Exception::Debug => 1,
            Exception::Breakpoint => 3,
            Exception::Overflow => 4,
            Exception::InvalidOpcode => 6,
            Exception::DeviceNotAvailable => 7,
            Exception::SegmentNotPresent(_) => 11,
            Exception::StackFault(_) => 12,
            Exception::GeneralProtection(_) => 13,
            Exception::PageFault { .. } => 14,
            Exception::AlignmentCheck => 17,
        }
    }

    /// Error code pushed on delivery, if the vector has one.
    pub const fn error_code(&self) -> Option<u32> {
        match *self {
            Exception::SegmentNotPresent(sel)
            | Exception::StackFault(sel)
            | Exception::GeneralProtection(sel) => Some(sel as u32),
            Exception::PageFault { error_code, .. } => Some(error_code),
            Exception::AlignmentCheck => Some(0),
            _ => None,
        }
    }
}

/// Reasons an instruction has to leave the recompiler and be completed by the
/// surrounding VMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssistReason {
    /// `CPUID`.
    Cpuid,
    /// `RDMSR`/`WRMSR`.
    Msr,
    /// Protected-mode segment loads and far transfers (descriptor table walk).
    SegmentLoad,
    /// System instructions (`LGDT`, `INVLPG`, `SYSCALL`, ...).
    Privileged,
    /// Valid encoding with no modelled semantics.
    Unsupported,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vectors_and_error_codes() {
        assert_eq!(Exception::InvalidOpcode.vector(), 6);
        assert_eq!(Exception::InvalidOpcode.error_code(), None);
        assert_eq!(Exception::gp0().error_code(), Some(0));
        let pf = Exception::PageFault {
            addr: 0x2000,
            error_code: 0x10,
        };
        assert_eq!(pf.vector(), 14);
        assert_eq!(pf.error_code(), Some(0x10));
        assert_eq!(pf.to_string(), "#PF(addr=0x2000, error_code=0x10)");
    }
}
