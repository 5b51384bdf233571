use iem_decoder::MAX_INST_LEN;

/// Guest CPU generation being emulated. Pre-386 targets get their own
/// execution-mode encoding so their TBs never mix with 386+ code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuTarget {
    I8086,
    I286,
    I386,
    #[default]
    Current,
}

impl CpuTarget {
    pub fn is_pre_386(self) -> bool {
        matches!(self, CpuTarget::I8086 | CpuTarget::I286)
    }
}

/// Caps applied while forming a single translation block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TbLimits {
    /// Maximum number of threaded calls in one block.
    pub max_calls: usize,
    /// Maximum number of guest opcode bytes covered by one block.
    pub max_opcode_bytes: usize,
}

impl Default for TbLimits {
    fn default() -> Self {
        Self {
            max_calls: 256,
            max_opcode_bytes: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IemConfig {
    pub limits: TbLimits,
    /// Maximum number of live translation blocks before LRU eviction.
    pub cache_capacity: usize,
    /// log2 of the hash bucket count.
    pub hash_bits: u32,
    pub target_cpu: CpuTarget,
    /// The guest runs on a single vCPU, so `LOCK` needs no bus-lock
    /// emulation. Recorded in the mode flags so such blocks key separately.
    pub disregard_lock: bool,
    /// Maximum number of blocks executed by one `Iem::run` call.
    pub max_blocks: u64,
}

impl Default for IemConfig {
    fn default() -> Self {
        Self {
            limits: TbLimits::default(),
            cache_capacity: 4096,
            hash_bits: 12,
            target_cpu: CpuTarget::Current,
            disregard_lock: false,
            max_blocks: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_calls must be at least 2 (got {0})")]
    MaxCallsTooSmall(usize),
    #[error("max_opcode_bytes must be at least {MAX_INST_LEN} (got {0})")]
    MaxOpcodeBytesTooSmall(usize),
    #[error("max_opcode_bytes must fit in a u16 offset (got {0})")]
    MaxOpcodeBytesTooLarge(usize),
    #[error("cache_capacity must be non-zero")]
    ZeroCacheCapacity,
    #[error("hash_bits must be in 1..=24 (got {0})")]
    HashBitsOutOfRange(u32),
    #[error("max_blocks must be non-zero")]
    ZeroBlockBudget,
}

impl IemConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        // A CS-limit check plus the instruction itself must always fit.
        if self.limits.max_calls < 2 {
            return Err(ConfigError::MaxCallsTooSmall(self.limits.max_calls));
        }
        if self.limits.max_opcode_bytes < MAX_INST_LEN {
            return Err(ConfigError::MaxOpcodeBytesTooSmall(
                self.limits.max_opcode_bytes,
            ));
        }
        if self.limits.max_opcode_bytes > usize::from(u16::MAX) {
            return Err(ConfigError::MaxOpcodeBytesTooLarge(
                self.limits.max_opcode_bytes,
            ));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::ZeroCacheCapacity);
        }
        if !(1..=24).contains(&self.hash_bits) {
            return Err(ConfigError::HashBitsOutOfRange(self.hash_bits));
        }
        if self.max_blocks == 0 {
            return Err(ConfigError::ZeroBlockBudget);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(IemConfig::default().validate(), Ok(()));
    }

    #[test]
    fn rejects_degenerate_limits() {
        let mut cfg = IemConfig::default();
        cfg.limits.max_calls = 1;
        assert_eq!(cfg.validate(), Err(ConfigError::MaxCallsTooSmall(1)));

        let mut cfg = IemConfig::default();
        cfg.hash_bits = 40;
        assert_eq!(cfg.validate(), Err(ConfigError::HashBitsOutOfRange(40)));
    }
}
