#![forbid(unsafe_code)]

//! Threaded x86 recompiler core.
//!
//! Guest code is translated one block at a time into a list of threaded
//! calls ([`threaded::CallEntry`]), cached by guest-physical address and
//! execution mode ([`tb_cache::TbCache`]) and replayed by the block executor.
//! [`driver::Iem`] ties the pieces into the per-vCPU run loop.
//!
//! Instructions without a fast-path threaded function are carried in the
//! block as raw bytes and run through the reference interpreter
//! ([`interp`]), so every decodable instruction can appear in a block.

pub mod compile;
pub mod config;
pub mod driver;
pub mod exception;
pub mod executor;
pub mod fetch;
pub mod interp;
pub mod mem;
pub mod mode;
pub mod state;
pub mod tb;
pub mod tb_cache;
pub mod threaded;

pub use compile::{compile_block, CompileError};
pub use config::{ConfigError, CpuTarget, IemConfig, TbLimits};
pub use driver::{EventSink, ExitStatus, Iem, IemStats, NullEventSink};
pub use exception::{AssistReason, Exception};
pub use executor::{execute, BlockExit, ExecFault, ExitReason};
pub use fetch::InstrStream;
pub use mem::{FlatTestMemory, GuestMemory, PhysWrite};
pub use mode::ExecModeFlags;
pub use state::CpuState;
pub use tb::{ArchIdentity, PhysRange, TbFlags, TbHandle, TranslationBlock};
pub use tb_cache::{SharedTbCache, TbCache, TbCacheStats};
pub use threaded::{CallEntry, ThreadedFunction, THREADED_FUNCTIONS};
