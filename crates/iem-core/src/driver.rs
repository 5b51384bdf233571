//! Compile/execute run loop.
//!
//! `Iem::run` is a small state machine:
//!
//! ```text
//! ResolvePc -> Lookup -> (hit) Execute -> ResolvePc ...
//!                     -> (miss) Compile -> Execute
//! any state -> Escape -> return
//! ```
//!
//! Every fault, stop and forced exit funnels through `Escape`, which is the
//! only place that talks to the [`EventSink`] and builds the returned
//! [`ExitStatus`].

use std::sync::Arc;

use tracing::{debug, trace};

use crate::compile::{compile_block, CompileError};
use crate::config::{ConfigError, IemConfig};
use crate::exception::{AssistReason, Exception};
use crate::executor::{execute, ExitReason};
use crate::fetch::{FetchStats, InstrStream};
use crate::interp;
use crate::mem::{AccessType, GuestMemory, PhysWrite, PAGE_MASK, PAGE_SIZE};
use crate::mode::ExecModeFlags;
use crate::state::{CpuState, ForceFlags, FLAG_TF};
use crate::tb::{ArchIdentity, TranslationBlock};
use crate::tb_cache::TbCache;
use crate::threaded::{
    CallStatus, IoRequest, StopReason, ThreadedCtx, ThreadedFunctionTable, THREADED_FUNCTIONS,
};

/// Delivery side of exceptions and software interrupts. The recompiler only
/// reports them; frame building and IDT walks belong to the collaborator.
pub trait EventSink {
    fn raise_exception(&mut self, cpu: &mut CpuState, exception: Exception);
    fn software_interrupt(&mut self, cpu: &mut CpuState, vector: u8);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn raise_exception(&mut self, _cpu: &mut CpuState, _exception: Exception) {}

    fn software_interrupt(&mut self, _cpu: &mut CpuState, _vector: u8) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Halted,
    Exception(Exception),
    Io(IoRequest),
    SoftwareInterrupt { vector: u8 },
    Assist(AssistReason),
    /// RFLAGS.TF was set; exactly one instruction was executed.
    SingleStep,
    ForcedAction(ForceFlags),
    BudgetExhausted,
    /// Translating or fetching the block's first instruction faulted. No
    /// block was created.
    CompileFault { pc: u64, exception: Exception },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IemStats {
    pub blocks_executed: u64,
    pub blocks_compiled: u64,
    pub compile_faults: u64,
    pub instructions_retired: u64,
}

enum Escape {
    Status(ExitStatus),
    CompileFault(CompileError),
}

enum RunState {
    ResolvePc,
    Lookup { phys_pc: u64, flags: ExecModeFlags },
    Compile { flags: ExecModeFlags },
    Execute(Arc<TranslationBlock>),
    Escape(Escape),
}

/// Per-vCPU recompiler instance.
pub struct Iem {
    config: IemConfig,
    cache: TbCache,
    stream: InstrStream,
    functions: &'static ThreadedFunctionTable,
    /// Guest-physical writes committed by the block being executed.
    write_log: Vec<PhysWrite>,
    stats: IemStats,
}

impl Iem {
    pub fn new(config: IemConfig) -> Result<Self, ConfigError> {
        Self::with_function_table(config, &THREADED_FUNCTIONS)
    }

    pub fn with_function_table(
        config: IemConfig,
        functions: &'static ThreadedFunctionTable,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            cache: TbCache::new(config.cache_capacity, config.hash_bits),
            config,
            stream: InstrStream::new(),
            functions,
            write_log: Vec::new(),
            stats: IemStats::default(),
        })
    }

    pub fn config(&self) -> &IemConfig {
        &self.config
    }

    pub fn cache(&self) -> &TbCache {
        &self.cache
    }

    pub fn stats(&self) -> IemStats {
        self.stats
    }

    pub fn fetch_stats(&self) -> FetchStats {
        self.stream.stats()
    }

    /// Drop every cached block and the fetch window.
    pub fn flush(&mut self) {
        self.cache.flush();
        self.stream.invalidate();
    }

    /// Report a guest-physical write made outside this vCPU's blocks (DMA,
    /// another vCPU, the VMM). Returns the number of blocks invalidated.
    pub fn notify_phys_write(&mut self, start: u64, len: u64) -> usize {
        self.stream.invalidate_phys(start, len);
        self.cache.invalidate_phys_range(start, len)
    }

    fn drain_write_log(&mut self) {
        for w in self.write_log.drain(..) {
            let len = w.len as u64;
            self.stream.invalidate_phys(w.start, len);
            self.cache.invalidate_phys_range(w.start, len);
        }
    }

    fn stop_status(&self, cpu: &mut CpuState, stop: StopReason, sink: &mut dyn EventSink) -> ExitStatus {
        match stop {
            StopReason::Halt => ExitStatus::Halted,
            StopReason::Io(req) => ExitStatus::Io(req),
            StopReason::SoftwareInterrupt { vector } => {
                sink.software_interrupt(cpu, vector);
                ExitStatus::SoftwareInterrupt { vector }
            }
            StopReason::Assist(reason) => ExitStatus::Assist(reason),
        }
    }

    /// Run guest code until something needs the caller's attention.
    pub fn run(
        &mut self,
        cpu: &mut CpuState,
        mem: &mut dyn GuestMemory,
        sink: &mut dyn EventSink,
    ) -> ExitStatus {
        let mut blocks = 0u64;
        let mut state = RunState::ResolvePc;

        loop {
            state = match state {
                RunState::ResolvePc => {
                    if cpu.halted {
                        RunState::Escape(Escape::Status(ExitStatus::Halted))
                    } else if !cpu.force_flags.is_empty() {
                        RunState::Escape(Escape::Status(ExitStatus::ForcedAction(cpu.force_flags)))
                    } else if blocks >= self.config.max_blocks {
                        RunState::Escape(Escape::Status(ExitStatus::BudgetExhausted))
                    } else if cpu.get_flag(FLAG_TF) {
                        RunState::Escape(Escape::Status(self.single_step(cpu, mem, sink)))
                    } else {
                        let flags = ExecModeFlags::from_cpu(
                            cpu,
                            self.config.target_cpu,
                            self.config.disregard_lock,
                        );
                        let pc = cpu.linear_pc();
                        match self.stream.resolve(cpu, mem, pc) {
                            Ok(phys_pc) => RunState::Lookup { phys_pc, flags },
                            Err(exception) => RunState::Escape(Escape::CompileFault(
                                CompileError::Fault { pc, exception },
                            )),
                        }
                    }
                }

                RunState::Lookup { phys_pc, flags } => {
                    let arch = ArchIdentity::from_cpu(cpu);
                    let hit = self
                        .cache
                        .lookup(phys_pc, flags, &arch)
                        .and_then(|h| Some((h, self.cache.get_cloned(h)?)));
                    match hit {
                        Some((_, tb)) if second_page_current(&tb, cpu, mem) => {
                            trace!(phys_pc = format_args!("{:#x}", phys_pc), "tb hit");
                            RunState::Execute(tb)
                        }
                        Some((handle, _)) => {
                            debug!(
                                phys_pc = format_args!("{:#x}", phys_pc),
                                "second code page remapped; recompiling"
                            );
                            self.cache.remove(handle);
                            RunState::Compile { flags }
                        }
                        None => RunState::Compile { flags },
                    }
                }

                RunState::Compile { flags } => {
                    match compile_block(cpu, mem, &mut self.stream, flags, &self.config) {
                        Ok(tb) => {
                            self.stats.blocks_compiled += 1;
                            let handle = self.cache.insert(tb);
                            match self.cache.get_cloned(handle) {
                                Some(tb) => RunState::Execute(tb),
                                None => RunState::ResolvePc,
                            }
                        }
                        Err(err) => RunState::Escape(Escape::CompileFault(err)),
                    }
                }

                RunState::Execute(tb) => {
                    blocks += 1;
                    self.stats.blocks_executed += 1;
                    let result = {
                        let mut ctx = ThreadedCtx::new(cpu, mem, &mut self.write_log);
                        execute(&tb, &mut ctx, self.functions)
                    };
                    self.drain_write_log();

                    match result {
                        Ok(exit) => {
                            self.stats.instructions_retired += u64::from(exit.instructions);
                            match exit.reason {
                                ExitReason::Completed
                                | ExitReason::Break
                                | ExitReason::SelfModified => RunState::ResolvePc,
                                ExitReason::Stop(stop) => {
                                    RunState::Escape(Escape::Status(self.stop_status(cpu, stop, sink)))
                                }
                            }
                        }
                        Err(fault) => {
                            self.stats.instructions_retired += u64::from(fault.instructions);
                            sink.raise_exception(cpu, fault.exception);
                            RunState::Escape(Escape::Status(ExitStatus::Exception(fault.exception)))
                        }
                    }
                }

                RunState::Escape(Escape::Status(status)) => {
                    debug!(
                        rip = format_args!("{:#x}", cpu.rip()),
                        ?status,
                        blocks,
                        "leaving run loop"
                    );
                    return status;
                }

                RunState::Escape(Escape::CompileFault(CompileError::Fault { pc, exception })) => {
                    self.stats.compile_faults += 1;
                    debug!(
                        pc = format_args!("{:#x}", pc),
                        %exception,
                        "fault while compiling; no block created"
                    );
                    sink.raise_exception(cpu, exception);
                    return ExitStatus::CompileFault { pc, exception };
                }
            };
        }
    }

    /// Execute one instruction through the interpreter.
    fn single_step(
        &mut self,
        cpu: &mut CpuState,
        mem: &mut dyn GuestMemory,
        sink: &mut dyn EventSink,
    ) -> ExitStatus {
        let result = {
            let mut ctx = ThreadedCtx::new(cpu, mem, &mut self.write_log);
            interp::step(&mut ctx)
        };
        self.drain_write_log();

        match result {
            Ok(CallStatus::Continue | CallStatus::Break) => {
                self.stats.instructions_retired += 1;
                ExitStatus::SingleStep
            }
            Ok(CallStatus::Stop(stop)) => {
                if matches!(stop, StopReason::Halt | StopReason::SoftwareInterrupt { .. }) {
                    self.stats.instructions_retired += 1;
                }
                self.stop_status(cpu, stop, sink)
            }
            Err(exception) => {
                sink.raise_exception(cpu, exception);
                ExitStatus::Exception(exception)
            }
        }
    }
}

/// A block whose first instruction runs into the next page is only valid
/// while that linear page still maps to the physical page it was compiled
/// from. A fault here is reported by the recompile.
fn second_page_current(tb: &TranslationBlock, cpu: &CpuState, mem: &mut dyn GuestMemory) -> bool {
    let Some(expected) = tb.second_page() else {
        return true;
    };
    let next = (cpu.linear_pc() & PAGE_MASK).wrapping_add(PAGE_SIZE);
    matches!(
        mem.translate(next, AccessType::Execute, cpu.cpl()),
        Ok(phys) if phys & PAGE_MASK == expected
    )
}
