//! Replays the call list of a translation block.

use tracing::trace;

use crate::exception::Exception;
use crate::tb::TranslationBlock;
use crate::threaded::{CallStatus, StopReason, ThreadedCtx, ThreadedFunctionTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Every call ran.
    Completed,
    /// A call asked to end the block early.
    Break,
    /// The block stored into its own opcode bytes; the rest of it is stale.
    SelfModified,
    Stop(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockExit {
    pub reason: ExitReason,
    /// Instructions retired by this execution.
    pub instructions: u32,
}

/// A fault raised by one of the block's instructions. CPU state reflects all
/// instructions before it; RIP points at the faulting one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{exception} at {pc:#x}")]
pub struct ExecFault {
    pub exception: Exception,
    /// Linear address of the faulting instruction (`tb.pc + off_opcode`).
    pub pc: u64,
    pub cb_opcode: u8,
    pub instructions: u32,
}

pub fn execute(
    tb: &TranslationBlock,
    ctx: &mut ThreadedCtx<'_>,
    table: &ThreadedFunctionTable,
) -> Result<BlockExit, ExecFault> {
    let mut retired = 0u32;
    let mut checked = ctx.write_log.len();

    for (i, call) in tb.calls.iter().enumerate() {
        let info = table.get(call.function);
        let status = match (info.handler)(ctx, call) {
            Ok(status) => status,
            Err(exception) => {
                trace!(
                    function = info.name,
                    pc = format_args!("{:#x}", tb.pc.wrapping_add(u64::from(call.off_opcode))),
                    %exception,
                    "threaded call faulted"
                );
                return Err(ExecFault {
                    exception,
                    pc: tb.pc.wrapping_add(u64::from(call.off_opcode)),
                    cb_opcode: call.cb_opcode,
                    instructions: retired,
                });
            }
        };

        let last_of_inst = tb
            .calls
            .get(i + 1)
            .map_or(true, |next| next.off_opcode != call.off_opcode);

        let reason = match status {
            CallStatus::Continue => {
                if last_of_inst {
                    retired += 1;
                }
                None
            }
            CallStatus::Break => {
                retired += 1;
                Some(ExitReason::Break)
            }
            CallStatus::Stop(stop) => {
                if matches!(stop, StopReason::Halt | StopReason::SoftwareInterrupt { .. }) {
                    retired += 1;
                }
                Some(ExitReason::Stop(stop))
            }
        };
        if let Some(reason) = reason {
            return Ok(BlockExit {
                reason,
                instructions: retired,
            });
        }

        if ctx.write_log.len() > checked {
            let hit = ctx.write_log[checked..]
                .iter()
                .any(|w| tb.overlaps(w.start, w.len as u64));
            checked = ctx.write_log.len();
            if hit && i + 1 < tb.calls.len() {
                trace!(pc = format_args!("{:#x}", tb.pc), "block modified itself");
                return Ok(BlockExit {
                    reason: ExitReason::SelfModified,
                    instructions: retired,
                });
            }
        }
    }

    Ok(BlockExit {
        reason: ExitReason::Completed,
        instructions: retired,
    })
}
