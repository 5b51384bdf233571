use iem_core::config::{ConfigError, IemConfig};
use iem_core::driver::{EventSink, ExitStatus, Iem, NullEventSink};
use iem_core::exception::{AssistReason, Exception};
use iem_core::mem::{AccessType, FlatTestMemory, GuestMemory};
use iem_core::state::{CpuState, ForceFlags, FLAG_TF};
use iem_core::threaded::IoRequest;

const MEM_SIZE: usize = 0x4000;
const CODE_BASE: u64 = 0x1000;

#[derive(Debug, Default)]
struct RecordingSink {
    exceptions: Vec<Exception>,
    interrupts: Vec<u8>,
}

impl EventSink for RecordingSink {
    fn raise_exception(&mut self, _cpu: &mut CpuState, exception: Exception) {
        self.exceptions.push(exception);
    }

    fn software_interrupt(&mut self, _cpu: &mut CpuState, vector: u8) {
        self.interrupts.push(vector);
    }
}

fn setup(code: &[u8]) -> (Iem, CpuState, FlatTestMemory) {
    setup_with(code, IemConfig::default())
}

fn init_tracing() {
    // Visible with `--nocapture`; a second init from another test is fine.
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn setup_with(code: &[u8], config: IemConfig) -> (Iem, CpuState, FlatTestMemory) {
    init_tracing();
    let mut mem = FlatTestMemory::new(MEM_SIZE);
    mem.load(CODE_BASE, code);
    let mut cpu = CpuState::new_flat32();
    cpu.set_rip(CODE_BASE);
    cpu.gpr[4] = 0x3800;
    (Iem::new(config).unwrap(), cpu, mem)
}

#[test]
fn runs_until_halt() {
    // mov eax, 5; hlt
    let (mut iem, mut cpu, mut mem) = setup(&[0xB8, 0x05, 0x00, 0x00, 0x00, 0xF4]);
    let status = iem.run(&mut cpu, &mut mem, &mut NullEventSink);
    assert_eq!(status, ExitStatus::Halted);
    assert!(cpu.halted);
    assert_eq!(cpu.gpr[0], 5);
    assert_eq!(cpu.rip(), CODE_BASE + 6);

    let stats = iem.stats();
    assert_eq!(stats.blocks_compiled, 1);
    assert_eq!(stats.blocks_executed, 1);
    assert_eq!(stats.instructions_retired, 2);

    // Still halted: nothing runs.
    assert_eq!(iem.run(&mut cpu, &mut mem, &mut NullEventSink), ExitStatus::Halted);
    assert_eq!(iem.stats().blocks_executed, 1);
}

#[test]
fn reruns_reuse_the_cached_block() {
    let (mut iem, mut cpu, mut mem) = setup(&[0x40, 0xF4]);
    for round in 1..=3u64 {
        cpu.halted = false;
        cpu.set_rip(CODE_BASE);
        assert_eq!(iem.run(&mut cpu, &mut mem, &mut NullEventSink), ExitStatus::Halted);
        assert_eq!(cpu.gpr[0], round);
    }
    assert_eq!(iem.stats().blocks_compiled, 1);
    assert_eq!(iem.cache().stats().hits, 2);
}

#[test]
fn tight_loop_stops_at_block_budget() {
    let config = IemConfig {
        max_blocks: 10,
        ..IemConfig::default()
    };
    // jmp $
    let (mut iem, mut cpu, mut mem) = setup_with(&[0xEB, 0xFE], config);
    let status = iem.run(&mut cpu, &mut mem, &mut NullEventSink);
    assert_eq!(status, ExitStatus::BudgetExhausted);
    assert_eq!(cpu.rip(), CODE_BASE);
    assert_eq!(iem.stats().blocks_executed, 10);
    assert_eq!(iem.stats().blocks_compiled, 1);
}

#[test]
fn pending_force_flags_return_before_running() {
    let (mut iem, mut cpu, mut mem) = setup(&[0x40, 0xF4]);
    cpu.force_flags = ForceFlags::INTERRUPT_PENDING;
    let status = iem.run(&mut cpu, &mut mem, &mut NullEventSink);
    assert_eq!(status, ExitStatus::ForcedAction(ForceFlags::INTERRUPT_PENDING));
    assert_eq!(cpu.gpr[0], 0);
    assert_eq!(iem.stats().blocks_executed, 0);
}

#[test]
fn trap_flag_single_steps_without_compiling() {
    // inc eax; inc eax
    let (mut iem, mut cpu, mut mem) = setup(&[0x40, 0x40]);
    cpu.set_flag(FLAG_TF, true);
    assert_eq!(iem.run(&mut cpu, &mut mem, &mut NullEventSink), ExitStatus::SingleStep);
    assert_eq!(cpu.gpr[0], 1);
    assert_eq!(cpu.rip(), CODE_BASE + 1);
    assert!(iem.cache().is_empty());
    assert_eq!(iem.stats().instructions_retired, 1);
}

#[test]
fn software_interrupt_goes_to_the_sink() {
    // int 0x21
    let (mut iem, mut cpu, mut mem) = setup(&[0xCD, 0x21]);
    let mut sink = RecordingSink::default();
    let status = iem.run(&mut cpu, &mut mem, &mut sink);
    assert_eq!(status, ExitStatus::SoftwareInterrupt { vector: 0x21 });
    assert_eq!(sink.interrupts, vec![0x21]);
    assert_eq!(cpu.rip(), CODE_BASE + 2);
}

#[test]
fn data_fault_reports_exception_at_instruction() {
    // inc eax; mov ecx, [0x3ff0]
    let (mut iem, mut cpu, mut mem) = setup(&[0x40, 0x8B, 0x0D, 0xF0, 0x3F, 0x00, 0x00]);
    mem.unmap_page(0x3000);
    let mut sink = RecordingSink::default();
    let status = iem.run(&mut cpu, &mut mem, &mut sink);
    assert!(matches!(
        status,
        ExitStatus::Exception(Exception::PageFault { addr: 0x3FF0, .. })
    ));
    assert_eq!(sink.exceptions.len(), 1);
    assert_eq!(cpu.gpr[0], 1);
    assert_eq!(cpu.rip(), CODE_BASE + 1);
    // The block itself is still valid.
    assert_eq!(iem.cache().len(), 1);
}

#[test]
fn unmapped_code_is_a_compile_fault() {
    let (mut iem, mut cpu, mut mem) = setup(&[]);
    mem.unmap_page(CODE_BASE);
    let mut sink = RecordingSink::default();
    let status = iem.run(&mut cpu, &mut mem, &mut sink);
    assert!(matches!(
        status,
        ExitStatus::CompileFault {
            pc: CODE_BASE,
            exception: Exception::PageFault { .. }
        }
    ));
    assert_eq!(sink.exceptions.len(), 1);
    assert!(iem.cache().is_empty());
    assert_eq!(iem.stats().compile_faults, 1);
}

#[test]
fn over_long_instruction_raises_gp0() {
    let (mut iem, mut cpu, mut mem) = setup(&[0x66; 15]);
    let mut sink = RecordingSink::default();
    let status = iem.run(&mut cpu, &mut mem, &mut sink);
    assert_eq!(status, ExitStatus::Exception(Exception::gp0()));
    assert_eq!(sink.exceptions, vec![Exception::gp0()]);
    assert_eq!(cpu.rip(), CODE_BASE);
}

#[test]
fn port_io_stops_before_the_instruction() {
    // out 0x80, al
    let (mut iem, mut cpu, mut mem) = setup(&[0xE6, 0x80]);
    let status = iem.run(&mut cpu, &mut mem, &mut NullEventSink);
    assert_eq!(
        status,
        ExitStatus::Io(IoRequest {
            port: Some(0x80),
            size: 1,
            write: true,
            string: false,
            rep: false,
        })
    );
    assert_eq!(cpu.rip(), CODE_BASE);
}

#[test]
fn cpuid_needs_assist() {
    let (mut iem, mut cpu, mut mem) = setup(&[0x0F, 0xA2]);
    let status = iem.run(&mut cpu, &mut mem, &mut NullEventSink);
    assert_eq!(status, ExitStatus::Assist(AssistReason::Cpuid));
    assert_eq!(cpu.rip(), CODE_BASE);
}

#[test]
fn self_modifying_store_takes_effect_in_the_same_run() {
    let code = [
        0xC6, 0x05, 0x0C, 0x10, 0x00, 0x00, 0x40, // mov byte [0x100c], 0x40 (inc eax)
        0x90, 0x90, 0x90, 0x90, 0x90, // nop x5
        0x90, // patched
        0xF4, // hlt
    ];
    let (mut iem, mut cpu, mut mem) = setup(&code);
    let status = iem.run(&mut cpu, &mut mem, &mut NullEventSink);
    assert_eq!(status, ExitStatus::Halted);
    assert_eq!(mem.slice(0x100C, 1), &[0x40u8]);
    assert_eq!(cpu.gpr[0], 1);
    assert_eq!(iem.stats().blocks_compiled, 2);
}

#[test]
fn external_write_notification_drops_stale_code() {
    let (mut iem, mut cpu, mut mem) = setup(&[0xB8, 0x01, 0x00, 0x00, 0x00, 0xF4]);
    assert_eq!(iem.run(&mut cpu, &mut mem, &mut NullEventSink), ExitStatus::Halted);
    assert_eq!(cpu.gpr[0], 1);

    mem.load(CODE_BASE + 1, &[0x02]);
    assert_eq!(iem.notify_phys_write(CODE_BASE + 1, 1), 1);
    assert!(iem.cache().is_empty());

    cpu.halted = false;
    cpu.set_rip(CODE_BASE);
    assert_eq!(iem.run(&mut cpu, &mut mem, &mut NullEventSink), ExitStatus::Halted);
    assert_eq!(cpu.gpr[0], 2);
    assert_eq!(iem.stats().blocks_compiled, 2);
}

#[test]
fn invalid_config_is_rejected() {
    let config = IemConfig {
        cache_capacity: 0,
        ..IemConfig::default()
    };
    assert_eq!(Iem::new(config).err(), Some(ConfigError::ZeroCacheCapacity));
}

/// Flat memory with one linear page redirected elsewhere, standing in for a
/// guest page-table update.
struct RemappedMemory {
    flat: FlatTestMemory,
    remap: Option<(u64, u64)>,
}

impl GuestMemory for RemappedMemory {
    fn translate(&mut self, linear: u64, access: AccessType, cpl: u8) -> Result<u64, Exception> {
        match self.remap {
            Some((from, to)) if linear & !0xFFF == from => Ok(to | (linear & 0xFFF)),
            _ => self.flat.translate(linear, access, cpl),
        }
    }

    fn read_phys(&mut self, paddr: u64, dst: &mut [u8]) -> Result<(), Exception> {
        self.flat.read_phys(paddr, dst)
    }

    fn write_phys(&mut self, paddr: u64, src: &[u8]) -> Result<(), Exception> {
        self.flat.write_phys(paddr, src)
    }
}

// mov eax, imm32 with the opcode and first immediate byte at the end of one
// page and the rest on the next; hlt follows.
const STRADDLE_PC: u64 = 0x1FFE;
const STRADDLE_HEAD: [u8; 2] = [0xB8, 0x11];
const STRADDLE_TAIL: [u8; 4] = [0x22, 0x33, 0x44, 0xF4];

#[test]
fn remapped_second_code_page_is_recompiled() {
    let (mut iem, mut cpu, mut flat) = setup(&[]);
    flat.load(STRADDLE_PC, &STRADDLE_HEAD);
    flat.load(0x2000, &STRADDLE_TAIL);
    flat.load(0x3000, &[0xAA, 0xBB, 0xCC, 0xF4]);
    let mut mem = RemappedMemory { flat, remap: None };

    cpu.set_rip(STRADDLE_PC);
    assert_eq!(iem.run(&mut cpu, &mut mem, &mut NullEventSink), ExitStatus::Halted);
    assert_eq!(cpu.gpr[0], 0x4433_2211);
    assert_eq!(iem.stats().blocks_compiled, 2);

    mem.remap = Some((0x2000, 0x3000));
    cpu.set_cr3(0);
    cpu.halted = false;
    cpu.set_rip(STRADDLE_PC);
    assert_eq!(iem.run(&mut cpu, &mut mem, &mut NullEventSink), ExitStatus::Halted);
    assert_eq!(cpu.gpr[0], 0xCCBB_AA11);
    assert_eq!(cpu.rip(), 0x2004);
    assert_eq!(iem.stats().blocks_compiled, 4);
}

#[test]
fn unchanged_second_code_page_still_hits() {
    let (mut iem, mut cpu, mut mem) = setup(&[]);
    mem.load(STRADDLE_PC, &STRADDLE_HEAD);
    mem.load(0x2000, &STRADDLE_TAIL);

    for _ in 0..2 {
        cpu.halted = false;
        cpu.set_rip(STRADDLE_PC);
        cpu.set_cr3(0);
        assert_eq!(iem.run(&mut cpu, &mut mem, &mut NullEventSink), ExitStatus::Halted);
        assert_eq!(cpu.gpr[0], 0x4433_2211);
    }
    assert_eq!(iem.stats().blocks_compiled, 2);
}

#[test]
fn not_present_second_code_page_faults() {
    let (mut iem, mut cpu, mut mem) = setup(&[]);
    mem.load(STRADDLE_PC, &STRADDLE_HEAD);
    mem.load(0x2000, &STRADDLE_TAIL);
    cpu.set_rip(STRADDLE_PC);
    assert_eq!(iem.run(&mut cpu, &mut mem, &mut NullEventSink), ExitStatus::Halted);

    mem.unmap_page(0x2000);
    cpu.set_cr3(0);
    cpu.halted = false;
    cpu.set_rip(STRADDLE_PC);
    let mut sink = RecordingSink::default();
    let status = iem.run(&mut cpu, &mut mem, &mut sink);
    assert!(matches!(
        status,
        ExitStatus::CompileFault {
            pc: STRADDLE_PC,
            exception: Exception::PageFault { addr: 0x2000, .. }
        }
    ));
    assert_eq!(sink.exceptions.len(), 1);
    assert_eq!(cpu.rip(), STRADDLE_PC);
    // Only the hlt block on the (now unmapped) page is left.
    assert_eq!(iem.cache().len(), 1);
}
