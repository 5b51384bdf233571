use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use iem_core::compile::compile_block;
use iem_core::config::{CpuTarget, IemConfig};
use iem_core::fetch::InstrStream;
use iem_core::mem::FlatTestMemory;
use iem_core::mode::ExecModeFlags;
use iem_core::state::CpuState;
use iem_core::tb::{ArchIdentity, PhysRange, TbFlags, TranslationBlock};
use iem_core::tb_cache::TbCache;

fn criterion_config() -> Criterion {
    match std::env::var("AERO_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            // Keep PR runtime low.
            .warm_up_time(Duration::from_millis(150))
            .measurement_time(Duration::from_millis(400))
            .sample_size(20)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(50)
            .noise_threshold(0.03),
    }
}

/// Deterministic RNG for input generation without pulling in `rand`.
#[derive(Clone)]
struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // https://en.wikipedia.org/wiki/Splitmix64
        let mut z = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        self.state = z;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    fn next_usize(&mut self, upper_exclusive: usize) -> usize {
        debug_assert!(upper_exclusive != 0);
        (self.next_u64() as usize) % upper_exclusive
    }
}

const CACHE_BLOCKS: usize = 10_000;
const QUERY_COUNT: usize = 8_192; // power-of-two for cheap wrapping
const RNG_SEED: u64 = 0x51C3_0A7E_2B4D_9F61;
const HASH_BITS: u32 = 14;

fn phys_for_index(idx: usize) -> u64 {
    // 32-byte blocks, packed back to back.
    (idx as u64) << 5
}

fn key() -> (ExecModeFlags, ArchIdentity) {
    let cpu = CpuState::new_flat32();
    (
        ExecModeFlags::from_cpu(&cpu, CpuTarget::Current, false),
        ArchIdentity::from_cpu(&cpu),
    )
}

fn make_block(phys_pc: u64) -> TranslationBlock {
    let (flags, arch) = key();
    TranslationBlock {
        phys_pc,
        pc: phys_pc,
        flags,
        tb_flags: TbFlags::THREADED,
        arch,
        cb_pc: 32,
        ranges: vec![PhysRange {
            start: phys_pc,
            len: 32,
        }],
        calls: Vec::new(),
        instruction_count: 8,
    }
}

fn build_cache_near_capacity() -> TbCache {
    let mut cache = TbCache::new(CACHE_BLOCKS, HASH_BITS);
    for i in 0..CACHE_BLOCKS {
        cache.insert(make_block(phys_for_index(i)));
    }
    cache
}

fn bench_lookup(c: &mut Criterion) {
    let (flags, arch) = key();
    let mut group = c.benchmark_group("tb_cache");
    group.throughput(Throughput::Elements(1));

    for (name, hit_every) in [("lookup_hit_100pct", 1usize), ("lookup_hit_50pct", 2)] {
        group.bench_function(name, |b| {
            let mut cache = build_cache_near_capacity();
            let mut rng = SplitMix64::new(RNG_SEED ^ hit_every as u64);
            let queries: Vec<u64> = (0..QUERY_COUNT)
                .map(|i| {
                    if i % hit_every == 0 {
                        phys_for_index(rng.next_usize(CACHE_BLOCKS))
                    } else {
                        // Outside the pre-filled range.
                        phys_for_index(CACHE_BLOCKS + rng.next_usize(CACHE_BLOCKS))
                    }
                })
                .collect();

            let mut idx = 0usize;
            b.iter(|| {
                let phys = queries[idx & (QUERY_COUNT - 1)];
                idx = idx.wrapping_add(1);
                let hit = cache.lookup(black_box(phys), flags, &arch);
                black_box(hit.and_then(|h| cache.get_cloned(h)));
            });
        });
    }

    group.bench_function("lookup_miss", |b| {
        let mut cache = build_cache_near_capacity();
        let mut rng = SplitMix64::new(RNG_SEED ^ 0x5A5A_5A5A_5A5A_5A5A);
        let queries: Vec<u64> = (0..QUERY_COUNT)
            .map(|_| phys_for_index(CACHE_BLOCKS + rng.next_usize(CACHE_BLOCKS)))
            .collect();

        let mut idx = 0usize;
        b.iter(|| {
            let phys = queries[idx & (QUERY_COUNT - 1)];
            idx = idx.wrapping_add(1);
            black_box(cache.lookup(black_box(phys), flags, &arch));
        });
    });

    const INSERT_OPS: usize = 1_024;
    group.throughput(Throughput::Elements(INSERT_OPS as u64));
    group.bench_function("insert_evict", |b| {
        let mut cache = build_cache_near_capacity();
        let mut next = CACHE_BLOCKS;
        b.iter(|| {
            for _ in 0..INSERT_OPS {
                black_box(cache.insert(make_block(phys_for_index(next))));
                next = next.wrapping_add(1);
            }
        });
    });

    group.finish();
}

fn bench_invalidate(c: &mut Criterion) {
    let mut group = c.benchmark_group("tb_invalidate");
    group.throughput(Throughput::Elements(1));

    // Data writes far away from any code page: the page filter answers.
    group.bench_function("write_to_data_page", |b| {
        let mut cache = build_cache_near_capacity();
        let data_base = phys_for_index(CACHE_BLOCKS) + 0x10_0000;
        let mut rng = SplitMix64::new(RNG_SEED ^ 0x0F0F_0F0F_0F0F_0F0F);
        let queries: Vec<u64> = (0..QUERY_COUNT)
            .map(|_| data_base + (rng.next_u64() & 0xF_FFF8))
            .collect();

        let mut idx = 0usize;
        b.iter(|| {
            let addr = queries[idx & (QUERY_COUNT - 1)];
            idx = idx.wrapping_add(1);
            black_box(cache.invalidate_phys_range(black_box(addr), 4));
        });
    });

    group.bench_function("write_into_code_and_recompile", |b| {
        let mut cache = build_cache_near_capacity();
        let mut rng = SplitMix64::new(RNG_SEED ^ 0x1234_5678_9ABC_DEF0);
        b.iter(|| {
            let phys = phys_for_index(rng.next_usize(CACHE_BLOCKS));
            let removed = cache.invalidate_phys_range(black_box(phys + 4), 4);
            cache.insert(make_block(phys));
            black_box(removed);
        });
    });

    group.finish();
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("compile_block");

    // mov eax, imm32; add eax, ecx; inc edx; push eax; pop ebx, repeated, then hlt.
    let unit: [u8; 10] = [0xB8, 0x01, 0x00, 0x00, 0x00, 0x01, 0xC8, 0x42, 0x50, 0x5B];
    let mut code = Vec::new();
    for _ in 0..40 {
        code.extend_from_slice(&unit);
    }
    code.push(0xF4);

    let mut mem = FlatTestMemory::new(0x4000);
    mem.load(0x1000, &code);
    let mut cpu = CpuState::new_flat32();
    cpu.set_rip(0x1000);
    let flags = ExecModeFlags::from_cpu(&cpu, CpuTarget::Current, false);
    let config = IemConfig::default();

    group.throughput(Throughput::Bytes(code.len() as u64));
    group.bench_function("straight_line_401b", |b| {
        let mut stream = InstrStream::new();
        b.iter(|| {
            let tb = compile_block(&cpu, &mut mem, &mut stream, flags, &config);
            black_box(tb.map(|tb| tb.calls.len()).unwrap_or(0));
        });
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_lookup, bench_invalidate, bench_compile
}
criterion_main!(benches);
