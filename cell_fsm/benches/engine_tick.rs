//! Tick benchmarks: one lockstep pass over the idle simulated cell and the
//! safety check run before each motion.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use cell_common::config::CellConfig;
use cell_fsm::{Cell, MotionCatalogue};
use cell_hal::drivers::simulation::{self, SimulationOptions};
use cell_store::SharedStore;

fn idle_cell() -> Cell {
    let config = CellConfig::default();
    let (hardware, _handles) = simulation::build(&SimulationOptions::default(), &config.io);
    let mut cell = match Cell::new(&config, hardware, SharedStore::new()) {
        Ok(cell) => cell,
        Err(e) => panic!("cell wiring: {e}"),
    };
    for _ in 0..5 {
        cell.tick_all();
    }
    cell
}

fn bench_tick_all(c: &mut Criterion) {
    let mut cell = idle_cell();
    c.bench_function("cell_tick_all_idle", |b| {
        b.iter(|| {
            cell.tick_all();
            black_box(cell.store().version())
        })
    });
}

fn bench_motion_safety(c: &mut Criterion) {
    let mut group = c.benchmark_group("motion_is_allowed");
    for floors in [5_u8, 20] {
        let catalogue = MotionCatalogue::new(floors);
        let ids: Vec<i64> = (1000..1000 + 10 * i64::from(floors) + 2)
            .chain([2000, 2001, 2002, 4000, 4001, 4002, 4003, 4004, 5000, 5001])
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(floors), &ids, |b, ids| {
            b.iter(|| {
                let mut allowed = 0_usize;
                for &from in ids {
                    for &to in ids {
                        allowed += usize::from(catalogue.is_allowed(from, to));
                    }
                }
                black_box(allowed)
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_tick_all, bench_motion_safety);
criterion_main!(benches);
