// Allocation hot-path benchmark.
//
// Runs the allocator against a temporary-directory hugepage
// environment; on machines where even that cannot be set up, the
// benches are skipped.

use criterion::{criterion_group, criterion_main, Criterion};
use rusty_nvme::{alloc, cleanup, free, init_with_config, MemConfig, NODE_ID_ANY};

fn bench_alloc_free(c: &mut Criterion) {
    let mount = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(_) => return,
    };
    let cfg = MemConfig {
        mount_override: Some(mount.path().to_path_buf()),
        hugepage_size: Some(2 * 1024 * 1024),
        ..Default::default()
    };
    if init_with_config(cfg).is_err() {
        eprintln!("skipping benches: memory environment unavailable");
        return;
    }

    c.bench_function("alloc_free_256", |b| {
        b.iter(|| {
            let buf = alloc(256, 0, NODE_ID_ANY).unwrap();
            free(std::hint::black_box(buf.virt().as_ptr()));
        })
    });

    c.bench_function("alloc_free_4k", |b| {
        b.iter(|| {
            let buf = alloc(4096, 0, NODE_ID_ANY).unwrap();
            free(std::hint::black_box(buf.virt().as_ptr()));
        })
    });

    cleanup();
}

criterion_group!(benches, bench_alloc_free);
criterion_main!(benches);
