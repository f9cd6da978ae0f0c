//! Benchmarks for path resolution and tree mutation.

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use kestrel_vfs::{Credentials, Vfs, path};

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("path_resolve");

    for depth in [4, 32, 128] {
        let arg: String = (0..depth)
            .map(|i| if i % 3 == 2 { "../x".to_string() } else { format!("d{i}") })
            .collect::<Vec<_>>()
            .join("/");
        let label = format!("depth_{depth}");

        group.bench_with_input(BenchmarkId::new("resolve", &label), &arg, |b, arg| {
            b.iter(|| path::resolve(arg, "/home/Guest"));
        });
    }

    group.finish();
}

fn bench_write(c: &mut Criterion) {
    let mut group = c.benchmark_group("vfs_write");
    let creds = Credentials::new("Guest", "Guest", std::iter::empty());

    for n_files in [100, 1_000] {
        let paths: Vec<String> = (0..n_files)
            .map(|i| format!("/home/Guest/data/file_{i}.txt"))
            .collect();
        let label = format!("{n_files}");

        group.bench_function(BenchmarkId::new("create_or_update_file", &label), |b| {
            b.iter(|| {
                let mut vfs = Vfs::with_defaults("Guest", "Guest");
                for path in &paths {
                    vfs.create_or_update_file(path, "data", &creds).unwrap();
                }
            });
        });
    }

    group.finish();
}

fn bench_lookup_through_symlinks(c: &mut Criterion) {
    let mut group = c.benchmark_group("vfs_lookup");
    let root = Credentials::root();

    for depth in [10, 50] {
        let mut vfs = Vfs::with_defaults("Guest", "Guest");
        let deep: String = (0..depth).map(|i| format!("/d{i}")).collect();
        vfs.create_directory(&deep, &root, true).unwrap();
        vfs.create_or_update_file(&format!("{deep}/leaf"), "x", &root).unwrap();
        vfs.symlink(&deep, "/shortcut", &root).unwrap();
        let label = format!("depth_{depth}");

        group.bench_function(BenchmarkId::new("direct", &label), |b| {
            let path = format!("{deep}/leaf");
            b.iter(|| vfs.get_node(&path));
        });
        group.bench_function(BenchmarkId::new("via_symlink", &label), |b| {
            b.iter(|| vfs.get_node("/shortcut/leaf"));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_resolve, bench_write, bench_lookup_through_symlinks);
criterion_main!(benches);
