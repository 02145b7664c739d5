//! Throughput benchmarks
//!
//! Three layers, bottom-up: the sharded map on its own, the skiplist behind
//! sorted sets, and whole commands going through `Server::exec` with locking,
//! version bumps and expiry bookkeeping included.

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use ravenkv::commands::CommandRegistry;
use ravenkv::connection::ConnectionState;
use ravenkv::database::{DatabaseConfig, Server};
use ravenkv::storage::{ShardedMap, Skiplist};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn line(parts: &[&str]) -> Vec<Bytes> {
    parts.iter().map(|p| Bytes::from(p.to_string())).collect()
}

fn bench_dict(c: &mut Criterion) {
    let map: Arc<ShardedMap<Bytes>> = Arc::new(ShardedMap::new(16));
    for i in 0..100_000 {
        map.put(Bytes::from(format!("key:{}", i)), Bytes::from("value"));
    }

    let mut group = c.benchmark_group("dict");
    group.throughput(Throughput::Elements(1));

    group.bench_function("put", |b| {
        let mut i = 0u64;
        b.iter(|| {
            map.put(Bytes::from(format!("new:{}", i)), Bytes::from("value"));
            i += 1;
        });
    });

    group.bench_function("get_existing", |b| {
        let mut i = 0u64;
        b.iter(|| {
            black_box(map.get(format!("key:{}", i % 100_000).as_bytes()));
            i += 1;
        });
    });

    group.bench_function("lock_keys_two_shards", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let a = Bytes::from(format!("key:{}", i % 100_000));
            let z = Bytes::from(format!("key:{}", (i + 7) % 100_000));
            let locked = map.lock_keys(&[a], &[z]);
            black_box(&locked);
            i += 1;
        });
    });

    group.finish();

    let mut group = c.benchmark_group("dict_concurrent");
    group.measurement_time(Duration::from_secs(10));
    group.bench_function("4_threads_put_get", |b| {
        b.iter(|| {
            let map: Arc<ShardedMap<Bytes>> = Arc::new(ShardedMap::new(16));
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let map = Arc::clone(&map);
                    thread::spawn(move || {
                        for i in 0..10_000 {
                            let key = Bytes::from(format!("key:{}:{}", t, i));
                            map.put(key.clone(), Bytes::from("value"));
                            black_box(map.get(&key));
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            black_box(map.len());
        });
    });
    group.finish();
}

fn bench_skiplist(c: &mut Criterion) {
    let mut group = c.benchmark_group("skiplist");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert", |b| {
        let mut list = Skiplist::new();
        let mut i = 0u64;
        b.iter(|| {
            list.insert(Bytes::from(format!("m{}", i)), (i % 1000) as f64);
            i += 1;
        });
    });

    let mut list = Skiplist::new();
    for i in 0..100_000u64 {
        list.insert(Bytes::from(format!("m{}", i)), i as f64);
    }

    group.bench_function("rank", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let n = i % 100_000;
            black_box(list.rank(format!("m{}", n).as_bytes(), n as f64));
            i += 1;
        });
    });

    group.bench_function("get_by_rank", |b| {
        let mut i = 0usize;
        b.iter(|| {
            black_box(list.get_by_rank(i % 100_000));
            i += 1;
        });
    });

    group.finish();
}

fn bench_commands(c: &mut Criterion) {
    // Databases start their expiry timer on the current runtime.
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let _guard = runtime.enter();

    let server = Server::new(
        1,
        Arc::new(CommandRegistry::standard()),
        DatabaseConfig::default(),
    );
    let mut conn = ConnectionState::new();

    let mut group = c.benchmark_group("commands");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let cmd = line(&["SET", &format!("key:{}", i % 10_000), "value"]);
            black_box(server.exec(&mut conn, &cmd));
            i += 1;
        });
    });

    group.bench_function("get", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let cmd = line(&["GET", &format!("key:{}", i % 10_000)]);
            black_box(server.exec(&mut conn, &cmd));
            i += 1;
        });
    });

    group.bench_function("set_with_ttl", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let cmd = line(&["SET", &format!("ttl:{}", i % 10_000), "v", "EX", "3600"]);
            black_box(server.exec(&mut conn, &cmd));
            i += 1;
        });
    });

    group.bench_function("zadd", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let cmd = line(&["ZADD", "board", &(i % 1000).to_string(), &format!("p{}", i)]);
            black_box(server.exec(&mut conn, &cmd));
            i += 1;
        });
    });

    group.bench_function("zrange_top10", |b| {
        let cmd = line(&["ZREVRANGE", "board", "0", "9", "WITHSCORES"]);
        b.iter(|| {
            black_box(server.exec(&mut conn, &cmd));
        });
    });

    group.bench_function("multi_exec", |b| {
        let multi = line(&["MULTI"]);
        let incr = line(&["INCR", "counter"]);
        let set = line(&["SET", "last", "x"]);
        let exec = line(&["EXEC"]);
        b.iter(|| {
            server.exec(&mut conn, &multi);
            server.exec(&mut conn, &incr);
            server.exec(&mut conn, &set);
            black_box(server.exec(&mut conn, &exec));
        });
    });

    group.finish();

    let mut group = c.benchmark_group("keyspace");
    group.bench_function("keys_pattern", |b| {
        let cmd = line(&["KEYS", "key:1*"]);
        b.iter(|| {
            black_box(server.exec(&mut conn, &cmd));
        });
    });
    group.finish();
}

criterion_group!(benches, bench_dict, bench_skiplist, bench_commands);
criterion_main!(benches);
