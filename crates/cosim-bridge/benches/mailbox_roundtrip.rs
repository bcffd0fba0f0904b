use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cosim_bridge::Mailbox;
use cosim_mem::{Response, Transaction};
use cosim_sync::SleepGate;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

fn criterion_config() -> Criterion {
    match std::env::var("COSIM_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30),
    }
}

fn bench_roundtrip(c: &mut Criterion) {
    let mailbox = Arc::new(Mailbox::new());
    let gate = Arc::new(SleepGate::new());

    let kernel = {
        let (mailbox, gate) = (mailbox.clone(), gate.clone());
        thread::spawn(move || loop {
            let drained = mailbox.drain(|txn| txn.response = Response::Ok);
            if !drained {
                if mailbox.is_closed() {
                    break;
                }
                gate.sleep();
            }
        })
    };

    let mut group = c.benchmark_group("mailbox");
    group.throughput(Throughput::Elements(1));
    group.bench_function("post_u32_write", |b| {
        b.iter(|| {
            let done = mailbox
                .post(Transaction::write_u32(black_box(0x1000), 0xdead_beef), &gate)
                .unwrap();
            black_box(done.response)
        })
    });
    group.finish();

    mailbox.close();
    gate.wake();
    kernel.join().unwrap();
}

criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_roundtrip
}
criterion_main!(benches);
