//! Benchmarks for message delivery in mailbox.rs and supervisor/
//!
//! Performance-critical paths:
//! - `Mailbox::deliver` / `Mailbox::fetch`: every hop between workers
//! - `Supervisor::deliver` to a worker and back: one routed round trip

#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;
use vatvisor_kernel::infrastructure::config::DebugSettings;
use vatvisor_kernel::mailbox::Mailbox;
use vatvisor_kernel::message::{Headers, Id, Message, MessageType};
use vatvisor_kernel::supervisor::Supervisor;
use vatvisor_kernel::worker::{WorkerContext, WorkerError};

fn send(to: Id) -> Message {
    Message::new(Headers::new(MessageType::Send).with_to(to)).with_body(&b"payload"[..])
}

fn bench_deliver_then_fetch(c: &mut Criterion) {
    let mut group = c.benchmark_group("mailbox/deliver_fetch");
    let rt = Runtime::new().unwrap();
    let cancel = CancellationToken::new();

    for batch in [1usize, 16, 256] {
        group.throughput(Throughput::Elements(batch as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch), &batch, |b, &n| {
            let mailbox = Mailbox::new();
            b.to_async(&rt).iter(|| {
                let mailbox = mailbox.clone();
                let cancel = cancel.clone();
                async move {
                    for _ in 0..n {
                        mailbox.deliver(&cancel, send(Id::new(1))).unwrap();
                    }
                    black_box(mailbox.fetch(&cancel).await.unwrap())
                }
            });
        });
    }

    group.finish();
}

async fn echo(ctx: WorkerContext) -> Result<(), WorkerError> {
    loop {
        for mut message in ctx.fetch().await? {
            let reply = Message::new(message.headers.reply(MessageType::Ok));
            message.respond(reply);
        }
    }
}

fn bench_routed_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("supervisor/round_trip");
    let rt = Runtime::new().unwrap();

    let (supervisor, worker) = rt.block_on(async {
        let supervisor = Supervisor::new(DebugSettings::default());
        supervisor.start();
        let worker = supervisor.spawn(Id::SUPERVISOR, echo);
        (supervisor, worker)
    });

    group.bench_function("driver_sync_call", |b| {
        b.to_async(&rt).iter(|| {
            let supervisor = supervisor.clone();
            async move {
                let (request, reply) = Message::request(
                    Headers::new(MessageType::System)
                        .with_from(Id::DRIVER)
                        .with_to(worker),
                );
                supervisor.deliver(request).unwrap();
                black_box(reply.await.unwrap())
            }
        });
    });

    group.finish();
    supervisor.stop();
    rt.block_on(supervisor.wait());
}

criterion_group!(benches, bench_deliver_then_fetch, bench_routed_round_trip);
criterion_main!(benches);
