//! Performance benchmarks for a3s-cloudevents
//!
//! Run with: cargo bench

use a3s_cloudevents::binding::{self, EventMessage, PipelineOptions};
use a3s_cloudevents::format;
use a3s_cloudevents::protocol::http::{write_request, HttpMessage, HttpWriter};
use a3s_cloudevents::protocol::memory;
use a3s_cloudevents::{to_event, Context, Event, Message, Receiver, Sender};
use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};

fn event() -> Event {
    let mut e = Event::new();
    e.set_id("ABC-123");
    e.set_type("com.example.market.forex");
    e.set_source("/market/reuters");
    e.set_subject("USD/CNY");
    e.set_extension("exta", "value").unwrap();
    e.set_data(
        "application/json",
        &serde_json::json!({"rate": 7.35, "currency": "USD/CNY", "source": "reuters"}),
    )
    .unwrap();
    e
}

fn bench_json_format(c: &mut Criterion) {
    let event = event();
    let json = format::json();

    c.bench_function("json marshal", |b| {
        b.iter(|| json.marshal(&event).unwrap());
    });

    let bytes = json.marshal(&event).unwrap();
    c.bench_function("json unmarshal", |b| {
        b.iter(|| json.unmarshal(&bytes).unwrap());
    });
}

fn bench_http_pipeline(c: &mut Criterion) {
    let event = event();

    c.bench_function("event to binary request", |b| {
        b.iter(|| {
            let mut req = http::Request::new(Bytes::new());
            write_request(&mut EventMessage::new(event.clone()), &mut req, &[], &PipelineOptions::default())
                .unwrap();
            req
        });
    });

    let mut req = http::Request::new(Bytes::new());
    write_request(&mut EventMessage::new(event.clone()), &mut req, &[], &PipelineOptions::default()).unwrap();
    c.bench_function("binary request to event", |b| {
        b.iter(|| to_event(&mut HttpMessage::new(req.headers().clone(), req.body().clone())).unwrap());
    });

    let mut structured = http::Request::new(Bytes::new());
    write_request(
        &mut EventMessage::new(event.clone()),
        &mut structured,
        &[],
        &PipelineOptions::force_structured(),
    )
    .unwrap();
    c.bench_function("structured forward", |b| {
        b.iter(|| {
            let mut msg = HttpMessage::new(structured.headers().clone(), structured.body().clone());
            let mut writer = HttpWriter::new();
            binding::write(&mut msg, Some(&mut writer), None, &[], &PipelineOptions::default()).unwrap();
            writer.into_parts()
        });
    });
}

fn bench_memory_channel(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let event = event();

    let mut group = c.benchmark_group("memory_throughput");
    for count in [10, 100, 1000] {
        group.bench_function(format!("{} events", count), |b| {
            b.to_async(&rt).iter(|| async {
                let (tx, rx) = memory::channel(count);
                let cx = Context::new();
                for _ in 0..count {
                    tx.send(&cx, Box::new(EventMessage::new(event.clone())), &[])
                        .await
                        .unwrap();
                }
                for _ in 0..count {
                    let mut msg = rx.receive(&cx).await.unwrap().unwrap();
                    msg.finish(None).unwrap();
                }
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_json_format, bench_http_pipeline, bench_memory_channel);
criterion_main!(benches);
