//! Parser benchmarks for aprsgate-protocol.

use aprsgate_protocol::{parse, OutboundMessage, Payload};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

const MESSAGE_LINE: &str = "SRCUSER>APRS,K8SDR*,qAC,K8SDR-10::TESTUSER :Hello there{12}";
const POSITION_LINE: &str = "W1ABC>APRS,TCPIP*,qAC,T2BOS:!4903.50N/07201.75W-PHG2360";

fn bench_parse_message(c: &mut Criterion) {
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Bytes(MESSAGE_LINE.len() as u64));
    group.bench_function("user_message", |b| b.iter(|| parse(black_box(MESSAGE_LINE))));
    group.finish();
}

fn bench_parse_unrecognized(c: &mut Criterion) {
    // Most of the feed is position reports that fall through every matcher.
    let mut group = c.benchmark_group("parse");
    group.throughput(Throughput::Bytes(POSITION_LINE.len() as u64));
    group.bench_function("position_report", |b| {
        b.iter(|| parse(black_box(POSITION_LINE)))
    });
    group.finish();
}

fn bench_format_outbound(c: &mut Criterion) {
    let msg = OutboundMessage::new(
        "K8SDR",
        "W1ABC",
        Payload::ReplyAck {
            text: "Roger that".into(),
            id: "05".into(),
            ack_id: "12".into(),
        },
    )
    .with_path(vec!["TCPIP".into(), "K8SDR-10*".into()]);

    c.bench_function("format_reply_ack", |b| b.iter(|| black_box(&msg).encode()));
}

criterion_group!(
    benches,
    bench_parse_message,
    bench_parse_unrecognized,
    bench_format_outbound
);
criterion_main!(benches);
