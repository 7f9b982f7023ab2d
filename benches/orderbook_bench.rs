use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use coralbook::{BookConfig, OrderBook, OrderSpec, Side, TimeInForce};

fn resting_book(levels: i64, per_level: usize) -> OrderBook {
    let book = OrderBook::new(BookConfig::new("BENCH/USD"));
    for i in 0..levels {
        for _ in 0..per_level {
            let bid = Decimal::from(100 - i);
            let ask = Decimal::from(101 + i);
            book.submit(OrderSpec::limit(Side::Buy, bid, dec!(1.0))).unwrap();
            book.submit(OrderSpec::limit(Side::Sell, ask, dec!(1.0))).unwrap();
        }
    }
    book
}

fn orderbook_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("orderbook_operations");

    // Benchmark resting a passive order
    group.bench_function("submit_passive", |b| {
        let book = resting_book(50, 2);
        b.iter(|| {
            let report = book
                .submit(black_box(OrderSpec::limit(Side::Buy, dec!(50.00), dec!(1.0))))
                .unwrap();
            book.cancel(&report.order_id).unwrap();
        });
    });

    // Benchmark an aggressive IOC order crossing one level
    group.bench_function("submit_crossing_ioc", |b| {
        let book = resting_book(50, 2);
        b.iter(|| {
            book.submit(black_box(
                OrderSpec::limit(Side::Buy, dec!(101.00), dec!(0.1))
                    .with_time_in_force(TimeInForce::Ioc),
            ))
            .unwrap();
        });
    });

    // Benchmark cancellation through the order index
    group.bench_function("submit_then_cancel", |b| {
        let book = resting_book(50, 2);
        b.iter(|| {
            let report =
                book.submit(OrderSpec::limit(Side::Buy, dec!(60.00), dec!(1.0))).unwrap();
            book.cancel(black_box(&report.order_id)).unwrap();
        });
    });

    // Benchmark snapshotting a populated book
    group.bench_function("snapshot_depth_10", |b| {
        let book = resting_book(100, 3);
        b.iter(|| {
            black_box(book.snapshot(Some(10)).unwrap());
        });
    });

    group.finish();
}

fn mixed_flow_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("mixed_flow");
    group.sample_size(20);

    // A randomized submit/cancel flow around a moving mid price
    group.bench_function("random_flow_1000", |b| {
        b.iter(|| {
            let book = OrderBook::new(BookConfig::new("BENCH/USD"));
            let mut rng = StdRng::seed_from_u64(42);
            let mut live: Vec<String> = Vec::new();
            for _ in 0..1000 {
                let side = if rng.gen_bool(0.5) { Side::Buy } else { Side::Sell };
                let offset = Decimal::from(rng.gen_range(-5i64..=5));
                let price = dec!(100.00) + offset;
                let quantity = Decimal::from(rng.gen_range(1i64..=5));
                let report = book.submit(OrderSpec::limit(side, price, quantity)).unwrap();
                if report.resting {
                    live.push(report.order_id);
                }
                if live.len() > 50 {
                    let victim = live.remove(rng.gen_range(0..live.len()));
                    let _ = book.cancel(&victim);
                }
            }
            black_box(book.statistics());
        });
    });

    group.finish();
}

fn expiry_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("expiry");
    group.sample_size(20);

    group.bench_function("sweep_1000_expired", |b| {
        b.iter(|| {
            let book = OrderBook::new(BookConfig::new("BENCH/USD"));
            let deadline = Utc::now() + chrono::Duration::milliseconds(50);
            for i in 0..1000i64 {
                book.submit(
                    OrderSpec::limit(Side::Buy, Decimal::from(100 + (i % 50)), dec!(1.0))
                        .with_time_in_force(TimeInForce::Gtd)
                        .with_expiry(deadline),
                )
                .unwrap();
            }
            std::thread::sleep(std::time::Duration::from_millis(60));
            black_box(book.sweep_expired());
        });
    });

    group.finish();
}

criterion_group!(benches, orderbook_benchmark, mixed_flow_benchmark, expiry_benchmark);
criterion_main!(benches);
