use std::collections::BTreeSet;

use tandem_core::{ActorId, ChangeId, EntityId};
use tandem_sync::change::Operation;
use tandem_sync::index::DivergenceIndex;
use tandem_sync::Change;

fn main() {
    divan::main();
}

fn changes(n: usize) -> Vec<Change> {
    (1..=n as u64)
        .map(|seq| {
            let id = ChangeId::new(ActorId::new(format!("actor-{}", seq % 4)), seq);
            Change {
                deps: BTreeSet::new(),
                entity: EntityId::new(format!("session-{}", seq % 8)),
                op: Operation::Delete,
                timestamp: seq,
                id,
            }
        })
        .collect()
}

#[divan::bench(args = [1_000, 10_000, 100_000])]
fn build(bencher: divan::Bencher, n: usize) {
    let log = changes(n);
    bencher
        .counter(divan::counter::ItemsCount::new(n))
        .bench(|| DivergenceIndex::build(4, divan::black_box(log.iter())).unwrap());
}

#[divan::bench(args = [10_000, 100_000])]
fn diff_one_missing(bencher: divan::Bencher, n: usize) {
    let log = changes(n);
    let full = DivergenceIndex::build(4, log.iter()).unwrap();
    let partial = DivergenceIndex::build(4, log.iter().skip(1)).unwrap();
    bencher.bench(|| full.diff(divan::black_box(&partial)).unwrap());
}

#[divan::bench]
fn combined_root(bencher: divan::Bencher) {
    let index = DivergenceIndex::build(4, changes(10_000).iter()).unwrap();
    bencher.bench(|| index.combined_root());
}
