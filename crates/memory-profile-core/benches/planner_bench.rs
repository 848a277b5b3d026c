use criterion::{criterion_group, criterion_main, Criterion};
use memory_profile_core::{apply, content_hash, fields, plan, MemoryEntry, PlanMode};
use serde_json::json;
use time::OffsetDateTime;

fn mk_user_entry(index: usize) -> MemoryEntry {
    MemoryEntry::from_value(json!({
        "id": format!("user-{index}"),
        "type": if index % 2 == 0 { "preference" } else { "context" },
        "category": "bench",
        "text": format!("User authored fact number {index}"),
        "value": index
    }))
    .unwrap_or_default()
}

fn mk_desired_entry(index: usize) -> MemoryEntry {
    MemoryEntry::from_value(json!({
        "type": "behavior",
        "key": format!("bench.rule.{index}"),
        "text": format!("Benchmark rule {index}"),
        "value": index % 7
    }))
    .unwrap_or_default()
    .with(fields::MANAGED, true)
}

fn managed_current(desired: &[MemoryEntry]) -> Vec<MemoryEntry> {
    let seeded = plan(&[], desired, PlanMode::Run);
    apply(&[], &seeded, OffsetDateTime::UNIX_EPOCH).next_records
}

fn bench_plan(c: &mut Criterion) {
    let desired = (0..500).map(mk_desired_entry).collect::<Vec<_>>();
    let mut current = managed_current(&desired);
    current.extend((0..1_500).map(mk_user_entry));

    let upgraded = desired
        .iter()
        .enumerate()
        .map(|(index, entry)| {
            if index % 10 == 0 {
                entry.clone().with("value", 99)
            } else {
                entry.clone()
            }
        })
        .collect::<Vec<_>>();

    c.bench_function("plan_500_desired_2000_current", |b| {
        b.iter(|| {
            let plan = plan(&current, &upgraded, PlanMode::Upgrade);
            if plan.counts.update != 50 {
                panic!("planner benchmark expected 50 updates, got {}", plan.counts.update);
            }
        });
    });
}

fn bench_hash(c: &mut Criterion) {
    let records = (0..2_000).map(mk_user_entry).collect::<Vec<_>>();

    c.bench_function("content_hash_2000_records", |b| {
        b.iter(|| records.iter().map(content_hash).count());
    });
}

criterion_group!(planner_benches, bench_plan, bench_hash);
criterion_main!(planner_benches);
