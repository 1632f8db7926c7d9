//! Property-based tests for the key-value table.
//!
//! Arbitrary PUT/GET sequences are replayed against a `HashMap` reference
//! model: every GET must agree with the model, and the table must end up
//! with exactly the model's key set regardless of bucket count.

use std::collections::HashMap;

use proptest::prelude::*;

use shmkv::table::{KvTable, ABSENT_VALUE};

#[derive(Debug, Clone, Copy)]
enum TableOp {
    Put(u32, u32),
    Get(u32),
}

fn op_strategy() -> impl Strategy<Value = TableOp> {
    prop_oneof![
        (0u32..64, 1u32..10_000).prop_map(|(k, v)| TableOp::Put(k, v)),
        (0u32..64).prop_map(TableOp::Get),
    ]
}

proptest! {
    #[test]
    fn table_matches_hashmap_model(
        ops in proptest::collection::vec(op_strategy(), 1..256),
        buckets in 1usize..32,
    ) {
        let table = KvTable::with_buckets(buckets);
        let mut model: HashMap<u32, u32> = HashMap::new();

        for op in &ops {
            match *op {
                TableOp::Put(key, value) => {
                    table.put(key, value);
                    model.insert(key, value);
                }
                TableOp::Get(key) => {
                    let expected = model.get(&key).copied().unwrap_or(ABSENT_VALUE);
                    prop_assert_eq!(table.get(key), expected);
                }
            }
        }

        prop_assert_eq!(table.len(), model.len());
        for (key, value) in &model {
            prop_assert_eq!(table.get(*key), *value);
        }
    }

    #[test]
    fn get_is_idempotent(key in any::<u32>(), value in 1u32..u32::MAX) {
        let table = KvTable::with_buckets(7);
        prop_assert_eq!(table.get(key), ABSENT_VALUE);
        prop_assert_eq!(table.get(key), ABSENT_VALUE);

        table.put(key, value);
        prop_assert_eq!(table.get(key), value);
        prop_assert_eq!(table.get(key), value);
    }
}
