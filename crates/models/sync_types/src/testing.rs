/// Testing helpers shared with the client library's tests.
use proptest::prelude::*;
use serde_json::Value as JsonValue;

use crate::Message;

pub fn arb_json() -> impl Strategy<Value = JsonValue> {
    let leaf = prop_oneof![
        Just(JsonValue::Null),
        any::<bool>().prop_map(JsonValue::Bool),
        any::<i64>().prop_map(|v| JsonValue::Number(v.into())),
        "[a-z]{0,8}".prop_map(JsonValue::String),
    ];
    leaf.prop_recursive(4, 32, 4, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(JsonValue::Array),
            prop::collection::hash_map("[a-z]{1,6}", inner, 0..4)
                .prop_map(|m| JsonValue::Object(m.into_iter().collect())),
        ]
    })
}

/// Messages with numeric ids drawn from the given range.
pub fn arb_numeric_messages(ids: std::ops::Range<u64>, max_len: usize) -> impl Strategy<Value = Vec<Message>> {
    prop::collection::vec(ids, 0..max_len).prop_map(|ids| {
        ids.into_iter()
            .map(|id| Message::new(id.to_string(), "update", JsonValue::Null))
            .collect()
    })
}
