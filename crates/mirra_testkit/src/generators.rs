//! Property-based test generators using proptest.

use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for collection names.
pub fn collection_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9]{0,7}").expect("Invalid regex")
}

/// Strategy for document ids.
pub fn document_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z0-9]{1,12}").expect("Invalid regex")
}

/// Strategy for full document paths such as `ducks/yellow`.
pub fn document_path_strategy() -> impl Strategy<Value = String> {
    (collection_strategy(), document_id_strategy()).prop_map(|(c, id)| format!("{c}/{id}"))
}

/// Strategy for storage object paths.
pub fn object_path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec("[a-z0-9]{1,8}", 1..4).prop_map(|segments| segments.join("/"))
}

/// Strategy for flat JSON documents.
pub fn document_data_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(
        "[a-z]{1,8}",
        prop_oneof![
            any::<i64>().prop_map(Value::from),
            any::<bool>().prop_map(Value::from),
            "[a-zA-Z ]{0,16}".prop_map(Value::from),
        ],
        0..6,
    )
    .prop_map(|fields| Value::Object(fields.into_iter().collect::<Map<String, Value>>()))
}

/// Strategy for field names touched by one batch, with repeats.
pub fn field_touches_strategy() -> impl Strategy<Value = Vec<&'static str>> {
    const FIELDS: &[&str] = &["data", "state", "isDirty", "metadata", "content", "length"];
    prop::collection::vec(prop::sample::select(FIELDS), 0..24)
}

/// Strategy for a total size and a transferred count within it.
pub fn transfer_strategy() -> impl Strategy<Value = (u64, u64)> {
    (0u64..4096).prop_flat_map(|total| (Just(total), 0..=total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirra_protocol::DocumentPath;

    proptest! {
        #[test]
        fn generated_paths_parse(path in document_path_strategy()) {
            prop_assert!(DocumentPath::parse(&path).is_some());
        }

        #[test]
        fn transfers_never_exceed_total((total, sent) in transfer_strategy()) {
            prop_assert!(sent <= total);
        }
    }
}
