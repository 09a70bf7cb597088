use std::collections::HashMap;

use gatehouse_policy::{
    DatastoreSchema, PreprocessError, QueryBody, QueryTranslator, RefPreprocessor, SqlValue,
    TableRef, Translation,
};
use serde_json::json;

fn bodies(raw: serde_json::Value) -> Vec<QueryBody> {
    serde_json::from_value(raw).expect("bodies decode")
}

fn translator() -> QueryTranslator {
    let mut schema = DatastoreSchema::new();
    schema.insert("pets", TableRef::new("petstore", "pets"));
    schema.insert("owners", TableRef::new("petstore", "owners"));
    QueryTranslator::new(HashMap::from([("db1".to_string(), schema)]))
}

fn var(name: &str) -> serde_json::Value {
    json!({"type": "var", "value": name})
}

fn string(value: &str) -> serde_json::Value {
    json!({"type": "string", "value": value})
}

fn op(name: &str) -> serde_json::Value {
    json!({"type": "ref", "value": [var(name)]})
}

#[test]
fn compile_output_translates_to_one_exists_query() {
    let raw = json!([
        [
            {"index": 0, "terms": [
                op("eq"),
                {"type": "ref", "value": [var("data"), string("pets"), var("$01"), string("owner_id")]},
                {"type": "ref", "value": [var("data"), string("owners"), var("$02"), string("id")]}
            ]},
            {"index": 1, "terms": [
                op("eq"),
                {"type": "ref", "value": [var("$02"), string("name")]},
                string("alice")
            ]}
        ]
    ]);

    let normalized = RefPreprocessor::new()
        .process(bodies(raw))
        .expect("normalizes");
    assert_eq!(
        normalized[0][1].to_string(),
        r#"eq(data.owners.name, "alice")"#
    );

    let Translation::Query(queries) = translator()
        .translate("db1", &normalized)
        .expect("translates")
    else {
        panic!("expected a store query");
    };
    assert_eq!(queries.len(), 1);
    assert_eq!(
        queries[0].sql,
        concat!(
            r#"SELECT EXISTS (SELECT 1 FROM "petstore"."pets", "petstore"."owners" WHERE "#,
            r#"("petstore"."pets"."owner_id" = "petstore"."owners"."id") AND "#,
            r#"("petstore"."owners"."name" = $1))"#
        )
    );
    assert_eq!(queries[0].binds, vec![SqlValue::Text("alice".to_string())]);
}

#[test]
fn iterator_reached_through_two_alias_chains_is_fully_expanded() {
    let raw = json!([
        [
            {"index": 0, "terms": {"type": "ref", "value": [var("data"), string("pets"), var("x")]}},
            {"index": 1, "terms": [op("eq"), {"type": "ref", "value": [var("x"), string("kind")]}, string("dog")]},
            {"index": 2, "terms": [op("eq"), {"type": "ref", "value": [var("data"), string("pets"), var("x"), string("name")]}, string("rex")]},
            {"index": 3, "terms": [op("neq"), {"type": "ref", "value": [var("x"), string("owner")]}, {"type": "null"}]}
        ]
    ]);

    let normalized = RefPreprocessor::new()
        .process(bodies(raw))
        .expect("normalizes");
    let rendered = normalized[0]
        .iter()
        .map(|expr| expr.to_string())
        .collect::<Vec<_>>();
    assert_eq!(
        rendered,
        vec![
            "data.pets",
            r#"eq(data.pets.kind, "dog")"#,
            r#"eq(data.pets.name, "rex")"#,
            "neq(data.pets.owner, null)",
        ]
    );
}

#[test]
fn self_link_in_compile_output_is_rejected() {
    let raw = json!([
        [
            {"index": 0, "terms": [
                op("eq"),
                {"type": "ref", "value": [var("data"), string("pets"), var("$01"), string("parent_id")]},
                {"type": "ref", "value": [var("data"), string("pets"), var("$02"), string("id")]}
            ]}
        ]
    ]);

    let err = RefPreprocessor::new().process(bodies(raw)).unwrap_err();
    assert!(matches!(err, PreprocessError::SelfLinkUnsupported { .. }));
    assert_eq!(err.code(), "ERR_SELF_LINK_UNSUPPORTED");
}
