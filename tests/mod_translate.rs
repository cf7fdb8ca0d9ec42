use bson::doc;
use flexdoc::filter::{all, and, contains, elem_match, eq, gt, gte, lt, not, or, range, text};
use flexdoc::{CompositePolicy, DbError, Filter, Translator, translate};

#[test]
fn nested_composites_keep_child_order() {
    let f = or([
        and([eq("dept", "ops"), gte("age", 30)]),
        and([eq("dept", "dev"), lt("age", 25)]),
    ]);
    assert_eq!(
        translate(&f).unwrap(),
        doc! {"$or": [
            {"$and": [{"dept": "ops"}, {"age": {"$gte": 30}}]},
            {"$and": [{"dept": "dev"}, {"age": {"$lt": 25}}]},
        ]}
    );
}

#[test]
fn element_match_inside_or() {
    let f = or([
        elem_match("dimensions", [eq("kind", "Company"), eq("value", "Kano")]),
        elem_match("dimensions", [eq("kind", "Project"), eq("value", "Y")]),
    ]);
    let q = translate(&f).unwrap();
    let branches = q.get_array("$or").unwrap();
    assert_eq!(branches.len(), 2);
    assert_eq!(
        branches[0].as_document().unwrap(),
        &doc! {"dimensions": {"$elemMatch": {"kind": "Company", "value": "Kano"}}}
    );
}

#[test]
fn permissive_policy_drops_only_the_bad_child() {
    let f = and([eq("a", 1), all("tags", 5), or([eq("b", 2), all("", vec!["x"])])]);
    assert_eq!(
        translate(&f).unwrap(),
        doc! {"$and": [{"a": 1}, {"$or": [{"b": 2}]}]}
    );
}

#[test]
fn strict_policy_surfaces_first_error() {
    let strict = Translator::new(CompositePolicy::Strict);
    let err = strict
        .translate(&and([eq("a", 1), or([eq("b", 2), all("", vec!["x"])])]))
        .unwrap_err();
    assert!(matches!(err, DbError::Precondition(_)));
}

#[test]
fn negation_forms() {
    assert_eq!(
        translate(&not(contains("name", ["bo"]))).unwrap(),
        doc! {"name": {"$not": {"$regex": ".*bo.*", "$options": "i"}}}
    );
    assert_eq!(
        translate(&not(range("age", 1, 2))).unwrap(),
        doc! {"$nor": [{"$and": [{"age": {"$gte": 1}}, {"age": {"$lte": 2}}]}]}
    );
}

#[test]
fn text_search_is_top_level() {
    assert_eq!(
        translate(&and([text("kano"), gt("score", 1)])).unwrap(),
        doc! {"$and": [{"$text": {"$search": "kano"}}, {"score": {"$gt": 1}}]}
    );
}

#[test]
fn json_filters_translate_like_built_ones() {
    let parsed = Filter::from_json(
        r#"{"op":"$or","items":[
            {"op":"$startwith","field":"name","value":"Al"},
            {"op":"$in","field":"dept","value":["ops","dev"]}
        ]}"#,
    )
    .unwrap();
    assert_eq!(
        translate(&parsed).unwrap(),
        doc! {"$or": [
            {"name": {"$regex": "^Al.*$", "$options": "i"}},
            {"dept": {"$in": ["ops", "dev"]}},
        ]}
    );
}

#[test]
fn regex_metacharacters_match_literally() {
    assert_eq!(
        translate(&contains("path", ["a+b(c)"])).unwrap(),
        doc! {"path": {"$regex": ".*a\\+b\\(c\\).*", "$options": "i"}}
    );
}

#[test]
fn json_composites_drop_unparseable_children_when_permissive() {
    let parsed = Filter::from_json(
        r#"{"op":"$and","items":[
            {"op":"$eq","field":"a","value":1},
            {"op":"$near","field":"loc","value":[0, 0]}
        ]}"#,
    )
    .unwrap();
    assert_eq!(translate(&parsed).unwrap(), doc! {"$and": [{"a": 1}]});
    let err = Translator::new(CompositePolicy::Strict).translate(&parsed).unwrap_err();
    assert!(matches!(err, DbError::UnsupportedOperator(op) if op == "$near"));

    let parsed = Filter::from_json(
        r#"{"op":"$or","items":[
            {"op":"$eq","field":"a","value":1},
            {"op":"$range","field":"b","value":[1]}
        ]}"#,
    )
    .unwrap();
    assert_eq!(translate(&parsed).unwrap(), doc! {"$or": [{"a": 1}]});
    assert!(Translator::new(CompositePolicy::Strict).translate(&parsed).unwrap_err().is_translation());

    // outside a composite the error still surfaces
    let parsed = Filter::from_json(r#"{"op":"$not","items":[{"op":"$near","field":"loc"}]}"#).unwrap();
    assert!(translate(&parsed).is_err());
}
