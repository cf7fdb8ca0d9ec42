use bson::Bson;
use flexdoc::filter::{all, and, contains, eq, gte, lte, or, range};
use flexdoc::{CompositePolicy, Translator, translate};
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_range_is_gte_and_lte(field in "[a-z]{1,8}", low in any::<i64>(), high in any::<i64>()) {
        let desugared = translate(&and([gte(&field, low), lte(&field, high)])).unwrap();
        prop_assert_eq!(translate(&range(&field, low, high)).unwrap(), desugared);
    }

    #[test]
    fn prop_contains_branches_per_needle(needles in proptest::collection::vec("[a-zA-Z0-9 .*+?]{1,6}", 1..6)) {
        let q = translate(&contains("name", needles.clone())).unwrap();
        if needles.len() == 1 {
            prop_assert!(q.get_array("$or").is_err());
            let cond = q.get_document("name").unwrap();
            prop_assert_eq!(cond.get_str("$options").unwrap(), "i");
        } else {
            let branches = q.get_array("$or").unwrap();
            prop_assert_eq!(branches.len(), needles.len());
        }
    }

    #[test]
    fn prop_escaped_needles_match_themselves(needle in "[a-z.*+?()\\[\\]|^$]{1,10}") {
        let q = translate(&contains("f", [needle.clone()])).unwrap();
        let pattern = q.get_document("f").unwrap().get_str("$regex").unwrap().to_string();
        let re = regex::RegexBuilder::new(&pattern).case_insensitive(true).build().unwrap();
        let haystack = format!("xx{needle}yy");
        prop_assert!(re.is_match(&haystack));
    }

    #[test]
    fn prop_permissive_drops_only_malformed_children(values in proptest::collection::vec(any::<i32>(), 0..8), bad_at in 0usize..8) {
        let mut children: Vec<_> = values.iter().enumerate().map(|(i, v)| eq(&format!("f{i}"), *v)).collect();
        let bad_at = bad_at.min(children.len());
        children.insert(bad_at, all("tags", Bson::Int32(1)));
        let q = Translator::new(CompositePolicy::Permissive).translate(&or(children.clone())).unwrap();
        prop_assert_eq!(q.get_array("$or").unwrap().len(), values.len());
        prop_assert!(Translator::new(CompositePolicy::Strict).translate(&or(children)).is_err());
    }
}
