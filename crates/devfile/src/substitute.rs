use std::collections::{BTreeMap, BTreeSet};

use lazy_static::lazy_static;
use regex::{Captures, Regex};
use serde_yaml::Value;

lazy_static! {
    static ref VARIABLE_REF: Regex = Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").unwrap();
}

/// Replaces `${NAME}` references in every string scalar of `document`
///
/// References to undefined variables are left untouched. Their names are returned so the caller can warn about them.
pub fn substitute_variables(document: &mut Value, variables: &BTreeMap<String, String>) -> BTreeSet<String> {
    let mut unresolved = BTreeSet::new();
    substitute_value(document, variables, &mut unresolved);
    unresolved
}

fn substitute_value(value: &mut Value, variables: &BTreeMap<String, String>, unresolved: &mut BTreeSet<String>) {
    match value {
        Value::String(s) => {
            if !s.contains("${") {
                return;
            }
            let replaced = VARIABLE_REF.replace_all(s, |captures: &Captures| {
                let name = &captures[1];
                match variables.get(name) {
                    Some(value) => value.clone(),
                    None => {
                        unresolved.insert(name.to_owned());
                        captures[0].to_owned()
                    }
                }
            });
            *s = replaced.into_owned();
        }
        Value::Sequence(items) => {
            for item in items {
                substitute_value(item, variables, unresolved);
            }
        }
        Value::Mapping(mapping) => {
            for (_, item) in mapping.iter_mut() {
                substitute_value(item, variables, unresolved);
            }
        }
        _ => {}
    }
}
