//! Schema-driven planning.
//!
//! Compares prior state with the proposed configuration attribute by
//! attribute. A change to any `force_new` attribute or block turns the plan
//! into a replacement; every other change is applied in place by `update`.

use serde_json::{Map, Value};

use crate::schema::{AttributeType, BlockNestingMode, Schema};
use crate::types::{AttributeChange, PlanResult};

/// Plan the transition from `prior` to `proposed`.
///
/// - `prior == None` plans a create.
/// - `proposed == Value::Null` plans a destroy.
/// - Defaults are applied to the proposal, and computed attributes the
///   proposal leaves unset keep their prior value unless the plan replaces the
///   resource.
pub fn plan_resource(schema: &Schema, prior: Option<&Value>, proposed: &Value) -> PlanResult {
    if proposed.is_null() {
        return plan_destroy(schema, prior);
    }

    let mut planned = proposed.clone();
    schema.apply_defaults(&mut planned);
    let empty = Map::new();
    let planned_obj = planned.as_object().unwrap_or(&empty);
    let prior_obj = prior.and_then(Value::as_object);

    let mut changes = Vec::new();
    let mut requires_replace = false;

    for (name, attr) in &schema.block.attributes {
        if attr.flags.is_computed_only() {
            continue;
        }
        let after = non_null(planned_obj.get(name));
        if after.is_none() && attr.flags.computed {
            // Left to the provider; whatever it last reported stands
            continue;
        }
        let is_set = matches!(attr.attr_type, AttributeType::Set(_));
        let before = prior_obj.and_then(|p| non_null(p.get(name)));
        let Some(mut change) = diff_value(name, before, after, is_set) else {
            continue;
        };
        if prior_obj.is_some() && attr.force_new {
            change = change.forcing_replacement();
            requires_replace = true;
        }
        if attr.flags.sensitive {
            change = change.masked();
        }
        changes.push(change);
    }

    for (name, nested) in &schema.block.blocks {
        let is_set = nested.nesting_mode == BlockNestingMode::Set;
        let before = prior_obj.and_then(|p| non_empty_array(p.get(name)));
        let after = non_empty_array(planned_obj.get(name));
        let Some(mut change) = diff_value(name, before, after, is_set) else {
            continue;
        };
        if prior_obj.is_some() && nested.force_new {
            change = change.forcing_replacement();
            requires_replace = true;
        }
        changes.push(change);
    }

    changes.sort_by(|a, b| a.path.cmp(&b.path));

    if let (Some(prior_obj), false) = (prior_obj, requires_replace) {
        carry_computed(schema, prior_obj, &mut planned);
    }

    if changes.is_empty() && prior.is_some() {
        PlanResult::no_change(planned)
    } else {
        PlanResult::with_changes(planned, changes, requires_replace)
    }
}

fn plan_destroy(schema: &Schema, prior: Option<&Value>) -> PlanResult {
    let Some(prior_obj) = prior.and_then(Value::as_object) else {
        return PlanResult::no_change(Value::Null);
    };
    let mut changes: Vec<AttributeChange> = prior_obj
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(name, v)| {
            let change = AttributeChange::removed(name.clone(), v.clone());
            match schema.block.attributes.get(name) {
                Some(attr) if attr.flags.sensitive => change.masked(),
                _ => change,
            }
        })
        .collect();
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    PlanResult::with_changes(Value::Null, changes, false)
}

fn carry_computed(schema: &Schema, prior: &Map<String, Value>, planned: &mut Value) {
    let Value::Object(planned) = planned else {
        return;
    };
    for (name, attr) in &schema.block.attributes {
        if !attr.flags.computed {
            continue;
        }
        if non_null(planned.get(name)).is_some() {
            continue;
        }
        if let Some(v) = non_null(prior.get(name)) {
            planned.insert(name.clone(), v.clone());
        }
    }
}

fn diff_value(
    name: &str,
    before: Option<&Value>,
    after: Option<&Value>,
    is_set: bool,
) -> Option<AttributeChange> {
    match (before, after) {
        (None, None) => None,
        (None, Some(a)) => Some(AttributeChange::added(name, a.clone())),
        (Some(b), None) => Some(AttributeChange::removed(name, b.clone())),
        (Some(b), Some(a)) => {
            let same = if is_set {
                normalize_set(b) == normalize_set(a)
            } else {
                b == a
            };
            (!same).then(|| AttributeChange::modified(name, b.clone(), a.clone()))
        },
    }
}

fn non_null(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn non_empty_array(value: Option<&Value>) -> Option<&Value> {
    non_null(value).filter(|v| v.as_array().map_or(true, |a| !a.is_empty()))
}

fn normalize_set(value: &Value) -> Vec<String> {
    let mut items: Vec<String> = match value.as_array() {
        Some(items) => items.iter().map(Value::to_string).collect(),
        None => vec![value.to_string()],
    };
    items.sort();
    items.dedup();
    items
}
