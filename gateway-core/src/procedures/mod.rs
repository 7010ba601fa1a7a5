//! Procedures (§4.9): declarative step programs stored server-side and
//! interpreted against the Store and RuleEngine.

pub mod template;

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::rules::RuleEngine;
use crate::store::{Store, TxOp};

/// One declarative step. Represented as one flexible struct rather than a
/// tagged enum per action — the field set a step uses depends on `action`,
/// and procedures are data, not Rust types, so this mirrors how they're
/// actually authored (a JSON document, not compiled code).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub action: String,
    #[serde(default)]
    pub bucket: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub filter: Option<Value>,
    #[serde(default, rename = "as")]
    pub as_: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub then: Vec<Step>,
    #[serde(default)]
    pub r#else: Vec<Step>,
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub r#ref: String,
    pub operator: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Procedure {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub transaction: bool,
}

#[derive(Default)]
pub struct ProcedureRegistry {
    procedures: DashMap<String, Arc<Procedure>>,
}

impl ProcedureRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, procedure: Procedure) -> Result<()> {
        if procedure.steps.is_empty() {
            return Err(Error::Validation("steps must not be empty".to_string()));
        }
        if self.procedures.contains_key(&procedure.name) {
            return Err(Error::AlreadyExists(procedure.name));
        }
        self.procedures.insert(procedure.name.clone(), Arc::new(procedure));
        Ok(())
    }

    pub fn unregister(&self, name: &str) -> Result<()> {
        self.procedures.remove(name).map(|_| ()).ok_or_else(|| Error::NotFound(name.to_string()))
    }

    pub fn update(&self, name: &str, patch: Value) -> Result<Arc<Procedure>> {
        let mut entry = self.procedures.get_mut(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
        let mut current = serde_json::to_value(entry.as_ref().clone()).unwrap_or(json!({}));
        if let (Some(dst), Some(src)) = (current.as_object_mut(), patch.as_object()) {
            for (k, v) in src {
                dst.insert(k.clone(), v.clone());
            }
        }
        let updated: Procedure = serde_json::from_value(current).map_err(|e| Error::Validation(e.to_string()))?;
        let result = Arc::new(updated);
        *entry = result.clone();
        Ok(result)
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<Procedure>> {
        self.procedures.get(name).map(|p| p.clone())
    }

    #[must_use]
    pub fn list(&self) -> Vec<Value> {
        self.procedures
            .iter()
            .map(|e| {
                let p = e.value();
                json!({ "name": p.name, "description": p.description, "stepsCount": p.steps.len() })
            })
            .collect()
    }
}

/// Recursively check `value` against a small JSON-Schema-like subset
/// (`type`, `required`, `properties`, `items`) — enough to catch a
/// malformed call before any step runs, not a general-purpose validator.
fn validate_against_schema(schema: &Value, value: &Value, path: &str) -> Result<()> {
    let Some(schema_type) = schema.get("type").and_then(Value::as_str) else { return Ok(()) };
    let matches_type = match schema_type {
        "object" => value.is_object(),
        "array" => value.is_array(),
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "null" => value.is_null(),
        _ => true,
    };
    if !matches_type {
        return Err(Error::Validation(format!("{path} must be of type {schema_type}")));
    }

    if schema_type == "object" {
        if let Some(required) = schema.get("required").and_then(Value::as_array) {
            for name in required.iter().filter_map(Value::as_str) {
                if value.get(name).is_none() {
                    return Err(Error::Validation(format!("{path} is missing required field `{name}`")));
                }
            }
        }
        if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
            for (name, sub_schema) in properties {
                if let Some(sub_value) = value.get(name) {
                    validate_against_schema(sub_schema, sub_value, &format!("{path}.{name}"))?;
                }
            }
        }
    }

    if schema_type == "array" {
        if let Some(item_schema) = schema.get("items") {
            for (index, item) in value.as_array().into_iter().flatten().enumerate() {
                validate_against_schema(item_schema, item, &format!("{path}[{index}]"))?;
            }
        }
    }

    Ok(())
}

/// Run `procedure` against `input`, returning `{success, results, result?}`
/// on success or propagating the first step's error on failure. Validates
/// `input` against the procedure's declared input schema first, if any
/// (§4.9).
pub async fn call(store: &dyn Store, rules: Option<&dyn RuleEngine>, procedure: &Procedure, input: Value) -> Result<Value> {
    if let Some(schema) = &procedure.input {
        validate_against_schema(schema, &input, "input")?;
    }

    let mut bindings: Map<String, Value> = Map::new();
    let mut tx_ops: Vec<TxOp> = Vec::new();
    let mut shadow: HashMap<String, Vec<Value>> = HashMap::new();
    let mut return_value: Option<Value> = None;

    if procedure.transaction {
        for step in &procedure.steps {
            run_step_staged(store, &mut shadow, step, &mut bindings, &input, &mut tx_ops, &mut return_value).await?;
            if return_value.is_some() {
                break;
            }
        }
        store.transaction(tx_ops).await?;
    } else {
        for step in &procedure.steps {
            run_step_live(store, rules, step, &mut bindings, &input, &mut return_value).await?;
            if return_value.is_some() {
                break;
            }
        }
    }

    let mut result = json!({ "success": true, "results": Value::Object(bindings) });
    if let Some(value) = return_value {
        result["result"] = value;
    }
    Ok(result)
}

fn context(input: &Value, bindings: &Map<String, Value>) -> Value {
    let mut ctx = Map::new();
    ctx.insert("input".to_string(), input.clone());
    for (k, v) in bindings {
        ctx.insert(k.clone(), v.clone());
    }
    Value::Object(ctx)
}

fn evaluate_condition(condition: &Condition, ctx: &Value) -> bool {
    let Some(left) = template::lookup(ctx, &condition.r#ref) else { return false };
    match condition.operator.as_str() {
        "eq" => left == condition.value,
        "neq" => left != condition.value,
        "gt" | "gte" | "lt" | "lte" => {
            let (Some(l), Some(r)) = (left.as_f64(), condition.value.as_f64()) else { return false };
            match condition.operator.as_str() {
                "gt" => l > r,
                "gte" => l >= r,
                "lt" => l < r,
                "lte" => l <= r,
                _ => unreachable!(),
            }
        }
        _ => false,
    }
}

fn aggregate(source: &[Value], field: &str, op: &str) -> Value {
    let values: Vec<f64> = source.iter().filter_map(|v| v.get(field).and_then(Value::as_f64)).collect();
    match op {
        "sum" => json!(values.iter().sum::<f64>()),
        "avg" => {
            if values.is_empty() {
                json!(0.0)
            } else {
                json!(values.iter().sum::<f64>() / values.len() as f64)
            }
        }
        "min" => json!(values.iter().cloned().fold(f64::INFINITY, f64::min)),
        "max" => json!(values.iter().cloned().fold(f64::NEG_INFINITY, f64::max)),
        "count" => json!(source.len()),
        _ => Value::Null,
    }
}

/// Non-transactional execution: each store op hits the live Store directly.
async fn run_step_live(
    store: &dyn Store,
    rules: Option<&dyn RuleEngine>,
    step: &Step,
    bindings: &mut Map<String, Value>,
    input: &Value,
    return_value: &mut Option<Value>,
) -> Result<()> {
    let ctx = context(input, bindings);
    let resolved_data = step.data.as_ref().map(|d| template::resolve(d, &ctx));
    let resolved_id = step.id.as_ref().map(|d| template::resolve(d, &ctx));
    let resolved_filter = step.filter.as_ref().map(|d| template::resolve(d, &ctx));

    let result = match step.action.as_str() {
        "store.get" => {
            let bucket = bucket_name(step)?;
            let id = as_str(&resolved_id, "id")?;
            store.get(&bucket, &id).await?.unwrap_or(Value::Null)
        }
        "store.where" => {
            let bucket = bucket_name(step)?;
            Value::Array(store.where_matching(&bucket, resolved_filter.unwrap_or(json!({}))).await?)
        }
        "store.findOne" => {
            let bucket = bucket_name(step)?;
            store.find_one(&bucket, resolved_filter.unwrap_or(json!({}))).await?.unwrap_or(Value::Null)
        }
        "store.all" => Value::Array(store.all(&bucket_name(step)?).await?),
        "store.count" => json!(store.count(&bucket_name(step)?, resolved_filter).await?),
        "store.insert" => store.insert(&bucket_name(step)?, resolved_data.unwrap_or(json!({}))).await?,
        "store.update" => {
            let bucket = bucket_name(step)?;
            let id = as_str(&resolved_id, "id")?;
            store.update(&bucket, &id, resolved_data.unwrap_or(json!({}))).await?
        }
        "store.delete" => {
            let bucket = bucket_name(step)?;
            let id = as_str(&resolved_id, "id")?;
            store.delete(&bucket, &id).await?;
            Value::Null
        }
        "rules.emit" => {
            let Some(engine) = rules else { return Err(Error::RulesNotAvailable) };
            let topic = step.topic.clone().unwrap_or_default();
            engine.emit(&topic, resolved_data.unwrap_or(Value::Null), None).await?;
            Value::Null
        }
        "aggregate" => {
            let source_name = step.source.clone().unwrap_or_default();
            let source = bindings.get(&source_name).and_then(Value::as_array).cloned().unwrap_or_default();
            aggregate(&source, step.field.as_deref().unwrap_or(""), step.op.as_deref().unwrap_or("count"))
        }
        "if" => {
            let Some(condition) = &step.condition else { return Err(Error::Validation("if step requires a condition".to_string())) };
            let branch = if evaluate_condition(condition, &ctx) { &step.then } else { &step.r#else };
            for inner in branch {
                Box::pin(run_step_live(store, rules, inner, bindings, input, return_value)).await?;
                if return_value.is_some() {
                    break;
                }
            }
            return Ok(());
        }
        "return" => {
            *return_value = Some(step.value.as_ref().map(|v| template::resolve(v, &ctx)).unwrap_or(Value::Null));
            return Ok(());
        }
        other => return Err(Error::Validation(format!("unknown procedure step action: {other}"))),
    };

    if let Some(name) = &step.as_ {
        bindings.insert(name.clone(), result);
    }
    Ok(())
}

/// Transactional execution: reads/writes apply to a local shadow of each
/// referenced bucket (seeded lazily from the live Store) so steps see each
/// other's writes; nothing reaches the Store until every step succeeds, at
/// which point the accumulated `TxOp`s commit atomically in one shot.
#[allow(clippy::too_many_arguments)]
async fn run_step_staged(
    store: &dyn Store,
    shadow: &mut HashMap<String, Vec<Value>>,
    step: &Step,
    bindings: &mut Map<String, Value>,
    input: &Value,
    tx_ops: &mut Vec<TxOp>,
    return_value: &mut Option<Value>,
) -> Result<()> {
    let ctx = context(input, bindings);
    let resolved_data = step.data.as_ref().map(|d| template::resolve(d, &ctx));
    let resolved_id = step.id.as_ref().map(|d| template::resolve(d, &ctx));
    let resolved_filter = step.filter.as_ref().map(|d| template::resolve(d, &ctx));

    async fn ensure_loaded(store: &dyn Store, shadow: &mut HashMap<String, Vec<Value>>, bucket: &str) -> Result<()> {
        if !shadow.contains_key(bucket) {
            shadow.insert(bucket.to_string(), store.all(bucket).await?);
        }
        Ok(())
    }

    let result = match step.action.as_str() {
        "store.get" => {
            let bucket = bucket_name(step)?;
            ensure_loaded(store, shadow, &bucket).await?;
            let id = as_str(&resolved_id, "id")?;
            shadow[&bucket].iter().find(|r| r.get("id").and_then(Value::as_str) == Some(id.as_str())).cloned().unwrap_or(Value::Null)
        }
        "store.where" => {
            let bucket = bucket_name(step)?;
            ensure_loaded(store, shadow, &bucket).await?;
            let filter = resolved_filter.unwrap_or(json!({}));
            let filter_obj = filter.as_object().cloned().unwrap_or_default();
            Value::Array(
                shadow[&bucket]
                    .iter()
                    .filter(|r| filter_obj.iter().all(|(k, v)| r.get(k) == Some(v)))
                    .cloned()
                    .collect(),
            )
        }
        "store.all" => {
            let bucket = bucket_name(step)?;
            ensure_loaded(store, shadow, &bucket).await?;
            Value::Array(shadow[&bucket].clone())
        }
        "store.insert" => {
            let bucket = bucket_name(step)?;
            ensure_loaded(store, shadow, &bucket).await?;
            let mut data = resolved_data.unwrap_or(json!({}));
            let id = uuid::Uuid::new_v4().to_string();
            if let Some(obj) = data.as_object_mut() {
                obj.insert("id".to_string(), json!(id));
                obj.insert("_version".to_string(), json!(1));
            }
            shadow.get_mut(&bucket).unwrap().push(data.clone());
            tx_ops.push(TxOp::Insert { bucket, data: data.clone() });
            data
        }
        "store.update" => {
            let bucket = bucket_name(step)?;
            ensure_loaded(store, shadow, &bucket).await?;
            let id = as_str(&resolved_id, "id")?;
            let data = resolved_data.unwrap_or(json!({}));
            let records = shadow.get_mut(&bucket).unwrap();
            let record = records
                .iter_mut()
                .find(|r| r.get("id").and_then(Value::as_str) == Some(id.as_str()))
                .ok_or_else(|| Error::NotFound(format!("{bucket}/{id}")))?;
            if let (Some(dst), Some(src)) = (record.as_object_mut(), data.as_object()) {
                for (k, v) in src {
                    dst.insert(k.clone(), v.clone());
                }
            }
            tx_ops.push(TxOp::Update { bucket, id, data });
            record.clone()
        }
        "store.delete" => {
            let bucket = bucket_name(step)?;
            ensure_loaded(store, shadow, &bucket).await?;
            let id = as_str(&resolved_id, "id")?;
            let records = shadow.get_mut(&bucket).unwrap();
            let before = records.len();
            records.retain(|r| r.get("id").and_then(Value::as_str) != Some(id.as_str()));
            if records.len() == before {
                return Err(Error::NotFound(format!("{bucket}/{id}")));
            }
            tx_ops.push(TxOp::Delete { bucket, id });
            Value::Null
        }
        "aggregate" => {
            let source_name = step.source.clone().unwrap_or_default();
            let source = bindings.get(&source_name).and_then(Value::as_array).cloned().unwrap_or_default();
            aggregate(&source, step.field.as_deref().unwrap_or(""), step.op.as_deref().unwrap_or("count"))
        }
        "if" => {
            let Some(condition) = &step.condition else { return Err(Error::Validation("if step requires a condition".to_string())) };
            let branch = if evaluate_condition(condition, &ctx) { &step.then } else { &step.r#else };
            for inner in branch {
                Box::pin(run_step_staged(store, shadow, inner, bindings, input, tx_ops, return_value)).await?;
                if return_value.is_some() {
                    break;
                }
            }
            return Ok(());
        }
        "return" => {
            *return_value = Some(step.value.as_ref().map(|v| template::resolve(v, &ctx)).unwrap_or(Value::Null));
            return Ok(());
        }
        "rules.emit" => return Err(Error::Validation("rules.emit is not supported inside a transaction".to_string())),
        other => return Err(Error::Validation(format!("unknown procedure step action: {other}"))),
    };

    if let Some(name) = &step.as_ {
        bindings.insert(name.clone(), result);
    }
    Ok(())
}

fn bucket_name(step: &Step) -> Result<String> {
    step.bucket.clone().ok_or_else(|| Error::Validation(format!("step {} requires a bucket", step.action)))
}

fn as_str(value: &Option<Value>, field: &str) -> Result<String> {
    value
        .as_ref()
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("{field} must resolve to a string")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{BucketConfig, MemoryStore};

    #[test]
    fn register_rejects_empty_steps() {
        let registry = ProcedureRegistry::new();
        let err = registry
            .register(Procedure { name: "p".to_string(), description: None, input: None, steps: vec![], transaction: false })
            .unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ValidationError);
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let registry = ProcedureRegistry::new();
        let make = || Procedure {
            name: "p".to_string(),
            description: None,
            input: None,
            steps: vec![Step {
                action: "return".to_string(),
                bucket: None,
                id: None,
                data: None,
                filter: None,
                as_: None,
                topic: None,
                source: None,
                field: None,
                op: None,
                condition: None,
                then: vec![],
                r#else: vec![],
                value: Some(json!(1)),
            }],
            transaction: false,
        };
        registry.register(make()).unwrap();
        let err = registry.register(make()).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::AlreadyExists);
    }

    #[tokio::test]
    async fn call_runs_steps_and_returns_bound_value() {
        let store = MemoryStore::new();
        store.define_bucket("items", BucketConfig::default()).await.unwrap();
        let procedure = Procedure {
            name: "make-item".to_string(),
            description: None,
            input: None,
            steps: vec![
                Step {
                    action: "store.insert".to_string(),
                    bucket: Some("items".to_string()),
                    id: None,
                    data: Some(json!({"value": "{{ input.value }}"})),
                    filter: None,
                    as_: Some("created".to_string()),
                    topic: None,
                    source: None,
                    field: None,
                    op: None,
                    condition: None,
                    then: vec![],
                    r#else: vec![],
                    value: None,
                },
                Step {
                    action: "return".to_string(),
                    bucket: None,
                    id: None,
                    data: None,
                    filter: None,
                    as_: None,
                    topic: None,
                    source: None,
                    field: None,
                    op: None,
                    condition: None,
                    then: vec![],
                    r#else: vec![],
                    value: Some(json!("{{ created.id }}")),
                },
            ],
            transaction: false,
        };

        let output = call(&store, None, &procedure, json!({"value": 42})).await.unwrap();
        assert_eq!(output["success"], true);
        assert!(output["result"].is_string());
    }

    #[tokio::test]
    async fn call_rejects_input_failing_its_declared_schema() {
        let store = MemoryStore::new();
        let procedure = Procedure {
            name: "needs-value".to_string(),
            description: None,
            input: Some(json!({"type": "object", "required": ["value"], "properties": {"value": {"type": "number"}}})),
            steps: vec![Step {
                action: "return".to_string(),
                bucket: None,
                id: None,
                data: None,
                filter: None,
                as_: None,
                topic: None,
                source: None,
                field: None,
                op: None,
                condition: None,
                then: vec![],
                r#else: vec![],
                value: Some(json!(1)),
            }],
            transaction: false,
        };

        let err = call(&store, None, &procedure, json!({})).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ValidationError);

        let err = call(&store, None, &procedure, json!({"value": "not-a-number"})).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::ValidationError);

        call(&store, None, &procedure, json!({"value": 1})).await.unwrap();
    }

    #[tokio::test]
    async fn transactional_procedure_commits_nothing_on_failure() {
        let store = MemoryStore::new();
        store.define_bucket("products".to_string().as_str(), BucketConfig::default()).await.unwrap();
        let product = store.insert("products", json!({"stock": 5})).await.unwrap();
        let id = product["id"].as_str().unwrap().to_string();

        let procedure = Procedure {
            name: "adjust-stock".to_string(),
            description: None,
            input: None,
            steps: vec![
                Step {
                    action: "store.update".to_string(),
                    bucket: Some("products".to_string()),
                    id: Some(json!(id)),
                    data: Some(json!({"stock": 4})),
                    filter: None,
                    as_: None,
                    topic: None,
                    source: None,
                    field: None,
                    op: None,
                    condition: None,
                    then: vec![],
                    r#else: vec![],
                    value: None,
                },
                Step {
                    action: "store.delete".to_string(),
                    bucket: Some("products".to_string()),
                    id: Some(json!("missing")),
                    data: None,
                    filter: None,
                    as_: None,
                    topic: None,
                    source: None,
                    field: None,
                    op: None,
                    condition: None,
                    then: vec![],
                    r#else: vec![],
                    value: None,
                },
            ],
            transaction: true,
        };

        let err = call(&store, None, &procedure, json!({})).await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::NotFound);
        let product = store.get("products", &id).await.unwrap().unwrap();
        assert_eq!(product["stock"], 5);
    }
}
