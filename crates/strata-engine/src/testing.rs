// ABOUTME: In-memory reference engine used to exercise the bridge without the real query engine.
// ABOUTME: Understands introspection, :create, and the scripts the command factory emits.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use strata_core::{Engine, EngineFactory, HydrateError, WriteSink};

const META_PREFIX: &[u8] = b"rel\0";
const ROW_PREFIX: &[u8] = b"row\0";
const OPS: [&str; 6] = ["==", "!=", "<=", ">=", "<", ">"];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ColumnSpec {
    name: String,
    #[serde(rename = "type")]
    type_name: String,
    is_key: bool,
    has_default: bool,
}

/// A stored relation. Rows are keyed by the JSON text of their key columns
/// and hold every column in declaration order.
#[derive(Debug, Clone, Default)]
struct Relation {
    columns: Vec<ColumnSpec>,
    rows: BTreeMap<String, Vec<JsonValue>>,
}

impl Relation {
    fn key_count(&self) -> usize {
        self.columns.iter().filter(|c| c.is_key).count()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn headers(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }
}

struct Failure {
    code: &'static str,
    message: String,
}

fn fail<T>(code: &'static str, message: impl Into<String>) -> Result<T, Failure> {
    Err(Failure {
        code,
        message: message.into(),
    })
}

struct Rows {
    headers: Vec<String>,
    rows: Vec<Vec<JsonValue>>,
}

impl Rows {
    fn status() -> Self {
        Rows {
            headers: vec!["status".to_string()],
            rows: vec![vec![json!("OK")]],
        }
    }
}

/// A small engine double. Every storage mutation is reported to the sink as
/// a raw key/value write, so a store hydrated from those writes rebuilds the
/// same relations.
pub struct ReferenceEngine {
    relations: Mutex<BTreeMap<String, Relation>>,
    sink: WriteSink,
    run_delay: Duration,
}

impl ReferenceEngine {
    /// An engine with no relations whose writes go nowhere.
    pub fn empty() -> Self {
        Self {
            relations: Mutex::new(BTreeMap::new()),
            sink: Arc::new(|_, _| {}),
            run_delay: Duration::ZERO,
        }
    }

    /// Rebuild an engine from persisted entries.
    pub fn hydrate(
        keys: Vec<Vec<u8>>,
        values: Vec<Vec<u8>>,
        sink: WriteSink,
    ) -> Result<Self, HydrateError> {
        let mut relations = BTreeMap::new();
        let entries: Vec<_> = keys.into_iter().zip(values).collect();

        for (key, value) in &entries {
            if let Some(name) = key.strip_prefix(META_PREFIX) {
                let name = String::from_utf8(name.to_vec())
                    .map_err(|e| HydrateError(format!("relation name: {}", e)))?;
                let columns: Vec<ColumnSpec> = serde_json::from_slice(value)
                    .map_err(|e| HydrateError(format!("relation {}: {}", name, e)))?;
                relations.insert(
                    name,
                    Relation {
                        columns,
                        rows: BTreeMap::new(),
                    },
                );
            }
        }

        for (key, value) in &entries {
            if key.starts_with(META_PREFIX) {
                continue;
            }
            let rest = key
                .strip_prefix(ROW_PREFIX)
                .ok_or_else(|| HydrateError("entry with unknown prefix".to_string()))?;
            let split = rest
                .iter()
                .position(|b| *b == 0)
                .ok_or_else(|| HydrateError("row key without relation".to_string()))?;
            let name = String::from_utf8_lossy(&rest[..split]).into_owned();
            let row_key = String::from_utf8_lossy(&rest[split + 1..]).into_owned();
            let row: Vec<JsonValue> = serde_json::from_slice(value)
                .map_err(|e| HydrateError(format!("row of {}: {}", name, e)))?;
            relations
                .get_mut(&name)
                .ok_or_else(|| HydrateError(format!("row for unknown relation {}", name)))?
                .rows
                .insert(row_key, row);
        }

        Ok(Self {
            relations: Mutex::new(relations),
            sink,
            run_delay: Duration::ZERO,
        })
    }

    fn respond(result: Result<Rows, Failure>) -> String {
        match result {
            Ok(rows) => json!({"ok": true, "headers": rows.headers, "rows": rows.rows}),
            Err(f) => json!({
                "ok": false,
                "message": f.message,
                "display": f.message,
                "code": f.code,
                "severity": "error",
            }),
        }
        .to_string()
    }

    fn execute(&self, script: &str, read_only: bool) -> Result<Rows, Failure> {
        let mut relations = self.relations.lock().unwrap_or_else(PoisonError::into_inner);
        let mut last = Rows {
            headers: Vec::new(),
            rows: Vec::new(),
        };
        for statement in split_blocks(script)? {
            last = self.statement(&mut relations, statement.trim(), read_only)?;
        }
        Ok(last)
    }

    fn statement(
        &self,
        relations: &mut BTreeMap<String, Relation>,
        stmt: &str,
        read_only: bool,
    ) -> Result<Rows, Failure> {
        if stmt == "::relations" {
            return Ok(list_relations(relations));
        }
        if let Some(name) = stmt.strip_prefix("::columns ") {
            return list_columns(relations, name.trim());
        }
        if let Some(rest) = stmt.strip_prefix(":create ") {
            if read_only {
                return fail("eval::write_in_read_only", "write in read-only mode");
            }
            return self.create(relations, rest);
        }
        if let Some(rest) = stmt.strip_prefix("?[") {
            let (head, body) = rest
                .split_once(']')
                .map_or_else(|| fail("parser::pest", "unterminated head"), Ok)?;
            let head: Vec<String> = split_top_level(head, ',')
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
            let body = body.trim_start();
            if let Some(data) = body.strip_prefix("<-") {
                return self.literal(relations, &head, data, read_only);
            }
            if let Some(rule) = body.strip_prefix(":=") {
                return select(relations, &head, rule);
            }
        }
        fail("parser::unsupported", format!("unsupported script: {}", stmt))
    }

    fn create(
        &self,
        relations: &mut BTreeMap<String, Relation>,
        rest: &str,
    ) -> Result<Rows, Failure> {
        let (name, spec) = split_name_and_spec(rest)?;
        if relations.contains_key(name) {
            return fail(
                "eval::stored_relation_conflict",
                format!("stored relation {} already exists", name),
            );
        }

        let (key_part, value_part) = spec.split_once("=>").unwrap_or((spec, ""));
        let mut columns = Vec::new();
        for (part, is_key) in [(key_part, true), (value_part, false)] {
            for entry in split_top_level(part, ',') {
                let entry = entry.trim();
                if entry.is_empty() {
                    continue;
                }
                let (col, rest) = entry.split_once(':').unwrap_or((entry, "Any"));
                let mut tokens = rest.split_whitespace();
                let type_name = tokens.next().unwrap_or("Any").to_string();
                let has_default = tokens.next() == Some("default");
                columns.push(ColumnSpec {
                    name: col.trim().to_string(),
                    type_name,
                    is_key,
                    has_default,
                });
            }
        }
        if columns.is_empty() {
            return fail("parser::pest", format!("relation {} declares no columns", name));
        }

        let meta = serde_json::to_vec(&columns).unwrap_or_default();
        relations.insert(
            name.to_string(),
            Relation {
                columns,
                rows: BTreeMap::new(),
            },
        );
        (self.sink)(meta_key(name), Some(meta));
        Ok(Rows::status())
    }

    fn literal(
        &self,
        relations: &mut BTreeMap<String, Relation>,
        head: &[String],
        body: &str,
        read_only: bool,
    ) -> Result<Rows, Failure> {
        let (data, option) = match body.rfind("\n:") {
            Some(idx) => (&body[..idx], Some(body[idx + 1..].trim())),
            None => (body, None),
        };
        let rows: Vec<Vec<JsonValue>> = match serde_json::from_str(data.trim()) {
            Ok(rows) => rows,
            Err(e) => return fail("parser::pest", format!("bad literal relation: {}", e)),
        };
        if let Some(bad) = rows.iter().find(|r| r.len() != head.len()) {
            return fail(
                "eval::arity_mismatch",
                format!("row {:?} does not match head of {} columns", bad, head.len()),
            );
        }

        let Some(option) = option else {
            return Ok(Rows {
                headers: head.to_vec(),
                rows,
            });
        };
        if read_only {
            return fail("eval::write_in_read_only", "write in read-only mode");
        }

        if let Some(rest) = option.strip_prefix(":put ") {
            let (name, _) = split_name_and_spec(rest)?;
            self.upsert(relations, name, head, &rows)?;
            return Ok(Rows::status());
        }
        if let Some(rest) = option.strip_prefix(":rm ") {
            let (name, _) = split_name_and_spec(rest)?;
            let relation = lookup(relations, name)?;
            let mut positions = Vec::new();
            for col in relation.columns.iter().filter(|c| c.is_key) {
                match head.iter().position(|h| *h == col.name) {
                    Some(p) => positions.push(p),
                    None => return fail("eval::missing_key", format!("key {} not bound", col.name)),
                }
            }
            for row in &rows {
                let key: Vec<&JsonValue> = positions.iter().map(|p| &row[*p]).collect();
                let key_json = json!(key).to_string();
                relation.rows.remove(&key_json);
                (self.sink)(row_key(name, &key_json), None);
            }
            return Ok(Rows::status());
        }
        fail("parser::unsupported", format!("unsupported option: {}", option))
    }

    fn upsert(
        &self,
        relations: &mut BTreeMap<String, Relation>,
        name: &str,
        head: &[String],
        rows: &[Vec<JsonValue>],
    ) -> Result<(), Failure> {
        let relation = lookup(relations, name)?;
        let mut positions = Vec::with_capacity(relation.columns.len());
        for col in &relation.columns {
            match head.iter().position(|h| *h == col.name) {
                Some(p) => positions.push(p),
                None => {
                    return fail(
                        "eval::missing_column",
                        format!("column {} of {} not bound", col.name, name),
                    );
                }
            }
        }

        let key_count = relation.key_count();
        for row in rows {
            let full: Vec<JsonValue> = positions.iter().map(|p| row[*p].clone()).collect();
            let key_json = json!(&full[..key_count]).to_string();
            let encoded = json!(full).to_string().into_bytes();
            relation.rows.insert(key_json.clone(), full);
            (self.sink)(row_key(name, &key_json), Some(encoded));
        }
        Ok(())
    }
}

impl Engine for ReferenceEngine {
    fn run(&self, script: &str, params: &str, read_only: bool) -> String {
        if !self.run_delay.is_zero() {
            std::thread::sleep(self.run_delay);
        }
        if !params.trim().is_empty()
            && !matches!(serde_json::from_str::<JsonValue>(params), Ok(JsonValue::Object(_)))
        {
            return Self::respond(fail("parser::params", "params argument is not a JSON map"));
        }
        Self::respond(self.execute(script, read_only))
    }

    fn export(&self, relations_csv: &str) -> String {
        let relations = self.relations.lock().unwrap_or_else(PoisonError::into_inner);
        let mut data = serde_json::Map::new();
        for name in relations_csv.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            let Some(relation) = relations.get(name) else {
                return json!({"ok": false, "message": format!("relation {} not found", name)})
                    .to_string();
            };
            let rows: Vec<_> = relation.rows.values().cloned().collect();
            data.insert(
                name.to_string(),
                json!({"headers": relation.headers(), "rows": rows}),
            );
        }
        json!({"ok": true, "data": data}).to_string()
    }

    fn import(&self, data: &str) -> String {
        #[derive(Deserialize)]
        struct Payload {
            headers: Vec<String>,
            rows: Vec<Vec<JsonValue>>,
        }

        let parsed: BTreeMap<String, Payload> = match serde_json::from_str(data) {
            Ok(p) => p,
            Err(e) => return json!({"ok": false, "message": e.to_string()}).to_string(),
        };
        let mut relations = self.relations.lock().unwrap_or_else(PoisonError::into_inner);
        for (name, payload) in parsed {
            if let Err(f) = self.upsert(&mut relations, &name, &payload.headers, &payload.rows) {
                return json!({"ok": false, "message": f.message}).to_string();
            }
        }
        json!({"ok": true}).to_string()
    }
}

/// Factory that hydrates [`ReferenceEngine`]s and counts how often it did.
#[derive(Default)]
pub struct ReferenceEngineFactory {
    hydrations: AtomicUsize,
    run_delay: Duration,
}

impl ReferenceEngineFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `run` block the calling thread for `delay`, to imitate a
    /// long-running query.
    pub fn with_run_delay(mut self, delay: Duration) -> Self {
        self.run_delay = delay;
        self
    }

    pub fn hydrations(&self) -> usize {
        self.hydrations.load(Ordering::SeqCst)
    }
}

impl EngineFactory for ReferenceEngineFactory {
    fn hydrate(
        &self,
        keys: Vec<Vec<u8>>,
        values: Vec<Vec<u8>>,
        sink: WriteSink,
    ) -> Result<Arc<dyn Engine>, HydrateError> {
        self.hydrations.fetch_add(1, Ordering::SeqCst);
        let mut engine = ReferenceEngine::hydrate(keys, values, sink)?;
        engine.run_delay = self.run_delay;
        Ok(Arc::new(engine))
    }
}

fn meta_key(name: &str) -> Vec<u8> {
    [META_PREFIX, name.as_bytes()].concat()
}

fn row_key(name: &str, key_json: &str) -> Vec<u8> {
    [ROW_PREFIX, name.as_bytes(), b"\0", key_json.as_bytes()].concat()
}

fn lookup<'r>(
    relations: &'r mut BTreeMap<String, Relation>,
    name: &str,
) -> Result<&'r mut Relation, Failure> {
    match relations.get_mut(name) {
        Some(r) => Ok(r),
        None => fail(
            "query::relation_not_found",
            format!("cannot find requested stored relation '{}'", name),
        ),
    }
}

fn list_relations(relations: &BTreeMap<String, Relation>) -> Rows {
    let rows = relations
        .iter()
        .map(|(name, rel)| {
            let n_keys = rel.key_count();
            vec![
                json!(name),
                json!(rel.columns.len()),
                json!("normal"),
                json!(n_keys),
                json!(rel.columns.len() - n_keys),
                json!(0),
                json!(0),
                json!(0),
            ]
        })
        .collect();
    Rows {
        headers: [
            "name",
            "arity",
            "access_level",
            "n_keys",
            "n_non_keys",
            "n_put_triggers",
            "n_rm_triggers",
            "n_replace_triggers",
        ]
        .map(String::from)
        .to_vec(),
        rows,
    }
}

fn list_columns(relations: &BTreeMap<String, Relation>, name: &str) -> Result<Rows, Failure> {
    let Some(relation) = relations.get(name) else {
        return fail(
            "query::relation_not_found",
            format!("cannot find requested stored relation '{}'", name),
        );
    };
    // Keys come first, matching how the index is assigned.
    let ordered = relation
        .columns
        .iter()
        .filter(|c| c.is_key)
        .chain(relation.columns.iter().filter(|c| !c.is_key));
    let rows = ordered
        .enumerate()
        .map(|(idx, c)| {
            vec![
                json!(c.name),
                json!(c.is_key),
                json!(idx),
                json!(c.type_name),
                json!(c.has_default),
            ]
        })
        .collect();
    Ok(Rows {
        headers: ["column", "is_key", "index", "type", "has_default"]
            .map(String::from)
            .to_vec(),
        rows,
    })
}

fn select(
    relations: &BTreeMap<String, Relation>,
    head: &[String],
    rule: &str,
) -> Result<Rows, Failure> {
    let parts = split_top_level(rule.trim(), ',');
    let Some(atom) = parts.first().and_then(|p| p.trim().strip_prefix('*')) else {
        return fail("parser::unsupported", "rule body must start with a stored relation");
    };
    let (name, spec) = split_name_and_spec(atom)?;
    let Some(relation) = relations.get(name) else {
        return fail(
            "query::relation_not_found",
            format!("cannot find requested stored relation '{}'", name),
        );
    };

    let mut bound = BTreeMap::new();
    for col in split_top_level(spec, ',') {
        let col = col.trim();
        match relation.position(col) {
            Some(p) => {
                bound.insert(col.to_string(), p);
            }
            None => return fail("eval::unknown_column", format!("{} has no column {}", name, col)),
        }
    }

    let mut conditions = Vec::new();
    for part in &parts[1..] {
        conditions.push(parse_condition(part.trim(), &bound)?);
    }

    let mut projection = Vec::with_capacity(head.len());
    for col in head {
        match bound.get(col) {
            Some(p) => projection.push(*p),
            None => return fail("eval::unbound_symbol", format!("symbol {} is unbound", col)),
        }
    }

    let rows = relation
        .rows
        .values()
        .filter(|row| {
            conditions
                .iter()
                .all(|(pos, op, lit)| holds(compare(&row[*pos], lit), op))
        })
        .map(|row| projection.iter().map(|p| row[*p].clone()).collect())
        .collect();

    Ok(Rows {
        headers: head.to_vec(),
        rows,
    })
}

fn parse_condition(
    text: &str,
    bound: &BTreeMap<String, usize>,
) -> Result<(usize, &'static str, JsonValue), Failure> {
    let found = text
        .char_indices()
        .find_map(|(i, _)| OPS.iter().find(|op| text[i..].starts_with(**op)).map(|op| (i, *op)));
    let Some((idx, op)) = found else {
        return fail("parser::unsupported", format!("unsupported condition: {}", text));
    };
    let column = text[..idx].trim();
    let Some(pos) = bound.get(column) else {
        return fail("eval::unbound_symbol", format!("symbol {} is unbound", column));
    };
    match serde_json::from_str(text[idx + op.len()..].trim()) {
        Ok(literal) => Ok((*pos, op, literal)),
        Err(_) => fail("parser::unsupported", format!("unsupported condition: {}", text)),
    }
}

fn compare(a: &JsonValue, b: &JsonValue) -> Option<CmpOrdering> {
    match (a, b) {
        (JsonValue::Number(x), JsonValue::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (JsonValue::String(x), JsonValue::String(y)) => Some(x.cmp(y)),
        (JsonValue::Bool(x), JsonValue::Bool(y)) => Some(x.cmp(y)),
        (JsonValue::Null, JsonValue::Null) => Some(CmpOrdering::Equal),
        _ => None,
    }
}

fn holds(ordering: Option<CmpOrdering>, op: &str) -> bool {
    match (ordering, op) {
        (None, "!=") => true,
        (None, _) => false,
        (Some(o), "==") => o == CmpOrdering::Equal,
        (Some(o), "!=") => o != CmpOrdering::Equal,
        (Some(o), "<") => o == CmpOrdering::Less,
        (Some(o), "<=") => o != CmpOrdering::Greater,
        (Some(o), ">") => o == CmpOrdering::Greater,
        (Some(o), ">=") => o != CmpOrdering::Less,
        _ => false,
    }
}

/// `name {spec}` into its name and the text between the outer braces.
fn split_name_and_spec(text: &str) -> Result<(&str, &str), Failure> {
    let (Some(open), Some(close)) = (text.find('{'), text.rfind('}')) else {
        return fail("parser::pest", format!("expected `name {{...}}`: {}", text));
    };
    let name = text[..open].trim();
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '.');
    if !valid || close < open {
        return fail("parser::pest", format!("invalid relation reference: {}", text));
    }
    Ok((name, &text[open + 1..close]))
}

/// Split a script into top-level `{ ... }` blocks, or return it whole when
/// it is a single bare statement.
fn split_blocks(script: &str) -> Result<Vec<&str>, Failure> {
    let script = script.trim();
    if !script.starts_with('{') {
        return Ok(vec![script]);
    }

    let mut blocks = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in script.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = i + 1;
                }
                depth += 1;
            }
            '}' => {
                if depth == 0 {
                    return fail("parser::pest", "unbalanced braces");
                }
                depth -= 1;
                if depth == 0 {
                    blocks.push(&script[start..i]);
                }
            }
            c if depth == 0 && !c.is_whitespace() => {
                return fail("parser::pest", "text outside of statement blocks");
            }
            _ => {}
        }
    }
    if depth != 0 {
        return fail("parser::pest", "unbalanced braces");
    }
    Ok(blocks)
}

/// Split on `sep` outside of string literals and brackets.
fn split_top_level(text: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' | '{' | '(' => depth += 1,
            ']' | '}' | ')' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&text[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&text[start..]);
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_ok(engine: &ReferenceEngine, script: &str) -> JsonValue {
        let out: JsonValue = serde_json::from_str(&engine.run(script, "{}", false)).unwrap();
        assert_eq!(out["ok"], json!(true), "script failed: {} -> {}", script, out);
        out
    }

    #[test]
    fn create_put_and_select_with_condition() {
        let engine = ReferenceEngine::empty();
        run_ok(&engine, ":create t1 {id: Int => name: String}");
        run_ok(&engine, "?[id, name] <- [[1, \"a\"], [2, \"b, c\"]]\n:put t1 {id => name}");

        let out = run_ok(&engine, "?[id, name] := *t1{id, name}, id > 1");
        assert_eq!(out["rows"], json!([[2, "b, c"]]));
    }

    #[test]
    fn rm_deletes_by_key() {
        let engine = ReferenceEngine::empty();
        run_ok(&engine, ":create t1 {id: Int => name: String}");
        run_ok(&engine, "?[id, name] <- [[1, \"a\"], [2, \"b\"]]\n:put t1 {id => name}");
        run_ok(&engine, "?[id] <- [[1]]\n:rm t1 {id}");

        let out = run_ok(&engine, "?[id, name] := *t1{id, name}");
        assert_eq!(out["rows"], json!([[2, "b"]]));
    }

    #[test]
    fn unknown_relation_is_reported_as_failure() {
        let engine = ReferenceEngine::empty();
        let out: JsonValue =
            serde_json::from_str(&engine.run("?[a] := *nope{a}", "{}", true)).unwrap();
        assert_eq!(out["ok"], json!(false));
        assert_eq!(out["code"], json!("query::relation_not_found"));
    }

    #[test]
    fn read_only_rejects_writes() {
        let engine = ReferenceEngine::empty();
        let out: JsonValue =
            serde_json::from_str(&engine.run(":create t {a: Int}", "{}", true)).unwrap();
        assert_eq!(out["ok"], json!(false));
    }

    #[test]
    fn writes_reported_to_sink_rehydrate_the_same_relations() {
        let log: Arc<Mutex<BTreeMap<Vec<u8>, Vec<u8>>>> = Arc::default();
        let sink_log = Arc::clone(&log);
        let sink: WriteSink = Arc::new(move |k, v| {
            let mut log = sink_log.lock().unwrap();
            match v {
                Some(v) => {
                    log.insert(k, v);
                }
                None => {
                    log.remove(&k);
                }
            }
        });

        let engine = ReferenceEngine::hydrate(Vec::new(), Vec::new(), sink).unwrap();
        run_ok(&engine, ":create t1 {id: Int => name: String}");
        run_ok(&engine, "?[id, name] <- [[1, \"a\"], [2, \"b\"]]\n:put t1 {id => name}");
        run_ok(&engine, "?[id] <- [[2]]\n:rm t1 {id}");

        let (keys, values): (Vec<_>, Vec<_>) = log.lock().unwrap().clone().into_iter().unzip();
        let rebuilt = ReferenceEngine::hydrate(keys, values, Arc::new(|_, _| {})).unwrap();
        let out = run_ok(&rebuilt, "?[id, name] := *t1{id, name}");
        assert_eq!(out["rows"], json!([[1, "a"]]));
    }

    #[test]
    fn export_then_import_into_fresh_engine() {
        let source = ReferenceEngine::empty();
        run_ok(&source, ":create t1 {id: Int => name: String}");
        run_ok(&source, "?[id, name] <- [[1, \"a\"]]\n:put t1 {id => name}");
        let exported: JsonValue = serde_json::from_str(&source.export("t1")).unwrap();

        let target = ReferenceEngine::empty();
        run_ok(&target, ":create t1 {id: Int => name: String}");
        let status: JsonValue =
            serde_json::from_str(&target.import(&exported["data"].to_string())).unwrap();
        assert_eq!(status["ok"], json!(true));
        let out = run_ok(&target, "?[id, name] := *t1{id, name}");
        assert_eq!(out["rows"], json!([[1, "a"]]));
    }

    #[test]
    fn split_top_level_respects_strings_and_braces() {
        let parts = split_top_level(r#"*t{a, b}, a == "x, y", b > 2"#, ',');
        assert_eq!(parts, vec!["*t{a, b}", r#" a == "x, y""#, " b > 2"]);
    }
}
