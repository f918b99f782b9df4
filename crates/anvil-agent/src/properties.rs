//! Typed `server.properties` store.

use std::collections::BTreeMap;

use anvil_process::{PropertyValue, WorldGenerationSettings};

pub type Properties = BTreeMap<String, PropertyValue>;

pub const LEVEL_NAME: &str = "level-name";
pub const RAM: &str = "ram";
pub const SERVER_PORT: &str = "server-port";

/// Keys the agent reads itself and never writes to `server.properties`.
const AGENT_ONLY: [&str; 1] = [RAM];

pub fn world_level_name(world: &str) -> String {
    format!("worlds/{world}")
}

pub fn defaults(name: &str, active_world: &str) -> Properties {
    let mut p = Properties::new();
    let mut set = |k: &str, v: PropertyValue| {
        p.insert(k.to_string(), v);
    };
    set("motd", PropertyValue::Text(name.to_string()));
    set(LEVEL_NAME, PropertyValue::Text(world_level_name(active_world)));
    set(SERVER_PORT, PropertyValue::Int(25565));
    set(RAM, PropertyValue::Int(2048));
    set("max-players", PropertyValue::Int(20));
    set("difficulty", PropertyValue::Text("easy".to_string()));
    set("gamemode", PropertyValue::Text("survival".to_string()));
    set("online-mode", PropertyValue::Bool(true));
    set("pvp", PropertyValue::Bool(true));
    set("allow-flight", PropertyValue::Bool(false));
    set("allow-nether", PropertyValue::Bool(true));
    set("white-list", PropertyValue::Bool(false));
    set("generate-structures", PropertyValue::Bool(true));
    set("level-seed", PropertyValue::Text(String::new()));
    set("level-type", PropertyValue::Text("minecraft:normal".to_string()));
    set("view-distance", PropertyValue::Int(10));
    set("spawn-protection", PropertyValue::Int(16));
    p
}

/// Generation settings of a new world, expressed as property overrides.
pub fn apply_generation(props: &mut Properties, settings: &WorldGenerationSettings) {
    if let Some(seed) = &settings.seed {
        props.insert("level-seed".to_string(), PropertyValue::Text(seed.clone()));
    }
    if let Some(t) = &settings.level_type {
        props.insert("level-type".to_string(), PropertyValue::Text(t.clone()));
    }
    if let Some(g) = settings.generate_structures {
        props.insert("generate-structures".to_string(), PropertyValue::Bool(g));
    }
}

fn validate_key(key: &str) -> Result<(), String> {
    if key.is_empty() || key.len() > 128 {
        return Err("key must be 1..=128 characters".to_string());
    }
    if key
        .chars()
        .any(|c| c == '=' || c == ':' || c.is_whitespace() || c.is_control())
    {
        return Err("key contains a forbidden character".to_string());
    }
    if key == LEVEL_NAME {
        return Err("the active world is changed through change_world".to_string());
    }
    Ok(())
}

fn scalar(value: &serde_json::Value) -> Result<PropertyValue, String> {
    match value {
        serde_json::Value::Bool(b) => Ok(PropertyValue::Bool(*b)),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Ok(PropertyValue::Int(i)),
            None => n
                .as_f64()
                .map(PropertyValue::Float)
                .ok_or_else(|| format!("unsupported number {n}")),
        },
        serde_json::Value::String(s) => Ok(PropertyValue::Text(s.clone())),
        other => Err(format!("expected a scalar, got {}", json_kind(other))),
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Convert `value` to the type already stored for the key.
fn coerce(current: Option<&PropertyValue>, value: &serde_json::Value) -> Result<PropertyValue, String> {
    let v = scalar(value)?;
    let Some(current) = current else {
        return Ok(v);
    };
    match (current, v) {
        (PropertyValue::Bool(_), PropertyValue::Bool(b)) => Ok(PropertyValue::Bool(b)),
        (PropertyValue::Bool(_), PropertyValue::Text(s)) => match s.trim() {
            "true" => Ok(PropertyValue::Bool(true)),
            "false" => Ok(PropertyValue::Bool(false)),
            other => Err(format!("expected bool, got {other:?}")),
        },
        (PropertyValue::Int(_), PropertyValue::Int(i)) => Ok(PropertyValue::Int(i)),
        (PropertyValue::Int(_), PropertyValue::Text(s)) => s
            .trim()
            .parse::<i64>()
            .map(PropertyValue::Int)
            .map_err(|e| format!("expected integer, got {s:?}: {e}")),
        (PropertyValue::Float(_), PropertyValue::Float(f)) => Ok(PropertyValue::Float(f)),
        (PropertyValue::Float(_), PropertyValue::Int(i)) => Ok(PropertyValue::Float(i as f64)),
        (PropertyValue::Float(_), PropertyValue::Text(s)) => s
            .trim()
            .parse::<f64>()
            .map(PropertyValue::Float)
            .map_err(|e| format!("expected number, got {s:?}: {e}")),
        (PropertyValue::Text(_), v) => Ok(PropertyValue::Text(v.to_string())),
        (cur, v) => Err(format!(
            "expected {}, got {}",
            type_name(cur),
            type_name(&v)
        )),
    }
}

fn type_name(v: &PropertyValue) -> &'static str {
    match v {
        PropertyValue::Bool(_) => "bool",
        PropertyValue::Int(_) => "integer",
        PropertyValue::Float(_) => "number",
        PropertyValue::Text(_) => "string",
    }
}

fn check_range(key: &str, v: &PropertyValue) -> Result<(), String> {
    match (key, v) {
        (SERVER_PORT, PropertyValue::Int(p)) if !(1..=65535).contains(p) => {
            Err(format!("port {p} out of range"))
        }
        (RAM, PropertyValue::Int(m)) if *m < 256 => Err(format!("ram {m} MiB is too small")),
        (_, PropertyValue::Text(s)) if s.contains(['\n', '\r']) => {
            Err("value must be a single line".to_string())
        }
        _ => Ok(()),
    }
}

/// Apply `patch` key by key. Rejected keys are returned with a reason; the rest are applied.
pub fn update(
    props: &mut Properties,
    patch: &BTreeMap<String, serde_json::Value>,
) -> BTreeMap<String, String> {
    let mut fails = BTreeMap::new();
    for (key, raw) in patch {
        let parsed = validate_key(key)
            .and_then(|_| coerce(props.get(key), raw))
            .and_then(|v| check_range(key, &v).map(|_| v));
        match parsed {
            Ok(v) => {
                props.insert(key.clone(), v);
            }
            Err(reason) => {
                fails.insert(key.clone(), reason);
            }
        }
    }
    fails
}

pub fn get_int(props: &Properties, key: &str) -> Option<i64> {
    match props.get(key)? {
        PropertyValue::Int(i) => Some(*i),
        PropertyValue::Text(s) => s.trim().parse().ok(),
        _ => None,
    }
}

pub fn get_text<'a>(props: &'a Properties, key: &str) -> Option<&'a str> {
    match props.get(key)? {
        PropertyValue::Text(s) => Some(s.as_str()),
        _ => None,
    }
}

pub fn render(props: &Properties) -> String {
    let mut out = String::from("# Managed by anvil-agent; edits are overwritten.\n");
    for (k, v) in props {
        if AGENT_ONLY.contains(&k.as_str()) {
            continue;
        }
        out.push_str(k);
        out.push('=');
        out.push_str(&v.to_string());
        out.push('\n');
    }
    out
}
