//! Protocole de contrôle : JSON-RPC 2.0, délimité par fin de ligne.
//!
//! Le fil est du JSON à typage dynamique ; cette frontière d'analyse
//! unique le ramène à un enum de requêtes à champs typés. Les réponses
//! utilisent les codes standard, plus `-12345` pour les erreurs du
//! domaine (état refusé, média inconnu).

use serde::Deserialize;
use serde_json::Value;

use ondecatalog::FilterQuery;

/// Code d'erreur du domaine.
pub const DOMAIN_ERROR: i64 = -12345;
pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;

/// Erreur protocolaire, convertie en objet `error` JSON-RPC.
#[derive(Debug, Clone)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn domain(message: impl Into<String>, data: Value) -> Self {
        Self {
            code: DOMAIN_ERROR,
            message: message.into(),
            data: Some(data),
        }
    }

    pub fn to_value(&self) -> Value {
        let mut error = serde_json::json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(data) = &self.data {
            error["data"] = data.clone();
        }
        error
    }
}

/// Élément de la commande `append` : une URL et ses métadonnées.
#[derive(Debug, Clone, Deserialize)]
pub struct AppendItem {
    pub url: String,
    #[serde(default)]
    pub info: Option<Value>,
    #[serde(default)]
    pub mime: Option<String>,
}

/// Cible de la commande `remove`.
#[derive(Debug, Clone)]
pub enum RemoveTarget {
    Id(i64),
    Url(String),
}

/// Les requêtes comprises par le serveur.
#[derive(Debug)]
pub enum Request {
    Play,
    Pause,
    Stop,
    Next,
    SetNext { id: i64 },
    List { first: usize, maxitems: usize },
    Info { id: i64 },
    Filter(FilterQuery),
    Append(Vec<AppendItem>),
    Remove(Vec<RemoveTarget>),
    Change { media: Option<String>, id: Option<i64>, next: bool, options: Vec<String> },
    Status,
    OnChange,
    Options { loop_enabled: Option<bool>, random: Option<bool> },
    Volume { level: Option<u8>, step: Option<i32> },
    GetPosition,
    Capabilities,
}

/// Une requête analysée, avec l'id d'appel à renvoyer.
#[derive(Debug)]
pub struct Call {
    pub id: Value,
    pub request: Request,
}

/// Analyse une ligne du fil.
pub fn parse_line(line: &str) -> Result<Call, (Value, RpcError)> {
    let raw: Value = serde_json::from_str(line)
        .map_err(|err| (Value::Null, RpcError::new(PARSE_ERROR, err.to_string())))?;
    let id = raw.get("id").cloned().unwrap_or(Value::Null);
    let method = raw
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| {
            (
                id.clone(),
                RpcError::new(INVALID_REQUEST, "missing method"),
            )
        })?;
    let params = raw.get("params").cloned().unwrap_or(Value::Null);
    let request = parse_request(method, &params)
        .map_err(|err| (id.clone(), err))?;
    Ok(Call { id, request })
}

fn parse_request(method: &str, params: &Value) -> Result<Request, RpcError> {
    let invalid = |msg: &str| RpcError::new(INVALID_PARAMS, msg);
    match method {
        "play" => Ok(Request::Play),
        "pause" => Ok(Request::Pause),
        "stop" => Ok(Request::Stop),
        "next" => Ok(Request::Next),
        "setnext" => {
            let id = params
                .get("id")
                .and_then(Value::as_i64)
                .ok_or_else(|| invalid("setnext needs an id"))?;
            Ok(Request::SetNext { id })
        }
        "list" => Ok(Request::List {
            first: params.get("first").and_then(Value::as_u64).unwrap_or(0) as usize,
            maxitems: params
                .get("maxitems")
                .and_then(Value::as_u64)
                .unwrap_or(u64::MAX) as usize,
        }),
        "info" => {
            let id = params
                .get("id")
                .and_then(Value::as_i64)
                .ok_or_else(|| invalid("info needs an id"))?;
            Ok(Request::Info { id })
        }
        "filter" => {
            let field = |key: &str| {
                params
                    .get(key)
                    .and_then(Value::as_str)
                    .map(str::to_string)
            };
            Ok(Request::Filter(FilterQuery {
                keyword: field("keyword"),
                title: field("title"),
                artist: field("artist"),
                album: field("album"),
                genre: field("genre"),
            }))
        }
        "append" => {
            let items = match params {
                Value::Array(values) => values
                    .iter()
                    .map(|value| serde_json::from_value(value.clone()))
                    .collect::<Result<Vec<AppendItem>, _>>()
                    .map_err(|err| invalid(&err.to_string()))?,
                Value::Object(_) => {
                    vec![serde_json::from_value(params.clone())
                        .map_err(|err: serde_json::Error| invalid(&err.to_string()))?]
                }
                _ => return Err(invalid("append needs an object or an array")),
            };
            Ok(Request::Append(items))
        }
        "remove" => {
            let target = |value: &Value| -> Option<RemoveTarget> {
                if let Some(id) = value.get("id").and_then(Value::as_i64) {
                    return Some(RemoveTarget::Id(id));
                }
                value
                    .get("url")
                    .and_then(Value::as_str)
                    .map(|url| RemoveTarget::Url(url.to_string()))
            };
            let targets = match params {
                Value::Array(values) => values.iter().filter_map(target).collect::<Vec<_>>(),
                Value::Object(_) => target(params).into_iter().collect(),
                _ => Vec::new(),
            };
            if targets.is_empty() {
                return Err(invalid("remove needs an id or an url"));
            }
            Ok(Request::Remove(targets))
        }
        "change" => Ok(Request::Change {
            media: params
                .get("media")
                .and_then(Value::as_str)
                .map(str::to_string),
            id: params.get("id").and_then(Value::as_i64),
            next: params
                .get("next")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            options: params
                .get("options")
                .and_then(Value::as_array)
                .map(|values| {
                    values
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }),
        "status" => Ok(Request::Status),
        "onchange" => Ok(Request::OnChange),
        "options" => Ok(Request::Options {
            loop_enabled: params.get("loop").and_then(Value::as_bool),
            random: params.get("random").and_then(Value::as_bool),
        }),
        "volume" => {
            let level = params
                .get("level")
                .and_then(Value::as_u64)
                .map(|level| level.min(100) as u8);
            let step = params
                .get("step")
                .and_then(Value::as_i64)
                .map(|step| step as i32);
            if level.is_none() && step.is_none() {
                return Err(invalid("volume needs level or step"));
            }
            Ok(Request::Volume { level, step })
        }
        "getposition" => Ok(Request::GetPosition),
        "capabilities" => Ok(Request::Capabilities),
        other => Err(RpcError::new(
            METHOD_NOT_FOUND,
            format!("unknown method {other}"),
        )),
    }
}

/// Enveloppe de réponse.
pub fn response(id: &Value, result: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

pub fn error_response(id: &Value, error: &RpcError) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": error.to_value(),
    })
}

/// Notification non sollicitée.
pub fn notification(method: &str, params: Value) -> Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "method": method,
        "params": params,
    })
}
