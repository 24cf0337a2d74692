//! Wire format spoken with the git collaborator: length-delimited frames,
//! JSON payloads. Requests carry a client-assigned id the response echoes;
//! file contents travel base64-encoded.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub id: u64,
    pub op: &'a str,
    pub args: Value,
}

#[derive(Debug, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default)]
    pub ok: Option<Value>,
    #[serde(default)]
    pub err: Option<String>,
}

impl Response {
    pub fn into_result(self) -> Result<Value, String> {
        match (self.ok, self.err) {
            (_, Some(err)) => Err(err),
            (Some(ok), None) => Ok(ok),
            (None, None) => Ok(Value::Null),
        }
    }
}
