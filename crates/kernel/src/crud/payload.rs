//! Create/update request bodies.
//!
//! Forms arrive as JSON, url-encoded or multipart bodies. All three are
//! normalized into a [`FormPayload`]: a JSON object of values plus the
//! uploaded files keyed by field. Multipart names ending in `[]` collect
//! into arrays.

use std::collections::BTreeMap;

use axum::Form;
use axum::Json;
use axum::extract::{FromRequest, Multipart, Request};
use axum::http::header::CONTENT_TYPE;
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::AppError;
use crate::file::UploadedFile;
use crate::query::listing::as_flag;

/// Values and files submitted for one record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FormPayload {
    values: Map<String, Value>,
    files: BTreeMap<String, Vec<UploadedFile>>,
}

impl FormPayload {
    /// Payload from a JSON object; other JSON values give an empty payload.
    pub fn from_json(value: Value) -> Self {
        let values = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            values,
            files: BTreeMap::new(),
        }
    }

    pub fn with_value(mut self, key: &str, value: Value) -> Self {
        self.values.insert(key.to_string(), value);
        self
    }

    pub fn with_file(mut self, key: &str, file: UploadedFile) -> Self {
        self.files.entry(key.to_string()).or_default().push(file);
        self
    }

    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Uploads sent under `key`.
    pub fn files(&self, key: &str) -> &[UploadedFile] {
        self.files.get(key).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn has_file(&self, key: &str) -> bool {
        !self.files(key).is_empty()
    }

    /// Missing, null, empty string or empty array.
    pub fn is_blank(&self, key: &str) -> bool {
        self.get(key).is_none_or(is_blank)
    }

    /// Checkbox-like flag such as `photo_edited`.
    pub fn flag(&self, key: &str) -> bool {
        self.get(key).is_some_and(as_flag)
    }

    /// A list value; a lone string counts as a one-element list.
    pub fn string_list(&self, key: &str) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items.iter().filter_map(scalar_text).collect(),
            Some(value) => scalar_text(value).into_iter().collect(),
            None => Vec::new(),
        }
    }

    /// Values whose keys start with `custom_`.
    pub fn custom_values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values
            .iter()
            .filter_map(|(k, v)| k.strip_prefix("custom_").map(|name| (name, v)))
    }

    fn push_text(&mut self, name: &str, text: String) {
        match name.strip_suffix("[]") {
            Some(base) => {
                let entry = self
                    .values
                    .entry(base.to_string())
                    .or_insert_with(|| Value::Array(Vec::new()));
                if let Value::Array(items) = entry {
                    items.push(Value::String(text));
                }
            }
            None => {
                self.values.insert(name.to_string(), Value::String(text));
            }
        }
    }

    fn push_file(&mut self, name: &str, file: UploadedFile) {
        let base = name.strip_suffix("[]").unwrap_or(name);
        self.files.entry(base.to_string()).or_default().push(file);
    }

    async fn from_multipart(mut multipart: Multipart) -> Result<Self, AppError> {
        let mut payload = Self::default();
        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?
        {
            let name = field.name().unwrap_or_default().to_string();
            if name.is_empty() {
                continue;
            }
            match field.file_name().map(str::to_string) {
                Some(file_name) => {
                    let content_type = field.content_type().map(str::to_string);
                    let data = field
                        .bytes()
                        .await
                        .map_err(|e| AppError::BadRequest(e.body_text()))?;
                    // Browsers send an empty part for untouched file inputs.
                    if file_name.is_empty() && data.is_empty() {
                        continue;
                    }
                    debug!(field = %name, file = %file_name, size = data.len(), "upload received");
                    payload.push_file(
                        &name,
                        UploadedFile {
                            file_name,
                            content_type,
                            data: data.to_vec(),
                        },
                    );
                }
                None => {
                    let text = field
                        .text()
                        .await
                        .map_err(|e| AppError::BadRequest(e.body_text()))?;
                    payload.push_text(&name, text);
                }
            }
        }
        Ok(payload)
    }
}

impl<S> FromRequest<S> for FormPayload
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_ascii_lowercase();

        if content_type.starts_with("multipart/form-data") {
            let multipart = Multipart::from_request(req, state)
                .await
                .map_err(|e| AppError::BadRequest(e.body_text()))?;
            Self::from_multipart(multipart).await
        } else if content_type.starts_with("application/x-www-form-urlencoded") {
            let Form(pairs) = Form::<Vec<(String, String)>>::from_request(req, state)
                .await
                .map_err(|e| AppError::BadRequest(e.body_text()))?;
            let mut payload = Self::default();
            for (name, text) in pairs {
                payload.push_text(&name, text);
            }
            Ok(payload)
        } else if content_type.starts_with("application/json") {
            let Json(value) = Json::<Value>::from_request(req, state)
                .await
                .map_err(|e| AppError::BadRequest(e.body_text()))?;
            Ok(Self::from_json(value))
        } else {
            Ok(Self::default())
        }
    }
}

/// Missing-value test shared by validation and persistence.
pub fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

/// Text of a scalar value; `None` for null, arrays and objects.
pub fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use serde_json::json;

    #[test]
    fn bracketed_names_collect_into_arrays() {
        let mut payload = FormPayload::default();
        payload.push_text("status", "open".into());
        payload.push_text("labels[]", "a".into());
        payload.push_text("labels[]", "b".into());

        assert_eq!(payload.get("status"), Some(&json!("open")));
        assert_eq!(payload.get("labels"), Some(&json!(["a", "b"])));
        assert_eq!(payload.string_list("labels"), ["a", "b"]);
        assert_eq!(payload.string_list("status"), ["open"]);
        assert!(payload.string_list("missing").is_empty());
    }

    #[test]
    fn blank_values() {
        let payload = FormPayload::from_json(json!({
            "a": null, "b": " ", "c": [], "d": 0, "e": false, "f": "x"
        }));
        for key in ["a", "b", "c", "missing"] {
            assert!(payload.is_blank(key), "{key} should be blank");
        }
        for key in ["d", "e", "f"] {
            assert!(!payload.is_blank(key), "{key} should not be blank");
        }
    }

    #[test]
    fn flags_and_custom_values() {
        let payload = FormPayload::from_json(json!({
            "photo_edited": "true",
            "invoice_edited": "0",
            "custom_color": "red",
            "code": "A1"
        }));
        assert!(payload.flag("photo_edited"));
        assert!(!payload.flag("invoice_edited"));
        assert!(!payload.flag("missing"));

        let custom: Vec<_> = payload.custom_values().collect();
        assert_eq!(custom, [("color", &json!("red"))]);
    }

    #[tokio::test]
    async fn extracts_multipart_bodies() {
        let boundary = "XBOUNDARY";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"code\"\r\n\r\nA1\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"tags[]\"\r\n\r\nx\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"tags[]\"\r\n\r\ny\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"photo[]\"; filename=\"a.png\"\r\n\
             Content-Type: image/png\r\n\r\nPNGDATA\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"invoice\"; filename=\"\"\r\n\
             Content-Type: application/octet-stream\r\n\r\n\r\n\
             --{b}--\r\n",
            b = boundary
        );
        let req = Request::builder()
            .method("POST")
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap();

        let payload = FormPayload::from_request(req, &()).await.unwrap();
        assert_eq!(payload.get("code"), Some(&json!("A1")));
        assert_eq!(payload.get("tags"), Some(&json!(["x", "y"])));
        assert_eq!(payload.files("photo").len(), 1);
        assert_eq!(payload.files("photo")[0].file_name, "a.png");
        assert_eq!(payload.files("photo")[0].data, b"PNGDATA");
        assert!(!payload.has_file("invoice"));
    }

    #[tokio::test]
    async fn extracts_json_and_urlencoded_bodies() {
        let req = Request::builder()
            .method("POST")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"code":"B2","total":3}"#))
            .unwrap();
        let payload = FormPayload::from_request(req, &()).await.unwrap();
        assert_eq!(payload.get("total"), Some(&json!(3)));

        let req = Request::builder()
            .method("POST")
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from("code=C3&labels%5B%5D=a&labels%5B%5D=b"))
            .unwrap();
        let payload = FormPayload::from_request(req, &()).await.unwrap();
        assert_eq!(payload.get("code"), Some(&json!("C3")));
        assert_eq!(payload.get("labels"), Some(&json!(["a", "b"])));
    }

    #[tokio::test]
    async fn malformed_json_is_a_bad_request() {
        let req = Request::builder()
            .method("POST")
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let err = FormPayload::from_request(req, &()).await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }
}
