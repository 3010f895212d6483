//! Neo4j HTTP transactional endpoint driver.
//!
//! ## Configuration
//!
//! ```yaml
//! graph:
//!   uri: "http://localhost:7474"
//!   user: "neo4j"
//!   password: "${NEO4J_PASSWORD}"
//!   database: "neo4j"
//! ```
//!
//! A transaction is opened with `POST /db/{database}/tx`, statements are sent
//! to the returned transaction URL, and the unit of work is finished with the
//! `commit` URL or a `DELETE` on the transaction URL. Statements run outside a
//! transaction go to `/db/{database}/tx/commit` (auto-commit).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{AccessMode, GraphDriver, GraphError, GraphSession, Record, Statement};

/// Connection settings for [`HttpGraphDriver`].
#[derive(Debug, Clone)]
pub struct HttpGraphConfig {
    pub uri: String,
    pub user: String,
    pub password: String,
    pub database: String,
    pub timeout: Duration,
}

impl Default for HttpGraphConfig {
    fn default() -> Self {
        Self {
            uri: "http://localhost:7474".to_string(),
            user: "neo4j".to_string(),
            password: String::new(),
            database: "neo4j".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpGraphDriver {
    config: HttpGraphConfig,
    client: reqwest::Client,
}

impl HttpGraphDriver {
    pub fn new(config: HttpGraphConfig) -> Result<Self, GraphError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GraphError::Connectivity(e.to_string()))?;
        Ok(Self { config, client })
    }

    fn tx_endpoint(&self) -> String {
        format!(
            "{}/db/{}/tx",
            self.config.uri.trim_end_matches('/'),
            self.config.database
        )
    }
}

#[async_trait]
impl GraphDriver for HttpGraphDriver {
    async fn connect(&self) -> Result<(), GraphError> {
        let response = self
            .client
            .get(self.config.uri.trim_end_matches('/'))
            .basic_auth(&self.config.user, Some(&self.config.password))
            .send()
            .await
            .map_err(|e| GraphError::Connectivity(format!("Discovery request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(GraphError::Connectivity(format!(
                "Discovery returned HTTP {}",
                response.status()
            )));
        }
        log::debug!("Connected to graph endpoint {}", self.config.uri);
        Ok(())
    }

    async fn session(&self, mode: AccessMode) -> Result<Box<dyn GraphSession>, GraphError> {
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            user: self.config.user.clone(),
            password: self.config.password.clone(),
            endpoint: self.tx_endpoint(),
            mode,
            tx: None,
        }))
    }

    async fn close(&self) -> Result<(), GraphError> {
        Ok(())
    }
}

struct OpenTransaction {
    url: String,
    commit: String,
}

struct HttpSession {
    client: reqwest::Client,
    user: String,
    password: String,
    endpoint: String,
    mode: AccessMode,
    tx: Option<OpenTransaction>,
}

impl HttpSession {
    async fn post(&self, url: &str, statements: Value) -> Result<(Option<String>, Value), GraphError> {
        let response = self
            .client
            .post(url)
            .basic_auth(&self.user, Some(&self.password))
            .header("access-mode", self.mode.as_str())
            .json(&json!({ "statements": statements }))
            .send()
            .await
            .map_err(|e| GraphError::Session(e.to_string()))?;

        let status = response.status();
        let location = response
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(String::from);

        if status.as_u16() == 401 {
            return Err(GraphError::Connectivity("Authentication failed".to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GraphError::Session(format!("HTTP {}: {}", status, body)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| GraphError::Serialization(e.to_string()))?;
        check_errors(&body)?;
        Ok((location, body))
    }
}

#[async_trait]
impl GraphSession for HttpSession {
    async fn begin(&mut self) -> Result<(), GraphError> {
        let (location, body) = self.post(&self.endpoint, json!([])).await?;
        let commit = body
            .get("commit")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| GraphError::Session("No commit URL in response".to_string()))?;
        let url = location.unwrap_or_else(|| commit.trim_end_matches("/commit").to_string());
        self.tx = Some(OpenTransaction { url, commit });
        Ok(())
    }

    async fn run(&mut self, statement: &Statement) -> Result<Vec<Record>, GraphError> {
        let payload = json!([{
            "statement": statement.text,
            "parameters": statement.params,
            "resultDataContents": ["row"],
        }]);
        let url = match &self.tx {
            Some(tx) => tx.url.clone(),
            None => format!("{}/commit", self.endpoint),
        };
        let (_, body) = self.post(&url, payload).await?;
        parse_rows(&body)
    }

    async fn commit(&mut self) -> Result<(), GraphError> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| GraphError::Session("No open transaction".to_string()))?;
        self.post(&tx.commit, json!([])).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), GraphError> {
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        self.client
            .delete(&tx.url)
            .basic_auth(&self.user, Some(&self.password))
            .send()
            .await
            .map_err(|e| GraphError::Session(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), GraphError> {
        self.rollback().await
    }
}

/// Map a non-empty `errors` array to [`GraphError::Query`].
fn check_errors(body: &Value) -> Result<(), GraphError> {
    let Some(errors) = body.get("errors").and_then(Value::as_array) else {
        return Ok(());
    };
    match errors.first() {
        None => Ok(()),
        Some(first) => {
            let code = first.get("code").and_then(Value::as_str).unwrap_or("Unknown");
            let message = first.get("message").and_then(Value::as_str).unwrap_or("");
            Err(GraphError::Query(format!("{}: {}", code, message)))
        }
    }
}

/// Zip the first result's `columns` with each `row`.
fn parse_rows(body: &Value) -> Result<Vec<Record>, GraphError> {
    let Some(result) = body
        .get("results")
        .and_then(Value::as_array)
        .and_then(|r| r.first())
    else {
        return Ok(Vec::new());
    };

    let columns: Vec<&str> = result
        .get("columns")
        .and_then(Value::as_array)
        .map(|c| c.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    let data = result
        .get("data")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    data.iter()
        .map(|entry| -> Result<Record, GraphError> {
            let row = entry
                .get("row")
                .and_then(Value::as_array)
                .ok_or_else(|| GraphError::Serialization("Result entry without row".to_string()))?;
            Ok(columns
                .iter()
                .zip(row)
                .map(|(c, v)| (c.to_string(), v.clone()))
                .collect())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rows_zips_columns() {
        let body = json!({
            "results": [{
                "columns": ["capability_id", "score"],
                "data": [
                    {"row": ["tool:a", 0.9], "meta": [null, null]},
                    {"row": ["tool:b", 0.4], "meta": [null, null]}
                ]
            }],
            "errors": []
        });
        let rows = parse_rows(&body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["capability_id"], "tool:a");
        assert_eq!(rows[1]["score"], 0.4);
    }

    #[test]
    fn test_errors_become_query_errors() {
        let body = json!({
            "results": [],
            "errors": [{
                "code": "Neo.ClientError.Statement.SyntaxError",
                "message": "Unknown function 'gds.similarity.cosine'"
            }]
        });
        let err = check_errors(&body).unwrap_err();
        assert!(matches!(err, GraphError::Query(ref m) if m.contains("SyntaxError")));
        assert!(parse_rows(&json!({"results": [], "errors": []})).unwrap().is_empty());
    }

    #[test]
    fn test_tx_endpoint_trims_slash() {
        let driver = HttpGraphDriver::new(HttpGraphConfig {
            uri: "http://graph:7474/".into(),
            database: "registry".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(driver.tx_endpoint(), "http://graph:7474/db/registry/tx");
    }
}
