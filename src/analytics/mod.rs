//! HTTP client for the analytical database (ClickHouse-style interface).
//!
//! The orchestration core treats the analytical engine as an external
//! collaborator: this client only ships queries over its HTTP port and
//! hands rows back as JSON. Instances are the member type of the
//! bounded `ConnectionPool`.

use std::time::Duration;

use tracing::debug;

use crate::config::AnalyticsConfig;
use crate::pool::ConnectionPool;
use crate::types::{AppError, AppResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AnalyticsClient {
    http: reqwest::Client,
    base_url: String,
    database: String,
    user: String,
    password: String,
}

impl AnalyticsClient {
    /// Open a client and verify the server answers before handing it out.
    pub async fn connect(config: &AnalyticsConfig) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| AppError::Analytics(e.to_string()))?;

        let client = Self {
            http,
            base_url: config.base_url(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
        };
        client.execute("SELECT 1").await?;
        Ok(client)
    }

    /// Run a SELECT and return one JSON object per row.
    pub async fn query(&self, sql: &str) -> AppResult<Vec<serde_json::Value>> {
        let sql = format!("{} FORMAT JSONEachRow", sql.trim_end_matches(';'));
        let text = self.execute(&sql).await?;
        parse_rows(&text)
    }

    async fn execute(&self, sql: &str) -> AppResult<String> {
        debug!("analytics query: {}", sql);
        let response = self
            .http
            .post(&self.base_url)
            .query(&[("database", self.database.as_str())])
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.password)
            .body(sql.to_string())
            .send()
            .await
            .map_err(|e| AppError::Analytics(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| AppError::Analytics(e.to_string()))?;
        if !status.is_success() {
            return Err(AppError::Analytics(format!("{}: {}", status, body)));
        }
        Ok(body)
    }
}

fn parse_rows(text: &str) -> AppResult<Vec<serde_json::Value>> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str(line)
                .map_err(|e| AppError::Analytics(format!("unparseable row: {}", e)))
        })
        .collect()
}

/// Eagerly open `pool_size` clients and place them in a bounded pool.
/// Fails outright if any member cannot be opened.
pub async fn create_analytics_pool(
    config: &AnalyticsConfig,
) -> AppResult<ConnectionPool<AnalyticsClient>> {
    let mut members = Vec::with_capacity(config.pool_size);
    for _ in 0..config.pool_size {
        members.push(AnalyticsClient::connect(config).await?);
    }
    Ok(ConnectionPool::new(members))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_rows_one_object_per_line() {
        let rows = parse_rows("{\"subreddit\":\"rust\"}\n{\"subreddit\":\"python\"}\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["subreddit"], "rust");
    }

    #[test]
    fn test_parse_rows_skips_blank_lines() {
        let rows = parse_rows("\n{\"n\":1}\n\n").unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[test]
    fn test_parse_rows_rejects_garbage() {
        assert!(matches!(
            parse_rows("not json"),
            Err(AppError::Analytics(_))
        ));
    }
}
