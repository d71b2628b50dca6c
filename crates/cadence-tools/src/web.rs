use async_trait::async_trait;
use serde_json::{json, Value};

use cadence_types::{ToolResult, ToolSchema};

use crate::Tool;

const SEARCH_ENDPOINT: &str = "https://api.tavily.com/search";
const MAX_SEARCH_RESULTS: u64 = 5;
const FETCH_OUTPUT_LIMIT: usize = 20_000;

/// Web search backed by the Tavily REST API. Transport and auth failures are
/// surfaced as output text so the agent can report them instead of aborting
/// the task.
pub struct WebSearchTool {
    client: reqwest::Client,
    api_key: Option<String>,
}

impl WebSearchTool {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key,
        }
    }

    pub fn from_env() -> Self {
        let api_key = std::env::var("CADENCE_SEARCH_API_KEY")
            .or_else(|_| std::env::var("TAVILY_API_KEY"))
            .ok()
            .filter(|k| !k.trim().is_empty());
        Self::new(api_key)
    }
}

impl Default for WebSearchTool {
    fn default() -> Self {
        Self::from_env()
    }
}

#[async_trait]
impl Tool for WebSearchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "web_search".to_string(),
            description: "Search the web for current information. Returns titles, snippets, \
                          and URLs for the top results."
                .to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The search query"
                    }
                },
                "required": ["query"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let query = args
            .get("query")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .trim();
        if query.is_empty() {
            tracing::warn!("web_search invoked without a query. Args: {args}");
            return Ok(ToolResult {
                output: "Error: no search query provided.".to_string(),
                metadata: json!({"count": 0}),
            });
        }

        let Some(api_key) = self.api_key.as_deref() else {
            return Ok(ToolResult {
                output: "Error: web search is not configured. Set CADENCE_SEARCH_API_KEY."
                    .to_string(),
                metadata: json!({"count": 0}),
            });
        };

        let request = json!({
            "api_key": api_key,
            "query": query,
            "max_results": MAX_SEARCH_RESULTS,
            "include_answer": false,
        });

        let response = match self.client.post(SEARCH_ENDPOINT).json(&request).send().await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, "web search request failed");
                return Ok(ToolResult {
                    output: format!("Error: search request failed: {err}"),
                    metadata: json!({"count": 0}),
                });
            }
        };

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Ok(ToolResult {
                output: "Error: search API key was rejected.".to_string(),
                metadata: json!({"count": 0}),
            });
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(ToolResult {
                output: "Error: search API rate limit exceeded. Try again later.".to_string(),
                metadata: json!({"count": 0}),
            });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(%status, "web search returned an error status");
            return Ok(ToolResult {
                output: format!(
                    "Error: search failed with status {status}: {}",
                    body.chars().take(300).collect::<String>()
                ),
                metadata: json!({"count": 0}),
            });
        }

        let payload = match response.json::<Value>().await {
            Ok(payload) => payload,
            Err(err) => {
                return Ok(ToolResult {
                    output: format!("Error: could not decode search response: {err}"),
                    metadata: json!({"count": 0}),
                });
            }
        };

        let results = payload
            .get("results")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if results.is_empty() {
            return Ok(ToolResult {
                output: format!("No results found for \"{query}\"."),
                metadata: json!({"count": 0}),
            });
        }

        let output = format_results(query, &results);
        Ok(ToolResult {
            output,
            metadata: json!({"count": results.len()}),
        })
    }
}

fn format_results(query: &str, results: &[Value]) -> String {
    let mut lines = vec![format!("Search results for \"{query}\":"), String::new()];
    for (index, result) in results.iter().enumerate() {
        let title = result
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Untitled");
        let content = result.get("content").and_then(|v| v.as_str()).unwrap_or("");
        let url = result.get("url").and_then(|v| v.as_str()).unwrap_or("");
        lines.push(format!("{}. {title}", index + 1));
        if !content.is_empty() {
            lines.push(format!("   {content}"));
        }
        if !url.is_empty() {
            lines.push(format!("   URL: {url}"));
        }
    }
    lines.join("\n")
}

/// Fetches a URL and returns the body text, truncated to a bounded length.
pub struct WebFetchTool;

#[async_trait]
impl Tool for WebFetchTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema {
            name: "web_fetch".to_string(),
            description: "Fetch the text content of a URL.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "url": {
                        "type": "string",
                        "description": "The URL to fetch"
                    }
                },
                "required": ["url"]
            }),
        }
    }

    async fn execute(&self, args: Value) -> anyhow::Result<ToolResult> {
        let url = args.get("url").and_then(|v| v.as_str()).unwrap_or("").trim();
        if url.is_empty() {
            return Ok(ToolResult {
                output: "Error: no URL provided.".to_string(),
                metadata: json!({}),
            });
        }
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Ok(ToolResult {
                output: format!("Error: unsupported URL scheme in `{url}`."),
                metadata: json!({}),
            });
        }

        let body = match reqwest::get(url).await {
            Ok(response) => match response.text().await {
                Ok(body) => body,
                Err(err) => {
                    return Ok(ToolResult {
                        output: format!("Error: could not read response body: {err}"),
                        metadata: json!({}),
                    });
                }
            },
            Err(err) => {
                tracing::warn!(error = %err, url, "web fetch failed");
                return Ok(ToolResult {
                    output: format!("Error: fetch failed: {err}"),
                    metadata: json!({}),
                });
            }
        };

        let truncated = body.chars().count() > FETCH_OUTPUT_LIMIT;
        Ok(ToolResult {
            output: body.chars().take(FETCH_OUTPUT_LIMIT).collect(),
            metadata: json!({"truncated": truncated}),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn search_without_query_reports_error_text() {
        let tool = WebSearchTool::new(Some("test-key".to_string()));
        let result = tool.execute(json!({})).await.expect("execute");
        assert!(result.output.starts_with("Error:"));
        assert_eq!(result.metadata["count"], 0);
    }

    #[tokio::test]
    async fn search_without_api_key_reports_configuration_error() {
        let tool = WebSearchTool::new(None);
        let result = tool
            .execute(json!({"query": "rust async"}))
            .await
            .expect("execute");
        assert!(result.output.contains("CADENCE_SEARCH_API_KEY"));
    }

    #[tokio::test]
    async fn fetch_rejects_non_http_urls() {
        let tool = WebFetchTool;
        let result = tool
            .execute(json!({"url": "file:///etc/passwd"}))
            .await
            .expect("execute");
        assert!(result.output.starts_with("Error:"));
    }

    #[test]
    fn result_formatting_is_numbered() {
        let results = vec![
            json!({"title": "First", "content": "snippet one", "url": "https://a.example"}),
            json!({"title": "Second", "content": "snippet two", "url": "https://b.example"}),
        ];
        let output = format_results("test", &results);
        assert!(output.contains("1. First"));
        assert!(output.contains("2. Second"));
        assert!(output.contains("   URL: https://b.example"));
    }
}
