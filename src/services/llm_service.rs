use crate::api::middleware::AppError;
use crate::config::LlmConfig;
use crate::models::{Dialect, SchemaSnapshot, SuggestedQuery};
use reqwest::Client as HttpClient;
use serde::Serialize;
use serde_json::{json, Value};

const MAX_CONTEXT_TABLES: usize = 50;
const MAX_CONTEXT_VIEWS: usize = 20;
const MAX_CONTEXT_COLUMNS: usize = 20;
const MAX_PROMPT_HISTORY: usize = 5;
const MAX_PROMPT_EXCLUDES: usize = 10;

/// SQL produced from a natural-language request. Gets no special trust: it is
/// validated and executed like any user query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneratedSql {
    pub sql: String,
    pub explanation: Option<String>,
}

/// Inputs for a batch of query suggestions.
#[derive(Debug, Clone)]
pub struct SuggestionRequest<'a> {
    pub schema_context: &'a str,
    pub dialect: Dialect,
    pub limit: usize,
    pub seed: Option<u64>,
    /// Descriptions already shown to the user.
    pub exclude: &'a [String],
    /// Recent history inputs, newest first.
    pub recent: &'a [String],
}

/// Turns a question plus schema context into SQL.
#[async_trait::async_trait]
pub trait SqlGenerator: Send + Sync {
    async fn generate(
        &self,
        prompt: &str,
        schema_context: &str,
        dialect: Dialect,
    ) -> Result<GeneratedSql, AppError>;

    /// Propose queries worth running against the schema. Output is unchecked.
    async fn suggest(&self, request: &SuggestionRequest<'_>) -> Result<Vec<SuggestedQuery>, AppError>;
}

/// Text-generation gateway client
pub struct LlmService {
    gateway_url: String,
    api_key: Option<String>,
    model: String,
    http_client: HttpClient,
}

impl LlmService {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            gateway_url: config.gateway_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            http_client: HttpClient::new(),
        }
    }

    fn build_prompt(question: &str, schema_context: &str, dialect: Dialect) -> String {
        let dialect_hints = match dialect {
            Dialect::MySql => {
                r#"
- Use MySQL syntax and functions
- Use LIMIT syntax (not TOP or FETCH FIRST)
- For dates, use functions like NOW(), CURDATE(), DATE_SUB(), etc.
- String concatenation uses CONCAT() function
- Use backticks for identifier quoting if needed: `table_name`"#
            }
            Dialect::PostgreSql => {
                r#"
- Use PostgreSQL syntax and functions
- Use LIMIT syntax (or FETCH FIRST)
- For dates, use functions like NOW(), CURRENT_DATE, interval arithmetic
- String concatenation uses || operator or CONCAT()
- Use double quotes for identifier quoting if needed: "table_name""#
            }
            Dialect::Sqlite => {
                r#"
- Use SQLite syntax and functions
- Use LIMIT syntax
- For dates, use date(), datetime() and strftime()
- String concatenation uses the || operator
- Use double quotes for identifier quoting if needed: "table_name""#
            }
        };

        format!(
            r#"You are a SQL expert. Given a database schema and a natural language question, generate a valid {dialect} SELECT query.

{schema_context}

Question: {question}

Instructions:
1. Generate ONLY a read-only {dialect} SELECT query (no INSERT, UPDATE, DELETE, DROP)
2. Use proper table and column names from the schema above
3. Wrap the query in a ```sql ... ``` code block
4. Put a one-sentence explanation before the code block
{dialect_hints}
"#,
            dialect = dialect,
            schema_context = schema_context,
            question = question,
            dialect_hints = dialect_hints
        )
    }

    fn build_suggestion_prompt(request: &SuggestionRequest<'_>) -> String {
        let mut prompt = format!(
            r#"You are a SQL expert. Given the database schema below, suggest {limit} useful read-only {dialect} queries.

{schema_context}
"#,
            limit = request.limit,
            dialect = request.dialect,
            schema_context = request.schema_context,
        );

        if !request.recent.is_empty() {
            prompt.push_str("\nRecent user queries (hints about what the user cares about):\n");
            for (i, input) in request.recent.iter().take(MAX_PROMPT_HISTORY).enumerate() {
                prompt.push_str(&format!("  {}. {}\n", i + 1, input));
            }
        }

        if !request.exclude.is_empty() {
            let shown: Vec<&str> = request
                .exclude
                .iter()
                .take(MAX_PROMPT_EXCLUDES)
                .map(String::as_str)
                .collect();
            prompt.push_str(&format!("\nDo not repeat these suggestions: {}\n", shown.join(", ")));
        }

        if let Some(seed) = request.seed {
            prompt.push_str(&format!("\nVariation seed: {}. Prefer suggestions you have not given before.\n", seed));
        }

        prompt.push_str(&format!(
            r#"
Instructions:
1. Cover different kinds of questions: aggregates, joins, filtering and sorting
2. Each description is a short phrase of at most 12 words
3. Each query is a single {dialect} SELECT statement using only the schema above
4. Answer with a JSON array only, for example:
[{{"description": "Orders per customer", "sql": "SELECT customer_id, COUNT(*) FROM orders GROUP BY customer_id"}}]
"#,
            dialect = request.dialect
        ));
        prompt
    }

    /// Call the gateway and return the raw completion text
    async fn call_llm_api(&self, prompt: &str, temperature: f64) -> Result<String, AppError> {
        if self.gateway_url.is_empty() {
            return Err(AppError::LlmService(
                "Text generation gateway is not configured (set LLM_GATEWAY_URL)".to_string(),
            ));
        }

        let mut request = self.http_client.post(&self.gateway_url).json(&json!({
            "model": self.model,
            "prompt": prompt,
            "max_tokens": 2000,
            "temperature": temperature,
        }));

        if let Some(api_key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::LlmService(format!("Failed to call LLM service: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(AppError::LlmService(format!(
                "LLM service returned error {}: {}",
                status, error_text
            )));
        }

        let result: Value = response
            .json()
            .await
            .map_err(|e| AppError::LlmService(format!("Failed to parse LLM response: {}", e)))?;

        result["text"]
            .as_str()
            .or_else(|| result["content"].as_str())
            .or_else(|| result["response"].as_str())
            .or_else(|| result["choices"][0]["message"]["content"].as_str())
            .map(str::to_string)
            .ok_or_else(|| AppError::LlmService("LLM response does not contain any text".to_string()))
    }
}

#[async_trait::async_trait]
impl SqlGenerator for LlmService {
    async fn generate(
        &self,
        prompt: &str,
        schema_context: &str,
        dialect: Dialect,
    ) -> Result<GeneratedSql, AppError> {
        let full_prompt = Self::build_prompt(prompt, schema_context, dialect);
        let content = self.call_llm_api(&full_prompt, 0.1).await?;
        let generated = parse_completion(&content)?;
        tracing::info!("Generated SQL: {}", generated.sql);
        Ok(generated)
    }

    async fn suggest(&self, request: &SuggestionRequest<'_>) -> Result<Vec<SuggestedQuery>, AppError> {
        let prompt = Self::build_suggestion_prompt(request);
        let temperature = if request.seed.is_some() { 0.9 } else { 0.8 };
        let content = self.call_llm_api(&prompt, temperature).await?;
        let suggestions = parse_suggestions(&content)?;
        tracing::info!("Generated {} query suggestions", suggestions.len());
        Ok(suggestions)
    }
}

/// Pull the JSON array of suggestions out of a completion, ignoring any
/// prose or code fence around it. Entries missing a field are dropped.
pub fn parse_suggestions(content: &str) -> Result<Vec<SuggestedQuery>, AppError> {
    let array = match (content.find('['), content.rfind(']')) {
        (Some(start), Some(end)) if start < end => &content[start..=end],
        _ => {
            let preview: String = content.chars().take(200).collect();
            return Err(AppError::LlmService(format!(
                "No suggestion list found in LLM response: {}",
                preview
            )));
        }
    };

    let items: Vec<Value> = serde_json::from_str(array)
        .map_err(|e| AppError::LlmService(format!("Failed to parse suggestion list: {}", e)))?;

    Ok(items
        .iter()
        .filter_map(|item| {
            let description = item["description"].as_str()?.trim();
            let sql = item["sql"].as_str()?.trim();
            (!description.is_empty() && !sql.is_empty()).then(|| SuggestedQuery {
                description: description.to_string(),
                sql: sql.to_string(),
            })
        })
        .collect())
}

/// Split a completion into the SQL and the prose before it. Accepts a fenced
/// block (with or without a language tag) or bare SQL lines.
pub fn parse_completion(content: &str) -> Result<GeneratedSql, AppError> {
    let fence = content
        .find("```sql")
        .map(|start| (start, start + "```sql".len()))
        .or_else(|| content.find("```").map(|start| (start, start + 3)));

    let Some((fence_start, body_start)) = fence else {
        let sql = content
            .lines()
            .map(str::trim)
            .skip_while(|line| {
                let upper = line.to_uppercase();
                !(upper.starts_with("SELECT") || upper.starts_with("WITH") || line.starts_with('('))
            })
            .collect::<Vec<_>>()
            .join("\n");
        let sql = sql.trim().to_string();
        if sql.is_empty() {
            let preview: String = content.chars().take(200).collect();
            return Err(AppError::LlmService(format!(
                "No SQL query found in LLM response: {}",
                preview
            )));
        }
        return Ok(GeneratedSql {
            sql,
            explanation: None,
        });
    };

    let body = &content[body_start..];
    let sql = match body.find("```") {
        Some(end) => &body[..end],
        None => body,
    };
    let explanation = content[..fence_start].trim();

    Ok(GeneratedSql {
        sql: sql.trim().to_string(),
        explanation: (!explanation.is_empty()).then(|| explanation.to_string()),
    })
}

/// Render a snapshot as prompt context, capped at 50 tables and 20 views with
/// at most 20 columns each.
pub fn format_schema_context(snapshot: &SchemaSnapshot, dialect: Dialect) -> String {
    let mut lines = vec![format!("Database Type: {}", dialect), String::new()];

    if !snapshot.tables.is_empty() {
        lines.push("Tables:".to_string());
        for table in snapshot.tables.iter().take(MAX_CONTEXT_TABLES) {
            lines.push(format!("  - {}", qualified(&table.schema, &table.name)));
            for column in table.columns.iter().take(MAX_CONTEXT_COLUMNS) {
                let nullable = if column.nullable { "NULL" } else { "NOT NULL" };
                let pk = if column.is_primary_key { " PK" } else { "" };
                let default = column
                    .default_value
                    .as_deref()
                    .map(|d| format!(" DEFAULT {}", d))
                    .unwrap_or_default();
                lines.push(format!(
                    "      {}: {} {}{}{}",
                    column.name, column.native_type, nullable, pk, default
                ));
            }
            if let Some(estimate) = table.row_estimate.filter(|n| *n > 0) {
                lines.push(format!("      (estimated {} rows)", estimate));
            }
            lines.push(String::new());
        }
    }

    if !snapshot.views.is_empty() {
        lines.push("Views:".to_string());
        for view in snapshot.views.iter().take(MAX_CONTEXT_VIEWS) {
            lines.push(format!("  - {}", qualified(&view.schema, &view.name)));
            for column in view.columns.iter().take(MAX_CONTEXT_COLUMNS) {
                let nullable = if column.nullable { "NULL" } else { "NOT NULL" };
                lines.push(format!("      {}: {} {}", column.name, column.native_type, nullable));
            }
            lines.push(String::new());
        }
    }

    lines.join("\n")
}

fn qualified(schema: &Option<String>, name: &str) -> String {
    match schema {
        Some(schema) if !schema.is_empty() => format!("{}.{}", schema, name),
        _ => name.to_string(),
    }
}
