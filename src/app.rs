use std::sync::Arc;

use crate::api::middleware::AppError;
use crate::config::Config;
use crate::models::{
    Connection, DeleteHistoryRequest, HistoryPage, HistoryParams, HistorySummary,
    NaturalQueryResponse, QueryResult, SchemaSnapshot, SuggestedQueriesParams,
    SuggestedQueriesResponse, SuggestedQuery,
};
use crate::services::database::{Engine, EngineFactory, NativeEngineFactory};
use crate::services::{
    format_schema_context, ConnectionRegistry, EnginePool, ExecutionRequest, LlmService,
    MetadataCache, QueryService, SqlGenerator, SuggestionRequest,
};

const SUGGESTION_HISTORY: u32 = 10;
use crate::storage::SqliteStorage;
use crate::validation::SqlValidator;

/// Every long-lived service, built once at startup and shared by `Arc`.
pub struct AppServices {
    pub config: Config,
    pub registry: ConnectionRegistry,
    pool: Arc<EnginePool>,
    metadata: Arc<MetadataCache>,
    queries: QueryService,
    generator: Arc<dyn SqlGenerator>,
}

impl AppServices {
    /// Wire the native drivers and the HTTP text-generation client.
    pub fn new(config: Config, storage: Arc<SqliteStorage>) -> Self {
        let factory = Arc::new(NativeEngineFactory::new(config.engine.max_pool_size));
        let generator = Arc::new(LlmService::new(&config.llm));
        Self::with_components(config, storage, factory, generator)
    }

    pub fn with_components(
        config: Config,
        storage: Arc<SqliteStorage>,
        factory: Arc<dyn EngineFactory>,
        generator: Arc<dyn SqlGenerator>,
    ) -> Self {
        let engine = &config.engine;
        let pool = Arc::new(EnginePool::with_config(
            factory.clone(),
            engine.idle_timeout(),
            engine.sweep_interval(),
        ));
        let metadata = Arc::new(MetadataCache::new(storage.clone(), engine.metadata_ttl()));
        let registry = ConnectionRegistry::new(
            storage.clone(),
            factory,
            pool.clone(),
            metadata.clone(),
            engine.connect_timeout(),
        );
        let queries = QueryService::with_limits(storage, engine.query_timeout(), engine.default_limit);

        Self {
            config,
            registry,
            pool,
            metadata,
            queries,
            generator,
        }
    }

    /// Schema snapshot for a connection, from cache unless `refresh`.
    pub async fn schema(&self, name: &str, refresh: bool) -> Result<SchemaSnapshot, AppError> {
        let (connection, engine) = self.engine_for(name).await?;
        self.metadata.fetch(&connection, engine.as_ref(), refresh).await
    }

    pub async fn run_sql(&self, name: &str, sql: &str) -> Result<QueryResult, AppError> {
        let (connection, engine) = self.engine_for(name).await?;
        let result = self
            .queries
            .execute(&connection, engine.as_ref(), ExecutionRequest::sql(sql))
            .await?;
        self.touch(&connection).await;
        Ok(result)
    }

    /// Generate SQL from a prompt and, when `execute` is set, run it as a
    /// `natural` query. Generated SQL is always validated.
    pub async fn natural_query(
        &self,
        name: &str,
        prompt: &str,
        execute: bool,
    ) -> Result<NaturalQueryResponse, AppError> {
        let (connection, engine) = self.engine_for(name).await?;
        let snapshot = self.metadata.fetch(&connection, engine.as_ref(), false).await?;
        let context = format_schema_context(&snapshot, connection.dialect);

        let generated = self
            .generator
            .generate(prompt, &context, connection.dialect)
            .await?;

        let result = if execute {
            let result = self
                .queries
                .execute(
                    &connection,
                    engine.as_ref(),
                    ExecutionRequest::natural(&generated.sql, prompt),
                )
                .await?;
            self.touch(&connection).await;
            Some(result)
        } else {
            SqlValidator::validate(&generated.sql, connection.dialect)?;
            None
        };

        Ok(NaturalQueryResponse {
            generated_sql: generated.sql,
            explanation: generated.explanation,
            result,
        })
    }

    /// Ask the generator for query ideas, keeping only those that pass
    /// validation and were not already shown.
    pub async fn suggested_queries(
        &self,
        name: &str,
        params: &SuggestedQueriesParams,
    ) -> Result<SuggestedQueriesResponse, AppError> {
        let limit = params.limit()?;
        let exclude = params.excluded();
        let (connection, engine) = self.engine_for(name).await?;
        let snapshot = self.metadata.fetch(&connection, engine.as_ref(), false).await?;
        let context = format_schema_context(&snapshot, connection.dialect);

        let recent: Vec<String> = match self.queries.history(&connection, 1, SUGGESTION_HISTORY).await {
            Ok(page) => page
                .items
                .into_iter()
                .map(|item| item.input_text)
                .filter(|input| !input.trim().is_empty())
                .collect(),
            Err(e) => {
                tracing::warn!("Could not load history for suggestions on {}: {}", name, e);
                Vec::new()
            }
        };

        let proposed = self
            .generator
            .suggest(&SuggestionRequest {
                schema_context: &context,
                dialect: connection.dialect,
                limit,
                seed: params.seed,
                exclude: &exclude,
                recent: &recent,
            })
            .await?;

        let mut suggestions: Vec<SuggestedQuery> = Vec::with_capacity(limit);
        for suggestion in proposed {
            if exclude.contains(&suggestion.description)
                || suggestions
                    .iter()
                    .any(|kept| kept.description == suggestion.description)
            {
                continue;
            }
            if let Err(e) = SqlValidator::validate(&suggestion.sql, connection.dialect) {
                tracing::debug!("Dropping suggestion {:?}: {}", suggestion.description, e);
                continue;
            }
            suggestions.push(suggestion);
            if suggestions.len() == limit {
                break;
            }
        }

        Ok(SuggestedQueriesResponse { suggestions })
    }

    pub async fn history(&self, name: &str, params: &HistoryParams) -> Result<HistoryPage, AppError> {
        let connection = self.registry.get(name).await?;
        let (page, page_size) = params.normalized();
        self.queries.history(&connection, page, page_size).await
    }

    pub async fn history_summary(&self, name: &str) -> Result<HistorySummary, AppError> {
        let connection = self.registry.get(name).await?;
        self.queries.history_summary(&connection).await
    }

    pub async fn delete_history_item(&self, name: &str, id: i64) -> Result<(), AppError> {
        let connection = self.registry.get(name).await?;
        self.queries.delete_history_item(&connection, id).await
    }

    /// Delete the listed entries, or everything when no ids are given.
    pub async fn delete_history(&self, name: &str, request: &DeleteHistoryRequest) -> Result<usize, AppError> {
        let connection = self.registry.get(name).await?;
        match &request.ids {
            Some(ids) => self.queries.delete_history_batch(&connection, ids).await,
            None => self.queries.clear_history(&connection).await,
        }
    }

    /// Stop the idle sweep and release every pooled engine.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    async fn engine_for(&self, name: &str) -> Result<(Connection, Arc<dyn Engine>), AppError> {
        let (connection, driver_url) = self.registry.resolve(name).await?;
        let engine = self.pool.get(&connection.id, &driver_url).await?;
        Ok((connection, engine))
    }

    async fn touch(&self, connection: &Connection) {
        if let Err(e) = self.registry.mark_connected(&connection.id).await {
            tracing::warn!("Failed to update last connection time for {}: {}", connection.name, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{CreateConnectionRequest, QueryKind};
    use crate::services::testing::{rows, FakeFactory, FakeGenerator, Scripted};
    use serde_json::json;

    pub(crate) fn test_config() -> Config {
        Config {
            database: crate::config::DatabaseConfig {
                url: ":memory:".to_string(),
            },
            server: crate::config::ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
            },
            llm: crate::config::LlmConfig {
                gateway_url: String::new(),
                api_key: None,
                model: "glm-4-flash".to_string(),
            },
            engine: crate::config::EngineConfig {
                query_timeout_secs: 30,
                default_limit: 1000,
                idle_timeout_secs: 3600,
                sweep_interval_secs: 300,
                connect_timeout_secs: 10,
                max_pool_size: 2,
                metadata_ttl_secs: 3600,
            },
            logging: crate::config::LoggingConfig {
                level: "info".to_string(),
            },
        }
    }

    fn scripted_factory() -> FakeFactory {
        FakeFactory::default()
            .on(
                "sqlite_master",
                Scripted::Rows(rows(
                    &["name", "type", "sql"],
                    vec![vec![json!("users"), json!("table"), json!("CREATE TABLE users (id INTEGER)")]],
                )),
            )
            .on(
                "table_info('users')",
                Scripted::Rows(rows(
                    &["cid", "name", "type", "notnull", "dflt_value", "pk"],
                    vec![vec![json!(0), json!("id"), json!("INTEGER"), json!(1), json!(null), json!(1)]],
                )),
            )
            .on(
                "FROM users",
                Scripted::Rows(rows(&["count"], vec![vec![json!(3)]])),
            )
    }

    async fn services(generator: Arc<FakeGenerator>) -> (AppServices, Arc<FakeFactory>) {
        let storage = Arc::new(SqliteStorage::in_memory().await.unwrap());
        let factory = Arc::new(scripted_factory());
        let services = AppServices::with_components(test_config(), storage, factory.clone(), generator);
        services
            .registry
            .create(CreateConnectionRequest {
                name: "demo".to_string(),
                url: "sqlite:///data/demo.db".to_string(),
            })
            .await
            .unwrap();
        (services, factory)
    }

    #[tokio::test]
    async fn test_queries_reuse_the_pooled_engine() {
        let (services, factory) = services(Arc::new(FakeGenerator::returning("SELECT 1"))).await;

        services.run_sql("demo", "SELECT COUNT(*) FROM users").await.unwrap();
        services.run_sql("demo", "SELECT COUNT(*) FROM users").await.unwrap();
        services.schema("demo", false).await.unwrap();

        // one test engine plus one pooled engine
        assert_eq!(factory.created(), 2);
        services.close().await;
        assert!(factory.engines().iter().all(|engine| engine.is_closed()));
    }

    #[tokio::test]
    async fn test_natural_query_uses_schema_context() {
        let generator = Arc::new(FakeGenerator::returning("SELECT COUNT(*) FROM users"));
        let (services, _) = services(generator.clone()).await;

        let response = services
            .natural_query("demo", "how many users are there", true)
            .await
            .unwrap();
        assert_eq!(response.generated_sql, "SELECT COUNT(*) FROM users");
        assert_eq!(response.explanation.as_deref(), Some("fixed answer"));
        let result = response.result.unwrap();
        assert_eq!(result.rows[0]["count"], json!(3));

        assert!(generator.contexts()[0].contains("  - users"));

        let history = services
            .history("demo", &HistoryParams { page: 1, page_size: 20 })
            .await
            .unwrap();
        assert_eq!(history.items[0].kind, QueryKind::Natural);
        assert_eq!(history.items[0].input_text, "how many users are there");
        services.close().await;
    }

    #[tokio::test]
    async fn test_generated_write_is_rejected_without_execution() {
        let generator = Arc::new(FakeGenerator::returning("DELETE FROM users"));
        let (services, _) = services(generator).await;

        let result = services.natural_query("demo", "remove everyone", false).await;
        assert!(matches!(result, Err(AppError::NonSelectStatement { .. })));

        let result = services.natural_query("demo", "remove everyone", true).await;
        assert!(matches!(result, Err(AppError::NonSelectStatement { .. })));
        services.close().await;
    }

    #[tokio::test]
    async fn test_suggestions_drop_invalid_and_excluded() {
        let generator = Arc::new(FakeGenerator::returning("SELECT 1").suggesting(&[
            ("Count users", "SELECT COUNT(*) FROM users"),
            ("Remove users", "DELETE FROM users"),
            ("Broken", "SELEC id FROM users"),
            ("Already shown", "SELECT id FROM users"),
            ("Count users", "SELECT COUNT(id) FROM users"),
            ("Highest ids", "SELECT id FROM users ORDER BY id DESC"),
            ("Lowest ids", "SELECT id FROM users ORDER BY id"),
            ("Any user", "SELECT id FROM users LIMIT 1"),
        ]));
        let (services, _) = services(generator.clone()).await;
        services.run_sql("demo", "SELECT COUNT(*) FROM users").await.unwrap();

        let response = services
            .suggested_queries(
                "demo",
                &SuggestedQueriesParams {
                    limit: Some(3),
                    seed: Some(7),
                    exclude: Some("Already shown".to_string()),
                },
            )
            .await
            .unwrap();
        let descriptions: Vec<&str> = response
            .suggestions
            .iter()
            .map(|suggestion| suggestion.description.as_str())
            .collect();
        assert_eq!(descriptions, vec!["Count users", "Highest ids", "Lowest ids"]);

        assert!(generator.contexts()[0].contains("  - users"));
        assert_eq!(generator.recent_seen(), vec![vec!["SELECT COUNT(*) FROM users".to_string()]]);

        let result = services
            .suggested_queries(
                "demo",
                &SuggestedQueriesParams {
                    limit: Some(1),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(result, Err(AppError::Validation(_))));
        services.close().await;
    }

    #[tokio::test]
    async fn test_history_delete_by_ids_or_all() {
        let (services, _) = services(Arc::new(FakeGenerator::returning("SELECT 1"))).await;
        for _ in 0..3 {
            services.run_sql("demo", "SELECT COUNT(*) FROM users").await.unwrap();
        }

        let page = services
            .history("demo", &HistoryParams { page: 1, page_size: 20 })
            .await
            .unwrap();
        let first = page.items[0].id;

        let deleted = services
            .delete_history("demo", &DeleteHistoryRequest { ids: Some(vec![first]) })
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let summary = services.history_summary("demo").await.unwrap();
        assert_eq!(summary.total_count, 2);

        let cleared = services
            .delete_history("demo", &DeleteHistoryRequest::default())
            .await
            .unwrap();
        assert_eq!(cleared, 2);
        services.close().await;
    }

    #[tokio::test]
    async fn test_unknown_connection_is_not_found() {
        let (services, _) = services(Arc::new(FakeGenerator::returning("SELECT 1"))).await;
        assert!(matches!(
            services.run_sql("missing", "SELECT 1").await,
            Err(AppError::NotFound(_))
        ));
        assert!(matches!(
            services.schema("missing", false).await,
            Err(AppError::NotFound(_))
        ));
        services.close().await;
    }
}
