// Neo4j Driver
// Graph connector and pool factory built on neo4rs

use async_trait::async_trait;
use neo4rs::{query, Graph, Query, Row};

use super::{require_type, VALIDATION_TIMEOUT};
use crate::db::traits::{ConnectionFactory, DatabaseConfig, DatabaseError, DatabaseType};

/// Bolt URI from config: the explicit URI wins, otherwise `bolt://host:port`
pub fn build_bolt_uri(config: &DatabaseConfig) -> Result<String, DatabaseError> {
    if let Some(uri) = config.connection_uri.as_deref().filter(|u| !u.trim().is_empty()) {
        return Ok(uri.to_string());
    }
    let host = config
        .host
        .as_ref()
        .ok_or_else(|| DatabaseError::InvalidConfig("URI or host is required".to_string()))?;
    Ok(format!("bolt://{}:{}", host, config.get_port()))
}

pub struct Neo4jConnector {
    graph: Graph,
    uri: String,
}

impl Neo4jConnector {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let uri = build_bolt_uri(config)?;
        let user = config.username.clone().unwrap_or_default();
        let graph = Graph::new(uri.as_str(), user, config.password.clone())
            .await
            .map_err(|e| DatabaseError::ConnectionFailed(format!("Neo4j connection failed: {}", e)))?;

        tracing::info!(server = %config.describe(), "Connected to Neo4j");
        Ok(Self { graph, uri })
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// `RETURN 1` bounded by the validation timeout
    pub async fn is_alive(&self) -> bool {
        let ping = async {
            let mut rows = self.graph.execute(query("RETURN 1 AS ping")).await?;
            rows.next().await
        };
        matches!(tokio::time::timeout(VALIDATION_TIMEOUT, ping).await, Ok(Ok(Some(_))))
    }

    pub async fn disconnect(self) {
        // neo4rs closes its sockets when the graph handle is dropped
        drop(self.graph);
        tracing::debug!(server = %self.uri, "Neo4j connection closed");
    }

    /// Run a statement and discard any results
    pub async fn run(&self, statement: Query) -> Result<(), DatabaseError> {
        self.graph.run(statement).await?;
        Ok(())
    }

    /// Run a statement and collect every returned row
    pub async fn execute(&self, statement: Query) -> Result<Vec<Row>, DatabaseError> {
        let mut stream = self.graph.execute(statement).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}

/// Opens pooled Neo4j graph handles
pub struct Neo4jConnectionFactory {
    config: DatabaseConfig,
}

impl Neo4jConnectionFactory {
    pub fn new(config: DatabaseConfig) -> Result<Self, DatabaseError> {
        require_type(&config, DatabaseType::Neo4j)?;
        Ok(Self { config })
    }
}

#[async_trait]
impl ConnectionFactory for Neo4jConnectionFactory {
    type Connection = Neo4jConnector;

    fn database_type(&self) -> DatabaseType {
        DatabaseType::Neo4j
    }

    async fn create(&self) -> Result<Neo4jConnector, DatabaseError> {
        Neo4jConnector::connect(&self.config).await
    }

    async fn is_valid(&self, conn: &mut Neo4jConnector) -> bool {
        conn.is_alive().await
    }

    async fn close(&self, conn: Neo4jConnector) {
        conn.disconnect().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> DatabaseConfig {
        let mut config = DatabaseConfig::new("Graph".to_string(), DatabaseType::Neo4j);
        config.username = Some("neo4j".to_string());
        config.password = "password".to_string();
        config
    }

    #[test]
    fn test_bolt_uri_from_host() {
        let mut config = test_config();
        config.host = Some("graph.local".to_string());
        assert_eq!(build_bolt_uri(&config).unwrap(), "bolt://graph.local:7687");
    }

    #[test]
    fn test_explicit_uri_wins() {
        let mut config = test_config();
        config.host = Some("graph.local".to_string());
        config.connection_uri = Some("neo4j+s://abc.databases.neo4j.io".to_string());
        assert_eq!(build_bolt_uri(&config).unwrap(), "neo4j+s://abc.databases.neo4j.io");
    }

    #[test]
    fn test_factory_requires_username() {
        let mut config = test_config();
        config.connection_uri = Some("bolt://localhost:7687".to_string());
        config.username = None;
        assert!(Neo4jConnectionFactory::new(config).is_err());
    }
}
