use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use gatehouse_auth::AuthenticationConfig;
use gatehouse_policy::{DatastoreSchema, SqlDialect, TableRef};
use serde::Deserialize;
use thiserror::Error;

use crate::config::StartupError;

pub const POSTGRES: &str = "postgres";
pub const MYSQL: &str = "mysql";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },

    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn code(&self) -> &'static str {
        match self {
            ConfigError::Read { .. } => "ERR_CONFIG_FILE_READ",
            ConfigError::Parse { .. } => "ERR_CONFIG_FILE_PARSE",
            ConfigError::Invalid(_) => "ERR_INVALID_CONFIG",
        }
    }
}

impl From<ConfigError> for StartupError {
    fn from(err: ConfigError) -> Self {
        StartupError::new(err.code(), err.to_string())
    }
}

/// `api.yml`: authentication policies and route mappings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default)]
    pub authentication: BTreeMap<String, AuthenticationConfig>,
    #[serde(default)]
    pub mappings: Vec<DatastoreMapping>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatastoreMapping {
    #[serde(default)]
    pub prefix: String,
    pub datastore: String,
    #[serde(default)]
    pub mappings: Vec<RouteMapping>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteMapping {
    pub path: String,
    pub package: String,
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub queries: Vec<String>,
}

/// `datastore.yml`: connections and the entities policies may reference.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatastoreConfig {
    #[serde(default)]
    pub datastores: BTreeMap<String, DatastoreDefinition>,
    #[serde(default)]
    pub entity_schemas: BTreeMap<String, BTreeMap<String, EntitySchema>>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatastoreDefinition {
    #[serde(rename = "type")]
    pub kind: String,
    pub connection: Connection,
}

impl DatastoreDefinition {
    /// `None` for datastore types without a SQL driver.
    pub fn dialect(&self) -> Option<SqlDialect> {
        match self.kind.as_str() {
            POSTGRES => Some(SqlDialect::Postgres),
            MYSQL => Some(SqlDialect::Mysql),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Connection {
    pub url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntitySchema {
    #[serde(default)]
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Entity {
    pub name: String,
    #[serde(default)]
    pub alias: Option<String>,
}

impl Entity {
    pub fn policy_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppConfig {
    pub api: ApiConfig,
    pub data: DatastoreConfig,
}

impl AppConfig {
    pub fn load(api_path: &Path, datastore_path: &Path) -> Result<Self, ConfigError> {
        let api = read_yaml::<ApiConfig>(api_path)?;
        let data = read_yaml::<DatastoreConfig>(datastore_path)?;
        let config = Self { api, data };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(api: &str, datastore: &str) -> Result<Self, ConfigError> {
        let api = serde_yaml::from_str::<ApiConfig>(api).map_err(|err| ConfigError::Parse {
            path: "api config".to_string(),
            reason: err.to_string(),
        })?;
        let data =
            serde_yaml::from_str::<DatastoreConfig>(datastore).map_err(|err| ConfigError::Parse {
                path: "datastore config".to_string(),
                reason: err.to_string(),
            })?;
        let config = Self { api, data };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (alias, definition) in &self.data.datastores {
            if definition.dialect().is_none() {
                return Err(ConfigError::Invalid(format!(
                    "datastore `{}` has unsupported type `{}`",
                    alias, definition.kind
                )));
            }
            if definition.connection.url.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "datastore `{}` has an empty connection url",
                    alias
                )));
            }
        }

        for alias in self.data.entity_schemas.keys() {
            if !self.data.datastores.contains_key(alias) {
                return Err(ConfigError::Invalid(format!(
                    "entity schemas reference unknown datastore `{}`",
                    alias
                )));
            }
        }

        Ok(())
    }

    /// Entity schemas keyed by datastore alias. Two entities claiming the same
    /// policy name in one datastore is a configuration error.
    pub fn datastore_schemas(&self) -> Result<HashMap<String, DatastoreSchema>, ConfigError> {
        let mut out = HashMap::with_capacity(self.data.datastores.len());
        for (alias, definition) in &self.data.datastores {
            let mut schema =
                DatastoreSchema::with_dialect(definition.dialect().unwrap_or_default());
            if let Some(schemas) = self.data.entity_schemas.get(alias) {
                for (schema_name, entities) in schemas {
                    for entity in &entities.entities {
                        let previous = schema.insert(
                            entity.policy_name(),
                            TableRef::new(schema_name, &entity.name),
                        );
                        if previous.is_some() {
                            return Err(ConfigError::Invalid(format!(
                                "datastore `{}` declares entity `{}` more than once",
                                alias,
                                entity.policy_name()
                            )));
                        }
                    }
                }
            }
            out.insert(alias.clone(), schema);
        }
        Ok(out)
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|err| ConfigError::Read {
        path: path.display().to_string(),
        reason: err.to_string(),
    })?;
    serde_yaml::from_str::<T>(&raw).map_err(|err| ConfigError::Parse {
        path: path.display().to_string(),
        reason: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const API: &str = r#"
authentication:
  default:
    trusted_issuers: ["https://issuer.example"]
    allowed_algorithms: ["RS256"]
    scope_strategy: hierarchic
    jwks_urls: ["https://issuer.example/jwks.json"]
mappings:
  - prefix: /api
    datastore: db1
    mappings:
      - path: /pets/{id}
        package: pets
        methods: [GET]
        queries: [owner]
"#;

    const DATASTORES: &str = r#"
datastores:
  db1:
    type: postgres
    connection:
      url: postgres://gatehouse@localhost/petstore
entity_schemas:
  db1:
    petstore:
      entities:
        - name: pets
        - name: pet_owners
          alias: owners
"#;

    #[test]
    fn parses_api_and_datastore_yaml() {
        let config = AppConfig::from_yaml(API, DATASTORES).expect("config parses");

        let auth = &config.api.authentication["default"];
        assert_eq!(auth.jwks_ttl_secs, gatehouse_auth::DEFAULT_JWKS_TTL_SECS);
        assert_eq!(
            auth.scope_strategy,
            Some(gatehouse_auth::ScopeStrategyKind::Hierarchic)
        );

        let route = &config.api.mappings[0].mappings[0];
        assert_eq!(route.methods, vec!["GET".to_string()]);
        assert_eq!(route.queries, vec!["owner".to_string()]);

        let schemas = config.datastore_schemas().expect("schemas");
        let owners = schemas["db1"].resolve("owners").expect("alias resolves");
        assert_eq!(owners, &TableRef::new("petstore", "pet_owners"));
        assert!(schemas["db1"].resolve("pet_owners").is_none());
    }

    #[test]
    fn unsupported_datastore_type_is_rejected() {
        let raw = DATASTORES.replace("type: postgres", "type: mongo");
        let err = AppConfig::from_yaml(API, &raw).unwrap_err();
        assert_eq!(err.code(), "ERR_INVALID_CONFIG");
    }

    #[test]
    fn mysql_datastores_get_the_mysql_dialect() {
        let raw = DATASTORES
            .replace("type: postgres", "type: mysql")
            .replace("postgres://gatehouse@localhost/petstore", "mysql://gatehouse@localhost/petstore");
        let config = AppConfig::from_yaml(API, &raw).expect("mysql is a supported type");

        let schemas = config.datastore_schemas().expect("schemas");
        assert_eq!(schemas["db1"].dialect(), SqlDialect::Mysql);
        assert_eq!(
            AppConfig::from_yaml(API, DATASTORES)
                .expect("postgres")
                .datastore_schemas()
                .expect("schemas")["db1"]
                .dialect(),
            SqlDialect::Postgres
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let raw = format!("{}\nunexpected: true\n", API);
        let err = AppConfig::from_yaml(&raw, DATASTORES).unwrap_err();
        assert_eq!(err.code(), "ERR_CONFIG_FILE_PARSE");
    }

    #[test]
    fn duplicate_entity_names_are_rejected() {
        let raw = DATASTORES.replace("alias: owners", "alias: pets");
        let config = AppConfig::from_yaml(API, &raw).expect("parses");
        assert!(config.datastore_schemas().is_err());
    }
}
