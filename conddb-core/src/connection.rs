//! Connection string parsing.
//!
//! Two forms are recognised:
//!
//! ```text
//! <backend>://<host>;schema=<schema>;dbname=<database>;[user=<user>;][password=<password>;]
//! <hostAlias>/<database>
//! ```

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionString {
    Full {
        backend: String,
        host: String,
        schema: String,
        dbname: String,
        user: Option<String>,
        password: Option<String>,
    },
    Alias {
        host_alias: String,
        database: String,
    },
}

impl ConnectionString {
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let s = s.trim();
        if let Some((backend, rest)) = s.split_once("://") {
            return Self::parse_full(s, backend, rest);
        }
        match s.split_once('/') {
            Some((alias, database))
                if !alias.is_empty() && !database.is_empty() && !database.contains('/') =>
            {
                Ok(ConnectionString::Alias {
                    host_alias: alias.to_string(),
                    database: database.to_string(),
                })
            }
            _ => Err(invalid(s, "expected <backend>://... or <hostAlias>/<database>")),
        }
    }

    fn parse_full(original: &str, backend: &str, rest: &str) -> Result<Self, ConfigError> {
        if backend.is_empty() {
            return Err(invalid(original, "missing backend name"));
        }
        let mut parts = rest.split(';').map(str::trim).filter(|p| !p.is_empty());
        let host = parts
            .next()
            .filter(|h| !h.contains('='))
            .ok_or_else(|| invalid(original, "missing host"))?;

        let (mut schema, mut dbname, mut user, mut password) = (None, None, None, None);
        for part in parts {
            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| invalid(original, "expected key=value"))?;
            let value = value.trim().to_string();
            match key.trim() {
                "schema" => schema = Some(value),
                "dbname" => dbname = Some(value),
                "user" => user = Some(value),
                "password" => password = Some(value),
                other => {
                    return Err(invalid(original, &format!("unknown key {}", other)));
                }
            }
        }

        Ok(ConnectionString::Full {
            backend: backend.to_string(),
            host: host.to_string(),
            schema: schema.ok_or_else(|| invalid(original, "missing schema"))?,
            dbname: dbname.ok_or_else(|| invalid(original, "missing dbname"))?,
            user,
            password,
        })
    }

    /// Backend scheme, if the full form was used.
    pub fn backend(&self) -> Option<&str> {
        match self {
            ConnectionString::Full { backend, .. } => Some(backend),
            ConnectionString::Alias { .. } => None,
        }
    }

    pub fn database(&self) -> &str {
        match self {
            ConnectionString::Full { dbname, .. } => dbname,
            ConnectionString::Alias { database, .. } => database,
        }
    }
}

fn invalid(value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        field: "connection_string".to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

impl FromStr for ConnectionString {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Renders the connection string with the password masked.
impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionString::Full {
                backend,
                host,
                schema,
                dbname,
                user,
                password,
            } => {
                write!(f, "{}://{};schema={};dbname={};", backend, host, schema, dbname)?;
                if let Some(user) = user {
                    write!(f, "user={};", user)?;
                }
                if password.is_some() {
                    write!(f, "password=***;")?;
                }
                Ok(())
            }
            ConnectionString::Alias {
                host_alias,
                database,
            } => write!(f, "{}/{}", host_alias, database),
        }
    }
}
