//! Connection-related data models.
//!
//! This module defines the supported backend kinds and the parsing of
//! connection URLs into a backend selection.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use url::Url;

/// Supported database families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    PostgreSQL,
    /// Includes MariaDB
    MySQL,
    SQLite,
}

impl BackendKind {
    /// Get the display name for this backend.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::MySQL => "MySQL",
            Self::SQLite => "SQLite",
        }
    }

    fn from_family(family: &str) -> Option<Self> {
        match family {
            "postgres" | "postgresql" => Some(Self::PostgreSQL),
            "mysql" | "mariadb" => Some(Self::MySQL),
            "sqlite" => Some(Self::SQLite),
            _ => None,
        }
    }

    /// The scheme the underlying driver expects.
    fn driver_scheme(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "postgres",
            Self::MySQL => "mysql",
            Self::SQLite => "sqlite",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Driver implementations a backend-qualified scheme may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Sqlx,
}

impl DriverKind {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sqlx" => Some(Self::Sqlx),
            _ => None,
        }
    }
}

/// A parsed connection URL: backend family, driver and the URL handed to it.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionUrl {
    pub backend: BackendKind,
    pub driver: DriverKind,
    /// Driver-facing URL with the `+driver` qualifier removed.
    driver_url: String,
}

impl ConnectionUrl {
    /// Parse a connection URL.
    ///
    /// `postgres://`, `postgresql://`, `mysql://`, `mariadb://` and `sqlite:`
    /// select the default driver for their family; `postgres+sqlx://` and the
    /// like select a driver explicitly. Anything else fails.
    pub fn parse(url: &str) -> DbResult<Self> {
        let scheme_end = url
            .find(':')
            .ok_or_else(|| DbError::configuration("Connection URL has no scheme"))?;
        let scheme = url[..scheme_end].to_ascii_lowercase();
        let (family, driver) = match scheme.split_once('+') {
            Some((family, driver)) => (family.to_string(), Some(driver.to_string())),
            None => (scheme.clone(), None),
        };

        let backend = BackendKind::from_family(&family).ok_or_else(|| {
            DbError::configuration(format!("'{}' is not a supported backend", scheme))
        })?;
        let driver = match driver {
            Some(name) => DriverKind::from_name(&name).ok_or_else(|| {
                DbError::configuration(format!(
                    "'{}' is not a supported driver for {}",
                    name, backend
                ))
            })?,
            None => DriverKind::Sqlx,
        };

        let driver_url = format!("{}{}", backend.driver_scheme(), &url[scheme_end..]);
        if backend != BackendKind::SQLite {
            Url::parse(&driver_url)
                .map_err(|e| DbError::configuration(format!("Invalid URL: {e}")))?;
        }

        Ok(Self {
            backend,
            driver,
            driver_url,
        })
    }

    /// The URL passed to the driver.
    pub fn driver_url(&self) -> &str {
        &self.driver_url
    }

    /// A display-safe version of the URL (password masked).
    pub fn masked(&self) -> String {
        if let Some(at_pos) = self.driver_url.find('@') {
            if let Some(colon_pos) = self.driver_url[..at_pos].rfind(':') {
                // Only mask when the colon belongs to user:pass, not the scheme
                if self.driver_url[..colon_pos].contains("//") {
                    let prefix = &self.driver_url[..colon_pos + 1];
                    let suffix = &self.driver_url[at_pos..];
                    return format!("{}****{}", prefix, suffix);
                }
            }
        }
        self.driver_url.clone()
    }
}

impl std::fmt::Debug for ConnectionUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionUrl")
            .field("backend", &self.backend)
            .field("driver", &self.driver)
            .field("url", &self.masked())
            .finish()
    }
}
