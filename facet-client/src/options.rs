//! Connection options.

use std::time::Duration;

/// Client version string sent with LOGIN.
pub const CLIENT_VERSION: &str = concat!("facet-rust/", env!("CARGO_PKG_VERSION"));

/// Default timeout for the dial + LOGIN round-trip.
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default network timeout for calls issued by the transport itself
/// (ping, fetch, close-results).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Server address, `host:port`.
    pub addr: String,
    /// Credentials for LOGIN (empty strings when the server runs open).
    pub username: String,
    pub password: String,
    /// Database to open.
    pub database: String,
    /// Create the database on LOGIN if it does not exist.
    pub create_db_if_missing: bool,
    /// Timeout for dial + LOGIN. Zero disables it.
    pub login_timeout: Duration,
    /// Default network timeout for the transport's own calls. Zero
    /// disables it.
    pub request_timeout: Duration,
    /// Opt in to snappy compression; still subject to the server's
    /// announced protocol version.
    pub enable_compression: bool,
    /// Application name reported at LOGIN.
    pub app_name: String,
    /// Client version reported at LOGIN.
    pub client_version: String,
}

impl ConnectOptions {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            username: String::new(),
            password: String::new(),
            database: String::new(),
            create_db_if_missing: false,
            login_timeout: DEFAULT_LOGIN_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            enable_compression: false,
            app_name: "facet-client".to_string(),
            client_version: CLIENT_VERSION.to_string(),
        }
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = database.into();
        self
    }

    pub fn with_create_db_if_missing(mut self) -> Self {
        self.create_db_if_missing = true;
        self
    }

    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_compression(mut self) -> Self {
        self.enable_compression = true;
        self
    }

    pub fn with_app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = ConnectOptions::new("127.0.0.1:6534");
        assert_eq!(opts.login_timeout, DEFAULT_LOGIN_TIMEOUT);
        assert_eq!(opts.request_timeout, DEFAULT_REQUEST_TIMEOUT);
        assert!(!opts.enable_compression);
        assert!(!opts.create_db_if_missing);
        assert_eq!(opts.client_version, CLIENT_VERSION);
    }

    #[test]
    fn test_builders() {
        let opts = ConnectOptions::new("db.internal:6534")
            .with_credentials("reader", "hunter2")
            .with_database("events")
            .with_create_db_if_missing()
            .with_compression();
        assert_eq!(opts.username, "reader");
        assert_eq!(opts.database, "events");
        assert!(opts.create_db_if_missing);
        assert!(opts.enable_compression);
    }
}
