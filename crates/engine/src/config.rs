use jobmill_core::messages::EsConnection;

/// Engine configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development. In
/// production, override via environment variables (callers typically run
/// `dotenvy` before constructing the engine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Host of the external data service, forwarded to child processes.
    pub es_host: String,
    /// Port of the external data service.
    pub es_port: u16,
    /// Interpreter used to create task environments (default: `python3`).
    pub python_bin: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            es_host: "localhost".into(),
            es_port: 9200,
            python_bin: "python3".into(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var      | Default     |
    /// |--------------|-------------|
    /// | `ES_HOST`    | `localhost` |
    /// | `ES_PORT`    | `9200`      |
    /// | `PYTHON_BIN` | `python3`   |
    pub fn from_env() -> Self {
        let es_host = std::env::var("ES_HOST").unwrap_or_else(|_| "localhost".into());

        let es_port: u16 = std::env::var("ES_PORT")
            .unwrap_or_else(|_| "9200".into())
            .parse()
            .expect("ES_PORT must be a valid u16");

        let python_bin = std::env::var("PYTHON_BIN").unwrap_or_else(|_| "python3".into());

        Self {
            es_host,
            es_port,
            python_bin,
        }
    }

    /// Connection info embedded into every initial payload.
    pub fn es_connection(&self) -> EsConnection {
        EsConnection {
            host: self.es_host.clone(),
            port: self.es_port.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_local_development() {
        let config = EngineConfig::default();
        assert_eq!(config.es_host, "localhost");
        assert_eq!(config.es_port, 9200);
        assert_eq!(config.python_bin, "python3");
    }

    #[test]
    fn es_connection_sends_the_port_as_a_string() {
        let config = EngineConfig {
            es_port: 9300,
            ..EngineConfig::default()
        };
        let es = config.es_connection();
        assert_eq!(es.port, "9300");
    }
}
