//! Unit tests for configuration.

#[cfg(test)]
mod path_expansion_tests {
    use super::super::Config;
    use std::path::PathBuf;

    #[test]
    fn expand_path_handles_tilde() {
        let result = Config::expand_path("~/test");
        // Should not start with ~ after expansion
        assert!(!result.to_string_lossy().starts_with('~'));
    }

    #[test]
    fn expand_path_handles_absolute_path() {
        let result = Config::expand_path("/absolute/path");
        assert_eq!(result, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn expand_path_handles_env_vars() {
        temp_env::with_var("ASKSQL_TEST_VAR", Some("/test/path"), || {
            let result = Config::expand_path("$ASKSQL_TEST_VAR/subdir");
            assert!(result.to_string_lossy().contains("/test/path"));
        });
    }
}

#[cfg(test)]
mod default_config_tests {
    use super::super::Config;

    #[test]
    fn default_has_database_paths() {
        let config = Config::default();
        assert!(config.database.to_string_lossy().contains("asksql"));
        assert!(config.database.to_string_lossy().ends_with(".db"));
        assert!(config.warehouse.path.to_string_lossy().ends_with("analytics.db"));
    }

    #[test]
    fn default_llm_is_openai_compatible() {
        let config = Config::default();
        assert_eq!(config.llm.provider, "openai");
        assert!(config.llm.api_key.is_none());
        assert!(config.llm.base_url.is_empty());
    }

    #[test]
    fn default_index_uses_local_embedder() {
        let config = Config::default();
        assert!(config.index.embedding_endpoint.is_none());
        assert_eq!(config.index.top_k, 5);
        assert!(config.index.dimensions > 0);
    }

    #[test]
    fn default_pipeline_keeps_three_exchanges() {
        let config = Config::default();
        assert_eq!(config.pipeline.history_turns, 6);
        assert_eq!(config.pipeline.synthesis_row_cap, 20);
    }
}

#[cfg(test)]
mod load_tests {
    use super::super::Config;
    use std::path::PathBuf;

    fn write_config(dir: &tempfile::TempDir, body: &str) -> PathBuf {
        let path = dir.path().join("config.toml");
        std::fs::write(&path, body).expect("write config");
        path
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            &dir,
            r#"
database = "/tmp/asksql-sessions.db"

[llm]
provider = "groq"
model = "llama-3.1-8b-instant"
"#,
        );

        let config = temp_env::with_vars_unset(["ASKSQL_LLM__MODEL", "ASKSQL_LLM__PROVIDER"], || {
            Config::load_from_path(&path)
        })
        .expect("load");
        assert_eq!(config.database, PathBuf::from("/tmp/asksql-sessions.db"));
        assert_eq!(config.llm.provider, "groq");
        assert_eq!(config.llm.model, "llama-3.1-8b-instant");
        assert_eq!(config.llm.max_tokens, 2000);
        assert_eq!(config.warehouse.max_rows, 1000);
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            &dir,
            r#"
[llm]
model = "from-file"
"#,
        );

        let config = temp_env::with_vars(
            [
                ("ASKSQL_LLM__MODEL", Some("from-env")),
                ("ASKSQL_INDEX__TOP_K", Some("3")),
            ],
            || Config::load_from_path(&path),
        )
        .expect("load");
        assert_eq!(config.llm.model, "from-env");
        assert_eq!(config.index.top_k, 3);
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::load_from_path(&dir.path().join("absent.toml")).expect("load");
        assert_eq!(config.pipeline.history_turns, 6);
    }

    #[test]
    fn zero_row_cap_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = write_config(
            &dir,
            r#"
[warehouse]
max_rows = 0
"#,
        );
        assert!(Config::load_from_path(&path).is_err());
    }

    #[test]
    fn ensure_at_creates_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");
        let config = Config::ensure_at(&path).expect("ensure");
        assert!(path.exists());
        assert_eq!(config.llm.provider, "openai");
    }
}
