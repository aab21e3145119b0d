//! 🔧 App Configuration — the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." — every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! 🧠 Knowledge graph:
//! - `listener` — where the line protocol comes in (`[in]` still works, old habits die hard)
//! - `sink_config` — where the datapoints go out (Elasticsearch, or RAM for tests)
//! - `runtime` — queue size, indexer count, batching and retry knobs
//! - `[elasticsearch] host/port/max_pending` — the pre-carbex layout, folded into the above

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, ensure};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::Deserialize;
use tracing::info;

// 🔄 re-exported so callers can name it without reaching into the backends
pub use crate::backends::elasticsearch::ElasticsearchSinkConfig;

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// 📡 The inbound TCP side. Aliased to `in` for configs older than this crate.
    #[serde(default, alias = "in")]
    pub listener: ListenerConfig,
    /// 🚰 Where the batches land.
    pub sink_config: SinkConfig,
    /// ⚙️ The pipeline's knobs and dials.
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 🎭 Which backend the indexers talk to.
#[derive(Debug, Deserialize, Clone)]
pub enum SinkConfig {
    /// 📡 A real cluster, via the `_bulk` API.
    #[serde(alias = "elasticsearch")]
    Elasticsearch(ElasticsearchSinkConfig),
    /// 🧪 Keep everything in RAM. Dry runs and tests only.
    #[serde(alias = "in_memory", alias = "inmemory")]
    InMemory,
}

/// 📡 The listening socket and how much a single line may weigh.
#[derive(Debug, Deserialize, Clone)]
pub struct ListenerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// 🔌 2003: the port carbon clients have been dialing since before some of us were hired.
    #[serde(default = "default_port")]
    pub port: u16,
    /// ⚠️ Per-connection line cap. Longer lines are reported and thrown away.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    2003
}

// -- 64 KiB. A metric name longer than this is not a metric name, it's a cry for help.
fn default_max_line_bytes() -> usize {
    64 * 1024
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

impl ListenerConfig {
    /// 🎯 `bind_address:port`, ready for `TcpListener::bind`.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }
}

/// ⚙️ Runtime knobs — formerly known by other names, still answering to them.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// 🚰 Ingestion queue capacity. Full queue = handlers wait.
    #[serde(default = "default_max_pending", alias = "queue_capacity")]
    pub max_pending: usize,
    /// 🧵 How many indexer workers drain the queue.
    #[serde(default = "default_indexer_concurrency", alias = "sink_parallelism")]
    pub indexer_concurrency: usize,
    /// 📦 Max datapoints per bulk request.
    #[serde(default = "default_max_batch_docs")]
    pub max_batch_docs: usize,
    /// ⏱️ How long an indexer waits to fill a batch before sending a partial one.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// 🔄 Retries per batch before the whole process gives up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_retry_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
    /// 📊 Seconds between stats log lines. 0 = silence.
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,
}

// -- a million pending datapoints: roughly a few hundred MB if the backend takes a nap
fn default_max_pending() -> usize {
    1_000_000
}

fn default_indexer_concurrency() -> usize {
    4
}

fn default_max_batch_docs() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_retry_backoff_max_ms() -> u64 {
    10_000
}

fn default_stats_interval_secs() -> u64 {
    60
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            indexer_concurrency: default_indexer_concurrency(),
            max_batch_docs: default_max_batch_docs(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            retry_backoff_max_ms: default_retry_backoff_max_ms(),
            stats_interval_secs: default_stats_interval_secs(),
        }
    }
}

impl RuntimeConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    /// `None` when periodic stats are switched off.
    pub fn stats_interval(&self) -> Option<Duration> {
        (self.stats_interval_secs > 0).then(|| Duration::from_secs(self.stats_interval_secs))
    }
}

impl AppConfig {
    /// 🔒 Reject configs that would deadlock, spin, or panic later.
    pub fn validate(&self) -> anyhow::Result<()> {
        let runtime = &self.runtime;
        ensure!(
            runtime.max_pending > 0,
            "💀 runtime.max_pending must be at least 1. A queue that holds nothing is a wall."
        );
        ensure!(
            runtime.indexer_concurrency > 0,
            "💀 runtime.indexer_concurrency must be at least 1, or nobody drains the queue."
        );
        ensure!(
            runtime.max_batch_docs > 0,
            "💀 runtime.max_batch_docs must be at least 1. Empty bulk requests help no one."
        );
        ensure!(
            runtime.retry_backoff_ms <= runtime.retry_backoff_max_ms,
            "💀 runtime.retry_backoff_ms ({}) is larger than runtime.retry_backoff_max_ms ({}).",
            runtime.retry_backoff_ms,
            runtime.retry_backoff_max_ms
        );
        ensure!(
            self.listener.max_line_bytes > 0,
            "💀 listener.max_line_bytes must be at least 1."
        );
        if let SinkConfig::Elasticsearch(es) = &self.sink_config {
            es.validate()?;
        }
        Ok(())
    }
}

/// 🚀 Load the config — from a file, from env vars, or from the sheer power of hoping.
///
/// 🔧 Merges environment variables (`CARBEX_*`, nested keys split on `__`) with an
/// optional TOML file. TOML wins on conflicts. The result is validated before it
/// leaves this function, so a config that loads is a config that can run.
///
/// e.g. `CARBEX_RUNTIME__MAX_PENDING=5000` sets `runtime.max_pending`.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    // 🏗️ Env vars are the base layer. Like a good sourdough starter.
    let config = Figment::new().merge(Env::prefixed("CARBEX_").split("__"));

    // 🎯 Layer in TOML only if a file was actually provided.
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (CARBEX_*). \
             The file exists in our hearts, but apparently not on disk, or not in valid TOML.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (CARBEX_*). \
                 No file was provided — this one's all on the environment. Classic."
            .to_string(),
    };

    extract_config(config, context_msg)
}

/// ✅ or 💀 — pull an `AppConfig` out of whatever providers were stacked up, then validate it.
fn extract_config(figment: Figment, context_msg: String) -> anyhow::Result<AppConfig> {
    let app_config: AppConfig = with_legacy_layout(figment)
        .extract()
        .context(context_msg)?;
    app_config
        .validate()
        .context("💀 The configuration parsed, but it does not make sense. See the cause below.")?;
    Ok(app_config)
}

/// 🦖 Fold the old `[elasticsearch] host/port/max_pending` section into
/// `sink_config.Elasticsearch` and `runtime.max_pending`. Anything already set
/// the current way wins.
fn with_legacy_layout(mut figment: Figment) -> Figment {
    if !figment.contains("sink_config") {
        for key in ["host", "port"] {
            if let Ok(value) = figment.find_value(&format!("elasticsearch.{key}")) {
                figment = figment.join(Serialized::default(
                    &format!("sink_config.Elasticsearch.{key}"),
                    value,
                ));
            }
        }
    }
    // -- `queue_capacity` is an alias; joining `max_pending` next to it would be a duplicate
    let queue_size_already_set =
        figment.contains("runtime.max_pending") || figment.contains("runtime.queue_capacity");
    let legacy_queue_size = figment
        .find_value("elasticsearch.max_pending")
        .ok()
        .filter(|_| !queue_size_already_set);
    if let Some(value) = legacy_queue_size {
        figment = figment.join(Serialized::default("runtime.max_pending", value));
    }
    figment
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_test_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .prefix("carbex_app_config_")
            .suffix(".toml")
            .tempfile()
            .expect("💀 Failed to create a temp file. The filesystem said 'new phone who dis'.");
        // 🧪 Figment wants TOML from disk, like it's method acting.
        file.write_all(contents.as_bytes())
            .expect("💀 Failed to write test config.");
        file
    }

    // -- 🔒 file-only loader so the env vars set inside a Jail can't leak into parallel tests
    fn load_file(path: &Path) -> anyhow::Result<AppConfig> {
        extract_config(
            Figment::new().merge(Toml::file(path)),
            "💀 test config did not parse".to_string(),
        )
    }

    #[test]
    fn the_one_where_every_knob_is_turned() {
        let config_file = write_test_config(
            r#"
            [listener]
            bind_address = "127.0.0.1"
            port = 12003
            max_line_bytes = 512

            [runtime]
            max_pending = 8
            indexer_concurrency = 3
            max_batch_docs = 50
            flush_interval_ms = 20
            max_retries = 2
            retry_backoff_ms = 5
            retry_backoff_max_ms = 40
            stats_interval_secs = 0

            [sink_config.Elasticsearch]
            host = "es.internal"
            port = 9201
            index = "metrics"
            doc_type = "datapoint"
            compress_requests = true
            "#,
        );

        let app_config = load_file(config_file.path())
            .expect("💀 A fully specified config should parse.");

        assert_eq!(app_config.listener.bind_addr(), "127.0.0.1:12003");
        assert_eq!(app_config.listener.max_line_bytes, 512);
        assert_eq!(app_config.runtime.max_pending, 8);
        assert_eq!(app_config.runtime.indexer_concurrency, 3);
        assert_eq!(app_config.runtime.max_batch_docs, 50);
        assert_eq!(app_config.runtime.flush_interval(), Duration::from_millis(20));
        assert_eq!(app_config.runtime.max_retries, 2);
        assert_eq!(app_config.runtime.stats_interval(), None);
        match app_config.sink_config {
            SinkConfig::Elasticsearch(es) => {
                assert_eq!(es.base_url(), "http://es.internal:9201");
                assert_eq!(es.index, "metrics");
                assert_eq!(es.doc_type.as_deref(), Some("datapoint"));
                assert!(es.compress_requests);
            }
            honestly_who_knows => panic!(
                "💀 Expected Elasticsearch sink config, but serde took us to {:?}. Plot twist energy.",
                honestly_who_knows
            ),
        }
    }

    #[test]
    fn the_one_where_defaults_show_up_uninvited_but_helpful() {
        let config_file = write_test_config(
            r#"
            [sink_config.Elasticsearch]
            host = "localhost"
            "#,
        );

        let app_config = load_file(config_file.path())
            .expect("💀 Defaults should fill every gap.");

        assert_eq!(app_config.listener.port, 2003);
        assert_eq!(app_config.listener.bind_address, "0.0.0.0");
        assert_eq!(app_config.runtime.max_pending, 1_000_000);
        assert_eq!(app_config.runtime.indexer_concurrency, 4);
        assert_eq!(app_config.runtime.stats_interval(), Some(Duration::from_secs(60)));
        match app_config.sink_config {
            SinkConfig::Elasticsearch(es) => {
                assert_eq!(es.base_url(), "http://localhost:9200");
                assert_eq!(es.index, "carbon-es");
                assert!(es.doc_type.is_none());
            }
            other => panic!("💀 wrong sink: {other:?}"),
        }
    }

    #[test]
    fn the_one_where_old_names_still_answer_the_door() {
        let config_file = write_test_config(
            r#"
            sink_config = "InMemory"

            [in]
            port = 2103

            [runtime]
            queue_capacity = 12
            sink_parallelism = 2
            "#,
        );

        let app_config =
            load_file(config_file.path()).expect("💀 Aliases should parse.");

        assert_eq!(app_config.listener.port, 2103);
        assert_eq!(app_config.runtime.max_pending, 12);
        assert_eq!(app_config.runtime.indexer_concurrency, 2);
        assert!(matches!(app_config.sink_config, SinkConfig::InMemory));
    }

    #[test]
    fn the_one_where_the_dinosaur_config_still_boots() {
        let config_file = write_test_config(
            r#"
            [elasticsearch]
            host = "es.internal"
            port = 9201
            max_pending = 5000

            [in]
            port = 2003
            "#,
        );

        let app_config =
            load_file(config_file.path()).expect("💀 The old layout should still parse.");

        assert_eq!(app_config.listener.port, 2003);
        assert_eq!(app_config.runtime.max_pending, 5000);
        match app_config.sink_config {
            SinkConfig::Elasticsearch(es) => {
                assert_eq!(es.host, "es.internal");
                assert_eq!(es.port, 9201);
                assert_eq!(es.index, "carbon-es");
            }
            other => panic!("💀 expected Elasticsearch, got {other:?}"),
        }
    }

    #[test]
    fn the_one_where_the_new_layout_beats_the_old_one() {
        let config_file = write_test_config(
            r#"
            sink_config = "InMemory"

            [elasticsearch]
            host = "ignored.internal"
            max_pending = 5000

            [runtime]
            queue_capacity = 12
            "#,
        );

        let app_config =
            load_file(config_file.path()).expect("💀 Mixed layouts should parse.");

        assert!(matches!(app_config.sink_config, SinkConfig::InMemory));
        assert_eq!(app_config.runtime.max_pending, 12);
    }

    #[test]
    fn the_one_where_a_zero_sized_queue_is_shown_the_door() {
        let config_file = write_test_config(
            r#"
            sink_config = "InMemory"

            [runtime]
            max_pending = 0
            "#,
        );

        let err = load_file(config_file.path()).unwrap_err();
        let chain = format!("{err:#}");
        assert!(chain.contains("max_pending"), "unexpected error: {chain}");
    }

    #[test]
    fn the_one_where_backoff_floor_above_ceiling_is_rejected() {
        let config_file = write_test_config(
            r#"
            sink_config = "InMemory"

            [runtime]
            retry_backoff_ms = 500
            retry_backoff_max_ms = 100
            "#,
        );

        assert!(load_file(config_file.path()).is_err());
    }

    #[test]
    fn the_one_where_env_vars_fill_in_and_the_file_still_wins() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("CARBEX_LISTENER__PORT", "4242");
            jail.set_env("CARBEX_RUNTIME__MAX_PENDING", "77");
            jail.set_env("CARBEX_SINK_CONFIG__ELASTICSEARCH__HOST", "from-env");
            jail.create_file(
                "carbex.toml",
                r#"
                [runtime]
                max_pending = 99
                "#,
            )?;

            let app_config = load_config(Some(Path::new("carbex.toml")))
                .map_err(|e| format!("{e:#}"))?;

            assert_eq!(app_config.listener.port, 4242);
            assert_eq!(app_config.runtime.max_pending, 99, "TOML wins on conflicts");
            match app_config.sink_config {
                SinkConfig::Elasticsearch(es) => assert_eq!(es.host, "from-env"),
                other => panic!("💀 wrong sink: {other:?}"),
            }
            Ok(())
        });
    }
}
