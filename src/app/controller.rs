use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use crate::adapters::{CpalCapture, GuardedHttpClient, HttpBackend, TomlConfigStore};
use crate::app::assembler::{assemble, Core, CoreDeps};
use crate::domain::{CoreConfig, CoreError};
use crate::infrastructure::init_logging;
use crate::ports::{CaptureDevice, ConfigStore, RealtimeTransport};

/// Host-facing entry point: owns configuration, logging and the live core.
pub struct AppController {
    config: RwLock<CoreConfig>,
    config_store: Arc<TomlConfigStore>,
    http: Arc<GuardedHttpClient>,
    transport: Arc<dyn RealtimeTransport>,
    /// Replaces the cpal microphone check when set.
    capture: Option<Arc<dyn CaptureDevice>>,
    core: RwLock<Arc<Core>>,
    _log_guard: Option<WorkerGuard>,
}

impl AppController {
    /// Initialize from the OS application directories, probing the
    /// microphone through cpal.
    pub fn new(transport: Arc<dyn RealtimeTransport>) -> Result<Self, CoreError> {
        Self::with_store(TomlConfigStore::new()?, transport)
    }

    /// Initialize from an explicit configuration store.
    pub fn with_store(
        config_store: TomlConfigStore,
        transport: Arc<dyn RealtimeTransport>,
    ) -> Result<Self, CoreError> {
        Self::build(config_store, transport, None)
    }

    /// Initialize with a host-provided capture check.
    pub fn with_capture(
        config_store: TomlConfigStore,
        transport: Arc<dyn RealtimeTransport>,
        capture: Arc<dyn CaptureDevice>,
    ) -> Result<Self, CoreError> {
        Self::build(config_store, transport, Some(capture))
    }

    fn build(
        config_store: TomlConfigStore,
        transport: Arc<dyn RealtimeTransport>,
        capture: Option<Arc<dyn CaptureDevice>>,
    ) -> Result<Self, CoreError> {
        let config_store = Arc::new(config_store);
        let config = config_store.load()?;

        let log_guard = init_logging(
            &config_store.logs_dir(),
            &config.logging.level,
            config.logging.file_logging,
            config.logging.max_files,
        )?;

        info!("Parley starting up");

        let http = Arc::new(GuardedHttpClient::new(&config.backend)?);
        let core = build_core(&config, &http, &transport, &capture);

        info!(base_url = %config.backend.base_url, "AppController initialized");

        Ok(Self {
            config: RwLock::new(config),
            config_store,
            http,
            transport,
            capture,
            core: RwLock::new(Arc::new(core)),
            _log_guard: log_guard,
        })
    }

    /// The live conversation core.
    pub fn core(&self) -> Arc<Core> {
        Arc::clone(&self.core.read())
    }

    pub fn config(&self) -> CoreConfig {
        self.config.read().clone()
    }

    /// Persist `config` and apply the host allow-list immediately. Other
    /// sections take effect on [`AppController::reload`].
    pub fn update_config(&self, config: CoreConfig) -> Result<(), CoreError> {
        self.http
            .set_allowed_hosts(config.backend.effective_allowed_hosts());
        self.config_store.save(&config)?;
        *self.config.write() = config;

        info!("Configuration updated");
        Ok(())
    }

    /// Replace the core with one built from the current configuration. The
    /// old core's conversation is ended first.
    pub async fn reload(&self) -> Arc<Core> {
        let old = self.core();
        old.end_conversation().await;

        let config = self.config();
        let core = Arc::new(build_core(&config, &self.http, &self.transport, &self.capture));
        *self.core.write() = Arc::clone(&core);

        info!(base_url = %config.backend.base_url, "Conversation core replaced");
        core
    }

    pub fn data_dir(&self) -> String {
        self.config_store.data_dir().to_string_lossy().to_string()
    }

    pub fn logs_dir(&self) -> String {
        self.config_store.logs_dir().to_string_lossy().to_string()
    }

    pub fn config_path(&self) -> String {
        self.config_store.config_path().to_string_lossy().to_string()
    }
}

fn build_core(
    config: &CoreConfig,
    http: &Arc<GuardedHttpClient>,
    transport: &Arc<dyn RealtimeTransport>,
    capture: &Option<Arc<dyn CaptureDevice>>,
) -> Core {
    let backend = HttpBackend::new(Arc::clone(http), &config.backend.base_url);
    let capture = match capture {
        Some(capture) => Arc::clone(capture),
        None => Arc::new(CpalCapture::new(config.connection.input_device.clone())),
    };
    assemble(
        config,
        CoreDeps {
            backend: Arc::new(backend),
            transport: Arc::clone(transport),
            capture,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Selection;
    use crate::testing::{FakeCapture, FakeTransport};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn controller(dir: &tempfile::TempDir, base_url: Option<&str>) -> AppController {
        let store = TomlConfigStore::at(dir.path().join("data"), dir.path().join("logs")).unwrap();
        let mut config = CoreConfig::new();
        config.logging.file_logging = false;
        if let Some(url) = base_url {
            config.backend.base_url = url.to_string();
        }
        store.save(&config).unwrap();

        AppController::with_capture(
            store,
            Arc::new(FakeTransport::new()),
            Arc::new(FakeCapture::new(true)),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_typed_turn_reaches_backend() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/sessions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session_id": "s-1"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/sessions/s-1/turns"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"saved": 1, "duplicates": 0})))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, Some(&server.uri()));
        let core = controller.core();

        core.select(Selection::new("pt-7", "knee")).await;
        core.send_text("It started last week").await.unwrap();
        core.coordinator.settled().await;
        core.relay.idle().await;

        assert_eq!(core.relay.stats().delivered, 1);
        assert_eq!(core.lifecycle.session_id().as_deref(), Some("s-1"));
    }

    #[tokio::test]
    async fn test_update_config_persists() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, None);

        let mut config = controller.config();
        config.connection.voice = "verse".to_string();
        config.backend.allowed_hosts = vec!["api.parley.example".to_string()];
        controller.update_config(config).unwrap();

        assert_eq!(controller.config().connection.voice, "verse");
        let reloaded = TomlConfigStore::at(dir.path().join("data"), dir.path().join("logs"))
            .unwrap()
            .load()
            .unwrap();
        assert_eq!(reloaded.connection.voice, "verse");
        assert!(controller.config_path().ends_with("config.toml"));
    }

    #[tokio::test]
    async fn test_reload_replaces_core() {
        let dir = tempfile::tempdir().unwrap();
        let controller = controller(&dir, None);

        let before = controller.core();
        before.coordinator.apply_fragment(crate::domain::Fragment::new(
            crate::domain::Role::User,
            crate::domain::Channel::Text,
            "hello",
            true,
            1_000,
        ));
        before.coordinator.settled().await;

        let after = controller.reload().await;
        assert!(!Arc::ptr_eq(&before, &after));
        assert!(after.coordinator.turns().is_empty());
        assert!(Arc::ptr_eq(&after, &controller.core()));
    }

    #[tokio::test]
    async fn test_default_capture_is_cpal() {
        let dir = tempfile::tempdir().unwrap();
        let store = TomlConfigStore::at(dir.path().join("data"), dir.path().join("logs")).unwrap();
        let mut config = CoreConfig::new();
        config.logging.file_logging = false;
        config.connection.input_device = Some("no-such-microphone".to_string());
        store.save(&config).unwrap();

        let controller = AppController::with_store(store, Arc::new(FakeTransport::new())).unwrap();
        assert_eq!(
            controller.config().connection.input_device.as_deref(),
            Some("no-such-microphone")
        );
        assert_eq!(controller.core().status(), crate::domain::ConnectionStatus::Idle);
    }
}
