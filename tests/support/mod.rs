// Helpers are shared across test crates; not every helper is used in each.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use k2s_bootstrap::config::ControlSettings;
use k2s_bootstrap::control::{self, ControlRuntime};
use k2s_bootstrap::kv::MemoryStore;
use k2s_bootstrap::passwd::{NodePasswords, Passwd};
use k2s_bootstrap::router::{DbInfo, RouterState};

pub(crate) const SERVER_TOKEN: &str = "abc123";

pub(crate) fn settings(data_dir: &Path) -> ControlSettings {
    let mut settings = ControlSettings::new(None).expect("default settings");
    settings.data_dir = data_dir.to_path_buf();
    settings.token = SERVER_TOKEN.to_string();
    settings
}

pub(crate) async fn prepare(data_dir: &Path) -> (ControlSettings, ControlRuntime) {
    let settings = settings(data_dir);
    let runtime = control::prepare_with::<MemoryStore>(&settings, None)
        .await
        .expect("prepare control plane");
    (settings, runtime)
}

pub(crate) async fn router_state(
    settings: &ControlSettings,
    runtime: &ControlRuntime,
) -> Arc<RouterState> {
    let users = Passwd::read(&runtime.paths.passwd_file)
        .await
        .expect("read passwd");
    Arc::new(RouterState {
        paths: runtime.paths.clone(),
        ca_certs: runtime.authorities.server.cert_pem().to_string(),
        users,
        node_passwords: NodePasswords::new(runtime.paths.node_passwd_file.clone()),
        public_config: settings.public_config(),
        db_info: DbInfo {
            backend: settings.storage.backend.clone(),
            endpoints: Vec::new(),
        },
    })
}
