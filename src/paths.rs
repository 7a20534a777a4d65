use std::path::{Path, PathBuf};

const TLS_DIR: &str = "tls";
const CRED_DIR: &str = "cred";
const STATIC_DIR: &str = "static";
const NODE_TOKEN_FILE: &str = "node-token";

/// A certificate and its private key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertKeyPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl CertKeyPaths {
    fn in_dir(dir: &Path, stem: &str) -> Self {
        Self {
            cert: dir.join(format!("{stem}.crt")),
            key: dir.join(format!("{stem}.key")),
        }
    }
}

/// Every file the control plane reads or writes below its data directory.
///
/// Built once at startup and passed by reference to the certificate,
/// credential and replication code.
#[derive(Debug, Clone)]
pub struct ControlPaths {
    pub data_dir: PathBuf,
    pub tls_dir: PathBuf,
    pub cred_dir: PathBuf,

    pub client_ca: CertKeyPaths,
    pub server_ca: CertKeyPaths,
    pub request_header_ca: CertKeyPaths,
    pub legacy_token_ca: CertKeyPaths,

    pub client_admin: CertKeyPaths,
    pub client_controller: CertKeyPaths,
    pub client_scheduler: CertKeyPaths,
    pub client_kube_apiserver: CertKeyPaths,
    pub client_kube_proxy: CertKeyPaths,
    pub client_k2s_controller: CertKeyPaths,
    pub client_cloud_controller: CertKeyPaths,
    pub client_auth_proxy: CertKeyPaths,
    pub serving_kube_apiserver: CertKeyPaths,
    pub serving_listener: CertKeyPaths,
    pub client_kubelet_key: PathBuf,
    pub serving_kubelet_key: PathBuf,
    pub service_key: PathBuf,

    pub passwd_file: PathBuf,
    pub node_passwd_file: PathBuf,
    pub ipsec_key: PathBuf,

    pub kubeconfig_admin: PathBuf,
    pub kubeconfig_controller: PathBuf,
    pub kubeconfig_scheduler: PathBuf,
    pub kubeconfig_api_server: PathBuf,
    pub kubeconfig_cloud_controller: PathBuf,

    pub node_token: PathBuf,
    pub static_dir: PathBuf,
}

impl ControlPaths {
    #[must_use]
    pub fn new(data_dir: &Path) -> Self {
        let tls = data_dir.join(TLS_DIR);
        let cred = data_dir.join(CRED_DIR);
        Self {
            client_ca: CertKeyPaths::in_dir(&tls, "client-ca"),
            server_ca: CertKeyPaths::in_dir(&tls, "server-ca"),
            request_header_ca: CertKeyPaths::in_dir(&tls, "request-header-ca"),
            legacy_token_ca: CertKeyPaths::in_dir(&tls, "token-ca"),

            client_admin: CertKeyPaths::in_dir(&tls, "client-admin"),
            client_controller: CertKeyPaths::in_dir(&tls, "client-controller"),
            client_scheduler: CertKeyPaths::in_dir(&tls, "client-scheduler"),
            client_kube_apiserver: CertKeyPaths::in_dir(&tls, "client-kube-apiserver"),
            client_kube_proxy: CertKeyPaths::in_dir(&tls, "client-kube-proxy"),
            client_k2s_controller: CertKeyPaths::in_dir(&tls, "client-k2s-controller"),
            client_cloud_controller: CertKeyPaths::in_dir(&tls, "client-cloud-controller"),
            client_auth_proxy: CertKeyPaths::in_dir(&tls, "client-auth-proxy"),
            serving_kube_apiserver: CertKeyPaths::in_dir(&tls, "serving-kube-apiserver"),
            serving_listener: CertKeyPaths::in_dir(&tls, "serving-listener"),
            client_kubelet_key: tls.join("client-kubelet.key"),
            serving_kubelet_key: tls.join("serving-kubelet.key"),
            service_key: tls.join("service.key"),

            passwd_file: cred.join("passwd"),
            node_passwd_file: cred.join("node-passwd"),
            ipsec_key: cred.join("ipsec.psk"),

            kubeconfig_admin: cred.join("admin.kubeconfig"),
            kubeconfig_controller: cred.join("controller.kubeconfig"),
            kubeconfig_scheduler: cred.join("scheduler.kubeconfig"),
            kubeconfig_api_server: cred.join("api-server.kubeconfig"),
            kubeconfig_cloud_controller: cred.join("cloud-controller.kubeconfig"),

            node_token: data_dir.join(NODE_TOKEN_FILE),
            static_dir: data_dir.join(STATIC_DIR),

            data_dir: data_dir.to_path_buf(),
            tls_dir: tls,
            cred_dir: cred,
        }
    }
}
