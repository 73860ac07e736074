//! Local registry fixture shared by the unit tests.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::{Value, json};
use tiny_http::{Header, Response, Server, StatusCode};

use crate::engine::Reporter;
use crate::registry::RegistryClient;
use crate::retry::{RetryStrategyConfig, RetryStrategyType};
use crate::types::HttpOptions;

pub(crate) const TARBALL_BODY: &str = "tarball info";

#[derive(Default)]
struct RegistryState {
    routes: BTreeMap<String, (u16, String)>,
    hits: Vec<String>,
}

/// Serves packuments registered with [`TestRegistry::serve`] and answers
/// every `/tarballs/...` path with [`TARBALL_BODY`].
pub(crate) struct TestRegistry {
    pub(crate) base_url: String,
    server: Arc<Server>,
    state: Arc<Mutex<RegistryState>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl TestRegistry {
    pub(crate) fn spawn() -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").expect("server"));
        let base_url = format!("http://{}", server.server_addr());
        let state = Arc::new(Mutex::new(RegistryState::default()));

        let server_thread = Arc::clone(&server);
        let state_thread = Arc::clone(&state);
        let handle = thread::spawn(move || {
            for req in server_thread.incoming_requests() {
                let path = req.url().to_string();
                let (status, body, content_type) = {
                    let mut st = state_thread.lock().expect("lock");
                    st.hits.push(path.clone());
                    if path.starts_with("/tarballs/") {
                        (200, TARBALL_BODY.to_string(), "application/octet-stream")
                    } else if let Some((status, body)) = st.routes.get(&path) {
                        (*status, body.clone(), "application/json")
                    } else {
                        (404, "{}".to_string(), "application/json")
                    }
                };

                let resp = Response::from_string(body)
                    .with_status_code(StatusCode(status))
                    .with_header(Header::from_bytes("Content-Type", content_type).expect("header"));
                let _ = req.respond(resp);
            }
        });

        Self {
            base_url,
            server,
            state,
            handle: Some(handle),
        }
    }

    /// Serve `fixture` at `/{route}`. Re-serving replaces the previous body.
    pub(crate) fn serve(&self, route: &str, fixture: &PackageFixture) {
        let body = fixture.to_json(&self.base_url).to_string();
        self.state
            .lock()
            .expect("lock")
            .routes
            .insert(format!("/{route}"), (200, body));
    }

    pub(crate) fn serve_json(&self, route: &str, body: &str) {
        self.state
            .lock()
            .expect("lock")
            .routes
            .insert(format!("/{route}"), (200, body.to_string()));
    }

    pub(crate) fn serve_status(&self, route: &str, status: u16) {
        self.state
            .lock()
            .expect("lock")
            .routes
            .insert(format!("/{route}"), (status, "{}".to_string()));
    }

    pub(crate) fn hits_for(&self, path: &str) -> usize {
        self.state
            .lock()
            .expect("lock")
            .hits
            .iter()
            .filter(|hit| hit.as_str() == path)
            .count()
    }

    pub(crate) fn tarball_url(&self, name: &str, version: &str) -> String {
        tarball_url(&self.base_url, name, version)
    }
}

impl Drop for TestRegistry {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn tarball_url(base_url: &str, name: &str, version: &str) -> String {
    format!("{base_url}/tarballs/{}/{version}.tgz", name.replace('@', ""))
}

/// Builder for a registry packument.
#[derive(Debug, Clone)]
pub(crate) struct PackageFixture {
    name: String,
    dist_tags: BTreeMap<String, String>,
    versions: BTreeMap<String, BTreeMap<String, String>>,
}

impl PackageFixture {
    /// A package whose `latest` tag points at `latest`, which is also published.
    pub(crate) fn new(name: &str, latest: &str) -> Self {
        let mut fixture = Self {
            name: name.to_string(),
            dist_tags: BTreeMap::new(),
            versions: BTreeMap::new(),
        };
        fixture.dist_tags.insert("latest".to_string(), latest.to_string());
        fixture.version(latest)
    }

    pub(crate) fn tag(mut self, tag: &str, version: &str) -> Self {
        self.dist_tags.insert(tag.to_string(), version.to_string());
        self
    }

    pub(crate) fn version(mut self, version: &str) -> Self {
        self.versions.entry(version.to_string()).or_default();
        self
    }

    pub(crate) fn versions(self, versions: &[&str]) -> Self {
        versions.iter().fold(self, |fixture, v| fixture.version(v))
    }

    pub(crate) fn version_with_deps(mut self, version: &str, deps: &[(&str, &str)]) -> Self {
        let entry = self.versions.entry(version.to_string()).or_default();
        for (dep, requirement) in deps {
            entry.insert(dep.to_string(), requirement.to_string());
        }
        self
    }

    pub(crate) fn to_json(&self, base_url: &str) -> Value {
        let versions: serde_json::Map<String, Value> = self
            .versions
            .iter()
            .map(|(version, deps)| {
                let url_name = self.name.replace('@', "");
                (
                    version.clone(),
                    json!({
                        "name": self.name,
                        "version": version,
                        "dependencies": deps,
                        "dist": {
                            "tarball": tarball_url(base_url, &self.name, version),
                            "shasum": "0000000000000000000000000000000000000000"
                        },
                        "repository": {"type": "git", "url": format!("git://github.com/{url_name}.git")},
                        "gitHead": "1bbe95f046537640950ed4fdadaccf1195f715f7"
                    }),
                )
            })
            .collect();

        json!({
            "name": self.name,
            "readme": "ignored by normalization",
            "dist-tags": self.dist_tags,
            "versions": versions,
        })
    }
}

pub(crate) fn test_client(registry: &TestRegistry) -> RegistryClient {
    let options = HttpOptions {
        timeout: Duration::from_secs(10),
        retry: RetryStrategyConfig {
            strategy: RetryStrategyType::Immediate,
            max_attempts: 3,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        },
    };
    RegistryClient::new(&registry.base_url, &options).expect("client")
}

/// Reporter that keeps every message for assertions.
#[derive(Debug, Default)]
pub(crate) struct CollectingReporter {
    pub(crate) infos: Vec<String>,
    pub(crate) warns: Vec<String>,
    pub(crate) errors: Vec<String>,
}

impl Reporter for CollectingReporter {
    fn info(&mut self, msg: &str) {
        self.infos.push(msg.to_string());
    }

    fn warn(&mut self, msg: &str) {
        self.warns.push(msg.to_string());
    }

    fn error(&mut self, msg: &str) {
        self.errors.push(msg.to_string());
    }
}
