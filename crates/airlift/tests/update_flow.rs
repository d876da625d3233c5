//! End-to-end update scenarios against a local catalog server.
//!
//! These drive the orchestrator tick by tick with synthetic instants:
//! all waiting (check cadence, retry backoff, grace windows) is
//! expressed against the `now` passed to `tick`, so no test sleeps.
//! The module runtime is an in-process double (artifact bytes map to
//! registered versions and can be told to refuse initialization), so
//! scenarios exercise the full download/verify/commit/reload/rollback
//! path without executing machine code.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tempfile::tempdir;
use tiny_http::{Response, Server};

use airlift::config::{AgentConfig, CatalogConfig, SignatureConfig, UpdateConfig};
use airlift::orchestrator::{Host, ModuleRuntime, Orchestrator};
use airlift::staging::{Slot, StagingStore};
use airlift::types::{LogLevel, Status, UpdateState};
use airlift_loader::{CallError, LoadError, LoadedVersion, UnloadError};

// Test catalog server

struct TestCatalog {
    base_url: String,
    routes: Arc<Mutex<HashMap<String, (u16, Vec<u8>)>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestCatalog {
    fn start() -> Self {
        let server = Server::http("127.0.0.1:0").expect("server");
        let base_url = format!("http://{}", server.server_addr());
        let routes: Arc<Mutex<HashMap<String, (u16, Vec<u8>)>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let thread_routes = Arc::clone(&routes);
        let thread_requests = Arc::clone(&requests);
        thread::spawn(move || {
            for request in server.incoming_requests() {
                let url = request.url().to_string();
                thread_requests.lock().expect("requests lock").push(url.clone());
                let response = match thread_routes.lock().expect("routes lock").get(&url) {
                    Some((status, body)) => {
                        Response::from_data(body.clone()).with_status_code(*status)
                    }
                    None => Response::from_data(b"not found".to_vec()).with_status_code(404),
                };
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            routes,
            requests,
        }
    }

    fn set(&self, path: &str, status: u16, body: Vec<u8>) {
        self.routes
            .lock()
            .expect("routes lock")
            .insert(path.to_string(), (status, body));
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().expect("requests lock").clone()
    }
}

fn manifest_json(entries: &[(&str, &str, &[u8], Option<&str>, Option<&str>)]) -> Vec<u8> {
    // (name, version, artifact bytes, priority, signature)
    let modules: Vec<String> = entries
        .iter()
        .map(|(name, version, bytes, priority, signature)| {
            let mut fields = vec![
                format!("\"latest_version\": \"v{version}\""),
                format!("\"sha256\": \"{}\"", sha256_hex(bytes)),
                format!("\"file_size\": {}", bytes.len()),
            ];
            if let Some(priority) = priority {
                fields.push(format!("\"priority\": \"{priority}\""));
            }
            if let Some(signature) = signature {
                fields.push(format!("\"signature\": \"{signature}\""));
            }
            format!("\"{name}\": {{ {} }}", fields.join(", "))
        })
        .collect();
    format!("{{ \"modules\": {{ {} }} }}", modules.join(", ")).into_bytes()
}

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

// Host double

#[derive(Default)]
struct FakeHost {
    safe: bool,
    statuses: Vec<Status>,
    logs: Vec<(LogLevel, String)>,
}

impl Host for FakeHost {
    fn safe_window(&self) -> bool {
        self.safe
    }

    fn set_status(&mut self, status: Status) {
        self.statuses.push(status);
    }

    fn log(&mut self, level: LogLevel, message: &str) {
        self.logs.push((level, message.to_string()));
    }
}

fn assert_status_subsequence(statuses: &[Status], expected: &[Status]) {
    let mut iter = statuses.iter();
    for want in expected {
        assert!(
            iter.any(|s| s == want),
            "expected status subsequence {expected:?}, got {statuses:?}"
        );
    }
}

// Module runtime double

#[derive(Default)]
struct FakeRuntime {
    /// Artifact bytes → version the module would report.
    artifacts: HashMap<Vec<u8>, String>,
    /// Artifact bytes whose `initialize` returns false.
    rejects: HashSet<Vec<u8>>,
    loaded: BTreeMap<String, (String, Vec<u8>)>,
    update_calls: usize,
}

impl FakeRuntime {
    fn register(&mut self, bytes: &[u8], version: &str) {
        self.artifacts.insert(bytes.to_vec(), version.to_string());
    }

    fn reject(&mut self, bytes: &[u8]) {
        self.rejects.insert(bytes.to_vec());
    }

    fn loaded_bytes(&self, name: &str) -> Option<&[u8]> {
        self.loaded.get(name).map(|(_, bytes)| bytes.as_slice())
    }
}

impl ModuleRuntime for FakeRuntime {
    fn load(&mut self, name: &str, bytes: &[u8]) -> Result<LoadedVersion, LoadError> {
        if self.loaded.contains_key(name) {
            return Err(LoadError::AlreadyLoaded(name.to_string()));
        }
        let Some(version) = self.artifacts.get(bytes).cloned() else {
            return Err(LoadError::InvalidArtifact("unrecognized artifact bytes"));
        };
        if self.rejects.contains(bytes) {
            return Err(LoadError::InitFailed(name.to_string()));
        }
        self.loaded
            .insert(name.to_string(), (version.clone(), bytes.to_vec()));
        Ok(LoadedVersion {
            name: name.to_string(),
            version,
        })
    }

    fn unload(&mut self, name: &str) -> Result<(), UnloadError> {
        self.loaded
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| UnloadError::NotFound(name.to_string()))
    }

    fn reload(&mut self, name: &str, bytes: &[u8]) -> Result<LoadedVersion, LoadError> {
        let _ = self.unload(name);
        self.load(name, bytes)
    }

    fn tick(&mut self) {
        self.update_calls += 1;
    }

    fn call(&self, name: &str, _slot: u32, arg: i32) -> Result<i32, CallError> {
        if self.loaded.contains_key(name) {
            Ok(arg)
        } else {
            Err(CallError::NotFound(name.to_string()))
        }
    }

    fn is_loaded(&self, name: &str) -> bool {
        self.loaded.contains_key(name)
    }
}

// Fixture

fn test_config(catalog: &TestCatalog, data_dir: &Path) -> AgentConfig {
    AgentConfig {
        catalog: CatalogConfig {
            base_url: catalog.base_url.clone(),
            bearer_token: "token-123".to_string(),
            device_id: "device-7".to_string(),
            manifest_timeout: Duration::from_secs(5),
            artifact_timeout: Duration::from_secs(5),
        },
        update: UpdateConfig {
            // Far enough out that scenario ticks never re-check by
            // accident; tests drive the first (immediate) check only.
            check_interval: Duration::from_secs(3600),
            post_commit_grace: Duration::from_secs(5),
            failure_display: Duration::from_secs(2),
            ..UpdateConfig::default()
        },
        verify: SignatureConfig::default(),
        data_dir: data_dir.to_path_buf(),
    }
}

fn seed_active(data_dir: &Path, name: &str, bytes: &[u8]) {
    let dir = data_dir.join("modules").join(name);
    fs::create_dir_all(&dir).expect("mkdir");
    fs::write(dir.join("active.bin"), bytes).expect("seed active");
}

fn read_slot(data_dir: &Path, name: &str, slot: Slot) -> Vec<u8> {
    let store = StagingStore::open(data_dir).expect("open store");
    store.read(name, slot).expect("read slot")
}

fn slot_exists(data_dir: &Path, name: &str, slot: Slot) -> bool {
    let store = StagingStore::open(data_dir).expect("open store");
    store.exists(name, slot)
}

#[test]
fn first_time_install_tracks_and_loads_the_module() {
    let catalog = TestCatalog::start();
    let dir = tempdir().expect("tempdir");
    let v1 = b"sg module v1.0.0 code ............".to_vec();

    catalog.set(
        "/manifest.json",
        200,
        manifest_json(&[("sg", "1.0.0", &v1, None, None)]),
    );
    catalog.set("/sg/sg-v1.0.0.bin", 200, v1.clone());

    let mut runtime = FakeRuntime::default();
    runtime.register(&v1, "1.0.0");

    let mut orch =
        Orchestrator::new(test_config(&catalog, dir.path()), runtime).expect("orchestrator");
    let mut host = FakeHost {
        safe: true,
        ..Default::default()
    };

    let t0 = Instant::now();
    orch.tick(t0, &mut host);

    assert_eq!(orch.get_module_version("sg"), Some("1.0.0".parse().unwrap()));
    assert!(orch.runtime().is_loaded("sg"));
    assert_eq!(orch.runtime().loaded_bytes("sg"), Some(v1.as_slice()));
    assert_eq!(read_slot(dir.path(), "sg", Slot::Active), v1);
    assert_status_subsequence(
        &host.statuses,
        &[
            Status::CheckingUpdates,
            Status::UpdateAvailable,
            Status::Downloading,
            Status::Applying,
            Status::Success,
        ],
    );

    let receipts = orch.receipts();
    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].module, "sg");
    assert_eq!(receipts[0].from, None);
    assert_eq!(receipts[0].to, "1.0.0");
    assert!(matches!(receipts[0].state, UpdateState::Applied { .. }));

    // Grace elapses; the agent settles back to idle.
    orch.tick(t0 + Duration::from_secs(6), &mut host);
    assert_eq!(host.statuses.last(), Some(&Status::Idle));
}

#[test]
fn upgrade_rolls_back_when_the_new_module_refuses_to_initialize() {
    let catalog = TestCatalog::start();
    let dir = tempdir().expect("tempdir");
    let v1 = b"sg module v1.0.0 code ............".to_vec();
    let v2 = b"sg module v1.1.0 code ............".to_vec();

    seed_active(dir.path(), "sg", &v1);
    catalog.set(
        "/manifest.json",
        200,
        manifest_json(&[("sg", "1.1.0", &v2, None, None)]),
    );
    catalog.set("/sg/sg-v1.1.0.bin", 200, v2.clone());

    let mut runtime = FakeRuntime::default();
    runtime.register(&v1, "1.0.0");
    runtime.register(&v2, "1.1.0");
    runtime.reject(&v2);

    let mut orch =
        Orchestrator::new(test_config(&catalog, dir.path()), runtime).expect("orchestrator");
    let mut host = FakeHost {
        safe: true,
        ..Default::default()
    };

    orch.tick(Instant::now(), &mut host);

    // Rollback restored the 1.0.0 bytes and reloaded them.
    assert_eq!(orch.get_module_version("sg"), Some("1.0.0".parse().unwrap()));
    assert_eq!(orch.runtime().loaded_bytes("sg"), Some(v1.as_slice()));
    assert_eq!(read_slot(dir.path(), "sg", Slot::Active), v1);
    assert!(!slot_exists(dir.path(), "sg", Slot::Backup));
    assert_eq!(host.statuses.last(), Some(&Status::Failure));

    let receipts = orch.receipts();
    assert_eq!(receipts.len(), 1);
    match &receipts[0].state {
        UpdateState::RolledBack { restored, .. } => {
            assert_eq!(restored.as_deref(), Some("1.0.0"));
        }
        other => panic!("expected rollback, got {other:?}"),
    }
}

#[test]
fn digest_mismatch_discards_staging_without_commit() {
    let catalog = TestCatalog::start();
    let dir = tempdir().expect("tempdir");
    let v1 = b"sg module v1.0.0 code ............".to_vec();
    let v2 = b"sg module v1.1.0 code ............".to_vec();
    let tampered = b"sg module v1.1.0 TAMPERED .......".to_vec();

    seed_active(dir.path(), "sg", &v1);
    // Manifest promises the digest of v2 but the catalog serves
    // different bytes.
    catalog.set(
        "/manifest.json",
        200,
        manifest_json(&[("sg", "1.1.0", &v2, None, None)]),
    );
    catalog.set("/sg/sg-v1.1.0.bin", 200, tampered);

    let mut runtime = FakeRuntime::default();
    runtime.register(&v1, "1.0.0");
    runtime.register(&v2, "1.1.0");

    let mut orch =
        Orchestrator::new(test_config(&catalog, dir.path()), runtime).expect("orchestrator");
    let mut host = FakeHost {
        safe: true,
        ..Default::default()
    };

    orch.tick(Instant::now(), &mut host);

    assert_eq!(orch.get_module_version("sg"), Some("1.0.0".parse().unwrap()));
    assert_eq!(orch.runtime().loaded_bytes("sg"), Some(v1.as_slice()));
    assert_eq!(read_slot(dir.path(), "sg", Slot::Active), v1);
    assert!(!slot_exists(dir.path(), "sg", Slot::Staging));
    assert!(!slot_exists(dir.path(), "sg", Slot::Backup));
    assert_eq!(host.statuses.last(), Some(&Status::Failure));

    match &orch.receipts()[0].state {
        UpdateState::Failed { message, .. } => {
            assert!(message.contains("digest mismatch"), "message: {message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn power_loss_mid_commit_recovers_to_the_new_binary_on_boot() {
    let catalog = TestCatalog::start();
    let dir = tempdir().expect("tempdir");
    let v1 = b"sg module v1.0.0 code ............".to_vec();
    let v2 = b"sg module v1.1.0 code ............".to_vec();

    // Crash state: staging durable, journal marker written, renames
    // not yet performed.
    let module_dir = dir.path().join("modules").join("sg");
    fs::create_dir_all(&module_dir).expect("mkdir");
    fs::write(module_dir.join("active.bin"), &v1).expect("write active");
    fs::write(module_dir.join("staging.bin"), &v2).expect("write staging");
    fs::write(module_dir.join(".commit"), b"airlift.commit.v1\n").expect("write marker");

    catalog.set(
        "/manifest.json",
        200,
        manifest_json(&[("sg", "1.1.0", &v2, None, None)]),
    );

    let mut runtime = FakeRuntime::default();
    runtime.register(&v1, "1.0.0");
    runtime.register(&v2, "1.1.0");

    let mut orch =
        Orchestrator::new(test_config(&catalog, dir.path()), runtime).expect("orchestrator");
    let mut host = FakeHost {
        safe: true,
        ..Default::default()
    };

    orch.tick(Instant::now(), &mut host);

    // Recovery replayed the rename: the new bytes are active and
    // loaded, and the manifest offers nothing further.
    assert_eq!(orch.get_module_version("sg"), Some("1.1.0".parse().unwrap()));
    assert_eq!(orch.runtime().loaded_bytes("sg"), Some(v2.as_slice()));
    assert_eq!(read_slot(dir.path(), "sg", Slot::Active), v2);
    assert_eq!(read_slot(dir.path(), "sg", Slot::Backup), v1);
    assert!(!module_dir.join(".commit").exists());
    assert!(orch.pending_updates().is_empty());
    assert_eq!(host.statuses.last(), Some(&Status::Idle));
}

#[test]
fn critical_updates_drain_before_normal_ones_sequentially() {
    let catalog = TestCatalog::start();
    let dir = tempdir().expect("tempdir");
    let sg_v1 = b"sg module v1.0.0 code ............".to_vec();
    let sg_v2 = b"sg module v1.1.0 code ............".to_vec();
    let ds_v1 = b"ds module v1.0.0 code ............".to_vec();
    let ds_v2 = b"ds module v1.1.0 code ............".to_vec();

    seed_active(dir.path(), "sg", &sg_v1);
    seed_active(dir.path(), "ds", &ds_v1);
    catalog.set(
        "/manifest.json",
        200,
        manifest_json(&[
            ("sg", "1.1.0", &sg_v2, Some("normal"), None),
            ("ds", "1.1.0", &ds_v2, Some("critical"), None),
        ]),
    );
    catalog.set("/sg/sg-v1.1.0.bin", 200, sg_v2.clone());
    catalog.set("/ds/ds-v1.1.0.bin", 200, ds_v2.clone());

    let mut runtime = FakeRuntime::default();
    runtime.register(&sg_v1, "1.0.0");
    runtime.register(&sg_v2, "1.1.0");
    runtime.register(&ds_v1, "1.0.0");
    runtime.register(&ds_v2, "1.1.0");

    let mut orch =
        Orchestrator::new(test_config(&catalog, dir.path()), runtime).expect("orchestrator");
    let mut host = FakeHost {
        safe: true,
        ..Default::default()
    };

    let t0 = Instant::now();
    // First tick: check, then the critical ds update applies.
    orch.tick(t0, &mut host);
    assert_eq!(orch.get_module_version("ds"), Some("1.1.0".parse().unwrap()));
    assert_eq!(orch.get_module_version("sg"), Some("1.0.0".parse().unwrap()));
    assert_eq!(orch.pending_updates().len(), 1);

    // Grace elapses, sg is picked up next.
    orch.tick(t0 + Duration::from_secs(6), &mut host);
    orch.tick(t0 + Duration::from_secs(7), &mut host);
    assert_eq!(orch.get_module_version("sg"), Some("1.1.0".parse().unwrap()));

    let receipts = orch.receipts();
    assert_eq!(receipts.len(), 2);
    assert_eq!(receipts[0].module, "ds");
    assert_eq!(receipts[1].module, "sg");
    assert!(receipts
        .iter()
        .all(|r| matches!(r.state, UpdateState::Applied { .. })));
}

#[test]
fn required_signature_missing_aborts_before_the_artifact_fetch() {
    let catalog = TestCatalog::start();
    let dir = tempdir().expect("tempdir");
    let v1 = b"sg module v1.0.0 code ............".to_vec();

    catalog.set(
        "/manifest.json",
        200,
        manifest_json(&[("sg", "1.0.0", &v1, None, None)]),
    );
    catalog.set("/sg/sg-v1.0.0.bin", 200, v1.clone());

    let mut runtime = FakeRuntime::default();
    runtime.register(&v1, "1.0.0");

    // Real key so the verifier construction succeeds; the manifest
    // entry simply carries no signature.
    use rsa::pkcs8::EncodePublicKey;
    let mut rng = rand::thread_rng();
    let private = rsa::RsaPrivateKey::new(&mut rng, 2048).expect("generate key");
    let pem = private
        .to_public_key()
        .to_public_key_pem(rsa::pkcs8::LineEnding::LF)
        .expect("pem");

    let mut config = test_config(&catalog, dir.path());
    config.verify = SignatureConfig {
        signature_required: true,
        signing_public_key_pem: Some(pem),
    };

    let mut orch = Orchestrator::new(config, runtime).expect("orchestrator");
    let mut host = FakeHost {
        safe: true,
        ..Default::default()
    };

    orch.tick(Instant::now(), &mut host);

    assert_eq!(host.statuses.last(), Some(&Status::Failure));
    assert!(!orch.runtime().is_loaded("sg"));
    match &orch.receipts()[0].state {
        UpdateState::Failed { message, .. } => {
            assert!(message.contains("signature"), "message: {message}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    // The artifact was never requested.
    assert_eq!(catalog.requests(), vec!["/manifest.json".to_string()]);
}

#[test]
fn download_retries_follow_the_backoff_ladder_then_succeed() {
    let catalog = TestCatalog::start();
    let dir = tempdir().expect("tempdir");
    let v1 = b"sg module v1.0.0 code ............".to_vec();

    catalog.set(
        "/manifest.json",
        200,
        manifest_json(&[("sg", "1.0.0", &v1, None, None)]),
    );
    catalog.set("/sg/sg-v1.0.0.bin", 503, b"unavailable".to_vec());

    let mut runtime = FakeRuntime::default();
    runtime.register(&v1, "1.0.0");

    let mut orch =
        Orchestrator::new(test_config(&catalog, dir.path()), runtime).expect("orchestrator");
    let mut host = FakeHost {
        safe: true,
        ..Default::default()
    };

    let t0 = Instant::now();
    orch.tick(t0, &mut host); // attempt 1 fails; next at t0+1s
    let after_first = catalog.requests().len();

    // Before the backoff expires nothing new is fetched.
    orch.tick(t0 + Duration::from_millis(500), &mut host);
    assert_eq!(catalog.requests().len(), after_first);

    orch.tick(t0 + Duration::from_millis(1100), &mut host); // attempt 2 fails; next +2s

    // The catalog heals; attempt 3 lands after the 2s delay.
    catalog.set("/sg/sg-v1.0.0.bin", 200, v1.clone());
    orch.tick(t0 + Duration::from_millis(3200), &mut host);

    assert_eq!(orch.get_module_version("sg"), Some("1.0.0".parse().unwrap()));
    let receipts = orch.receipts();
    assert!(matches!(receipts[0].state, UpdateState::Applied { .. }));
    assert_eq!(receipts[0].attempts.len(), 2);
    assert_eq!(receipts[0].attempts[0].delay_before_ms, 1000);
    assert_eq!(receipts[0].attempts[1].delay_before_ms, 2000);
}

#[test]
fn losing_the_safe_window_past_the_threshold_cancels_and_requeues() {
    let catalog = TestCatalog::start();
    let dir = tempdir().expect("tempdir");
    let v1 = b"sg module v1.0.0 code ............".to_vec();

    catalog.set(
        "/manifest.json",
        200,
        manifest_json(&[("sg", "1.0.0", &v1, None, None)]),
    );
    // Artifact stays unavailable so the update lingers in downloading.
    catalog.set("/sg/sg-v1.0.0.bin", 503, b"unavailable".to_vec());

    let mut runtime = FakeRuntime::default();
    runtime.register(&v1, "1.0.0");

    let mut orch =
        Orchestrator::new(test_config(&catalog, dir.path()), runtime).expect("orchestrator");
    let mut host = FakeHost {
        safe: true,
        ..Default::default()
    };

    let t0 = Instant::now();
    orch.tick(t0, &mut host); // attempt 1 fails, retry scheduled

    host.safe = false;
    orch.tick(t0 + Duration::from_secs(2), &mut host); // unsafe noticed
    orch.tick(t0 + Duration::from_secs(8), &mut host); // threshold passed: cancel

    assert!(matches!(
        orch.receipts()[0].state,
        UpdateState::Cancelled { .. }
    ));
    // The update is requeued for when the window returns.
    assert_eq!(orch.pending_updates().len(), 1);
    assert_eq!(orch.pending_updates()[0].name, "sg");
    assert!(!slot_exists(dir.path(), "sg", Slot::Staging));
    assert_eq!(host.statuses.last(), Some(&Status::UpdateAvailable));
}

#[test]
fn no_safe_window_means_no_download_starts() {
    let catalog = TestCatalog::start();
    let dir = tempdir().expect("tempdir");
    let v1 = b"sg module v1.0.0 code ............".to_vec();

    catalog.set(
        "/manifest.json",
        200,
        manifest_json(&[("sg", "1.0.0", &v1, None, None)]),
    );
    catalog.set("/sg/sg-v1.0.0.bin", 200, v1.clone());

    let mut runtime = FakeRuntime::default();
    runtime.register(&v1, "1.0.0");

    let mut orch =
        Orchestrator::new(test_config(&catalog, dir.path()), runtime).expect("orchestrator");
    let mut host = FakeHost::default(); // safe = false

    let t0 = Instant::now();
    orch.tick(t0, &mut host);
    orch.tick(t0 + Duration::from_secs(1), &mut host);

    assert_eq!(orch.pending_updates().len(), 1);
    assert!(!orch.runtime().is_loaded("sg"));
    assert_eq!(catalog.requests(), vec!["/manifest.json".to_string()]);
    assert_eq!(host.statuses.last(), Some(&Status::UpdateAvailable));
}

#[test]
fn module_update_hooks_run_once_per_tick_throughout() {
    let catalog = TestCatalog::start();
    let dir = tempdir().expect("tempdir");
    catalog.set("/manifest.json", 200, manifest_json(&[]));

    let runtime = FakeRuntime::default();
    let mut orch =
        Orchestrator::new(test_config(&catalog, dir.path()), runtime).expect("orchestrator");
    let mut host = FakeHost {
        safe: true,
        ..Default::default()
    };

    let t0 = Instant::now();
    for i in 0..5 {
        orch.tick(t0 + Duration::from_millis(i * 100), &mut host);
    }
    assert_eq!(orch.runtime().update_calls, 5);
}

#[test]
fn check_failure_returns_to_normal_and_the_next_check_recovers() {
    let catalog = TestCatalog::start();
    let dir = tempdir().expect("tempdir");
    let v1 = b"sg module v1.0.0 code ............".to_vec();

    catalog.set("/manifest.json", 500, b"boom".to_vec());

    let mut runtime = FakeRuntime::default();
    runtime.register(&v1, "1.0.0");

    let mut config = test_config(&catalog, dir.path());
    config.update.check_interval = Duration::from_secs(30);
    let mut orch = Orchestrator::new(config, runtime).expect("orchestrator");
    let mut host = FakeHost {
        safe: true,
        ..Default::default()
    };

    let t0 = Instant::now();
    orch.tick(t0, &mut host);
    assert_eq!(host.statuses.last(), Some(&Status::Error));
    assert!(orch.pending_updates().is_empty());

    // Catalog heals before the next interval.
    catalog.set(
        "/manifest.json",
        200,
        manifest_json(&[("sg", "1.0.0", &v1, None, None)]),
    );
    catalog.set("/sg/sg-v1.0.0.bin", 200, v1.clone());

    orch.tick(t0 + Duration::from_secs(31), &mut host);
    assert_eq!(orch.get_module_version("sg"), Some("1.0.0".parse().unwrap()));
    assert_eq!(host.statuses.last(), Some(&Status::Success));
}
