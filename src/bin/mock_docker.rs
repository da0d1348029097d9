//! Mock `docker` CLI for testing modelyard without a container daemon.
//!
//! Understands exactly the subcommands the driver issues (create, start,
//! stop, restart, rm, inspect, logs, ps) and keeps its container table in a
//! JSON file named by `MOCK_DOCKER_STATE`. Failure injection:
//!
//! - `MOCK_DOCKER_FAIL_CREATE=1` - `create` exits 1
//! - `MOCK_DOCKER_FAIL_START=1`  - `start` exits 1
//!
//! Unknown container ids produce the daemon's canonical
//! `Error response from daemon: No such container: <id>` on stderr.

use std::io::Write;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Default, Serialize, Deserialize)]
struct MockState {
    containers: Vec<MockContainer>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockContainer {
    id: String,
    name: String,
    image: String,
    created: String,
    running: bool,
    status: String,
    host_port: Option<u16>,
    container_port: Option<u16>,
    env: Vec<String>,
    cmd: Vec<String>,
    device: Option<String>,
    started_at: Option<String>,
    finished_at: Option<String>,
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let code = run(&args);
    std::process::exit(code);
}

fn run(args: &[String]) -> i32 {
    let Some(subcommand) = args.first() else {
        eprintln!("usage: mock-docker <subcommand>");
        return 1;
    };

    let rest = &args[1..];
    match subcommand.as_str() {
        "create" => cmd_create(rest),
        "start" => cmd_start(rest),
        "stop" => cmd_stop(rest),
        "restart" => cmd_restart(rest),
        "rm" => cmd_rm(rest),
        "inspect" => cmd_inspect(rest),
        "logs" => cmd_logs(rest),
        "ps" => cmd_ps(rest),
        other => {
            eprintln!("mock-docker: unknown subcommand {other:?}");
            1
        }
    }
}

fn state_path() -> String {
    std::env::var("MOCK_DOCKER_STATE")
        .unwrap_or_else(|_| "/tmp/mock-docker-state.json".to_string())
}

/// Crude cross-process lock: O_EXCL on a sibling lockfile with retries.
struct StateLock {
    path: String,
}

impl StateLock {
    fn acquire() -> Self {
        let path = format!("{}.lock", state_path());
        for _ in 0..200 {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Self { path },
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        }
        // A stale lock from a killed process; steal it.
        Self { path }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn load_state() -> MockState {
    match std::fs::read_to_string(state_path()) {
        Ok(raw) => serde_json::from_str(&raw).unwrap_or_default(),
        Err(_) => MockState::default(),
    }
}

fn save_state(state: &MockState) {
    let raw = serde_json::to_string_pretty(state).expect("serialize state");
    let path = state_path();
    let tmp = format!("{path}.tmp.{}", std::process::id());
    std::fs::write(&tmp, raw).expect("write state");
    std::fs::rename(&tmp, &path).expect("replace state");
}

fn no_such_container(id: &str) -> i32 {
    eprintln!("Error response from daemon: No such container: {id}");
    1
}

fn find_mut<'a>(state: &'a mut MockState, id: &str) -> Option<&'a mut MockContainer> {
    state
        .containers
        .iter_mut()
        .find(|c| c.id == id || c.name == id)
}

fn cmd_create(args: &[String]) -> i32 {
    if std::env::var("MOCK_DOCKER_FAIL_CREATE").is_ok() {
        eprintln!("Error response from daemon: injected create failure");
        return 1;
    }

    let mut name = String::new();
    let mut host_port = None;
    let mut container_port = None;
    let mut env = Vec::new();
    let mut device = None;
    let mut image = String::new();
    let mut cmd = Vec::new();

    let mut i = 0;
    while i < args.len() {
        // Everything after the image is the engine command line, flags
        // included.
        if !image.is_empty() {
            cmd.push(args[i].clone());
            i += 1;
            continue;
        }
        match args[i].as_str() {
            "--name" => {
                name = args.get(i + 1).cloned().unwrap_or_default();
                i += 2;
            }
            "-p" => {
                if let Some(mapping) = args.get(i + 1)
                    && let Some((host, container)) = mapping.split_once(':')
                {
                    host_port = host.parse().ok();
                    container_port = container.parse().ok();
                }
                i += 2;
            }
            "-e" => {
                if let Some(entry) = args.get(i + 1) {
                    env.push(entry.clone());
                }
                i += 2;
            }
            "-v" | "--restart" => {
                i += 2;
            }
            "--gpus" => {
                device = args.get(i + 1).cloned();
                i += 2;
            }
            flag if flag.starts_with('-') => {
                // Unknown host-level flag with a value; skip both.
                i += 2;
            }
            _ => {
                image = args[i].clone();
                i += 1;
            }
        }
    }

    if name.is_empty() || image.is_empty() {
        eprintln!("mock-docker: create requires --name and an image");
        return 1;
    }

    let _lock = StateLock::acquire();
    let mut state = load_state();

    if state.containers.iter().any(|c| c.name == name) {
        eprintln!("Error response from daemon: Conflict. The container name \"/{name}\" is already in use");
        return 1;
    }

    let id = format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    );
    state.containers.push(MockContainer {
        id: id.clone(),
        name,
        image,
        created: Utc::now().to_rfc3339(),
        running: false,
        status: "created".to_string(),
        host_port,
        container_port,
        env,
        cmd,
        device,
        started_at: None,
        finished_at: None,
    });
    save_state(&state);

    println!("{id}");
    0
}

fn single_id(args: &[String]) -> Option<String> {
    args.iter().find(|a| !a.starts_with('-')).cloned()
}

fn cmd_start(args: &[String]) -> i32 {
    if std::env::var("MOCK_DOCKER_FAIL_START").is_ok() {
        eprintln!("Error response from daemon: injected start failure");
        return 1;
    }
    let Some(id) = single_id(args) else {
        return 1;
    };

    let _lock = StateLock::acquire();
    let mut state = load_state();
    let Some(container) = find_mut(&mut state, &id) else {
        return no_such_container(&id);
    };
    container.running = true;
    container.status = "running".to_string();
    container.started_at = Some(Utc::now().to_rfc3339());
    container.finished_at = None;
    save_state(&state);
    println!("{id}");
    0
}

fn cmd_stop(args: &[String]) -> i32 {
    let Some(id) = single_id(args) else {
        return 1;
    };

    let _lock = StateLock::acquire();
    let mut state = load_state();
    let Some(container) = find_mut(&mut state, &id) else {
        return no_such_container(&id);
    };
    container.running = false;
    container.status = "exited".to_string();
    container.finished_at = Some(Utc::now().to_rfc3339());
    save_state(&state);
    println!("{id}");
    0
}

fn cmd_restart(args: &[String]) -> i32 {
    let Some(id) = single_id(args) else {
        return 1;
    };

    let _lock = StateLock::acquire();
    let mut state = load_state();
    let Some(container) = find_mut(&mut state, &id) else {
        return no_such_container(&id);
    };
    container.running = true;
    container.status = "running".to_string();
    container.started_at = Some(Utc::now().to_rfc3339());
    save_state(&state);
    println!("{id}");
    0
}

fn cmd_rm(args: &[String]) -> i32 {
    let Some(id) = single_id(args) else {
        return 1;
    };

    let _lock = StateLock::acquire();
    let mut state = load_state();
    let before = state.containers.len();
    state
        .containers
        .retain(|c| c.id != id && c.name != id);
    if state.containers.len() == before {
        return no_such_container(&id);
    }
    save_state(&state);
    println!("{id}");
    0
}

fn inspect_json(container: &MockContainer) -> serde_json::Value {
    let port_bindings = match (container.host_port, container.container_port) {
        (Some(host), Some(internal)) => json!({
            format!("{internal}/tcp"): [{"HostIp": "", "HostPort": host.to_string()}]
        }),
        _ => json!({}),
    };

    let device_requests = match container.device.as_deref() {
        Some("all") => json!([{"Driver": "nvidia", "Count": -1, "Capabilities": [["gpu"]]}]),
        Some(device) => {
            let id = device.strip_prefix("device=").unwrap_or(device);
            json!([{"Driver": "nvidia", "DeviceIDs": [id], "Capabilities": [["gpu"]]}])
        }
        None => json!(null),
    };

    json!({
        "Id": container.id,
        "Name": format!("/{}", container.name),
        "Created": container.created,
        "State": {
            "Status": container.status,
            "Running": container.running,
            "StartedAt": container.started_at,
            "FinishedAt": container.finished_at,
        },
        "Config": {
            "Env": container.env,
            "Cmd": container.cmd,
            "Image": container.image,
        },
        "HostConfig": {
            "PortBindings": port_bindings,
            "DeviceRequests": device_requests,
            "RestartPolicy": {"Name": "unless-stopped"},
        },
    })
}

fn cmd_inspect(args: &[String]) -> i32 {
    // Skip "--type container".
    let id = args
        .iter()
        .enumerate()
        .filter(|(i, a)| {
            !a.starts_with('-') && (*i == 0 || args[i - 1] != "--type")
        })
        .map(|(_, a)| a.clone())
        .next();
    let Some(id) = id else {
        return 1;
    };

    let _lock = StateLock::acquire();
    let state = load_state();
    let Some(container) = state
        .containers
        .iter()
        .find(|c| c.id == id || c.name == id)
    else {
        println!("[]");
        return no_such_container(&id);
    };

    println!(
        "{}",
        serde_json::to_string_pretty(&json!([inspect_json(container)])).expect("serialize")
    );
    0
}

fn cmd_logs(args: &[String]) -> i32 {
    let mut tail = 100usize;
    let mut id = None;
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--tail" => {
                tail = args
                    .get(i + 1)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(100);
                i += 2;
            }
            other if !other.starts_with('-') => {
                id = Some(other.to_string());
                i += 1;
            }
            _ => i += 1,
        }
    }
    let Some(id) = id else {
        return 1;
    };

    let _lock = StateLock::acquire();
    let state = load_state();
    let Some(container) = state
        .containers
        .iter()
        .find(|c| c.id == id || c.name == id)
    else {
        return no_such_container(&id);
    };

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for line_no in 0..tail.min(5) {
        let _ = writeln!(out, "{} log line {line_no}", container.name);
    }
    0
}

fn cmd_ps(args: &[String]) -> i32 {
    let mut name_filter = None;
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--filter"
            && let Some(filter) = args.get(i + 1)
            && let Some(value) = filter.strip_prefix("name=")
        {
            name_filter = Some(value.to_string());
            i += 2;
        } else {
            i += 1;
        }
    }

    let _lock = StateLock::acquire();
    let state = load_state();
    for container in &state.containers {
        if let Some(ref filter) = name_filter
            && !container.name.contains(filter.as_str())
        {
            continue;
        }
        println!(
            "{}",
            json!({
                "ID": container.id,
                "Names": container.name,
                "State": container.status,
                "Image": container.image,
                "CreatedAt": container.created,
            })
        );
    }
    0
}
