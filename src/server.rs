//! Launching and stopping of redis-server and sentinel processes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

const REDIS_SERVER_BIN: &str = "redis-server";

/// Default bind address for all topology modes.
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// How long a freshly spawned process may take to accept connections.
const READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between SIGTERM and SIGKILL on stop.
const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends a signal to a process; injectable so stop failures are testable.
pub(crate) type SignalFn = fn(Pid, Signal) -> nix::Result<()>;

fn send_signal(pid: Pid, signal: Signal) -> nix::Result<()> {
    signal::kill(pid, signal)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    Node,
    Sentinel,
}

/// Handle to a single redis-server or sentinel process.
///
/// Built by [`RedisServerBuilder`] or [`RedisSentinelBuilder`]; the builder
/// writes the working directory and config file, `start` spawns the process
/// and waits until it accepts connections, `stop` terminates it and removes
/// the working directory.
pub struct RedisServer {
    kind: ServerKind,
    port: u16,
    bind: String,
    work_dir: PathBuf,
    conf_path: PathBuf,
    extra_args: Vec<String>,
    child: Mutex<Option<Child>>,
    signal: SignalFn,
}

impl RedisServer {
    pub fn kind(&self) -> ServerKind {
        self.kind
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn bind(&self) -> &str {
        &self.bind
    }

    /// The config file this server was launched with.
    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Whether a process is currently held by this handle.
    pub async fn active(&self) -> bool {
        self.child.lock().await.is_some()
    }

    /// Spawns the process and waits until it accepts TCP connections.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        if slot.is_some() {
            return Err(Error::Launch {
                executable: REDIS_SERVER_BIN.to_string(),
                reason: format!("server on port {} is already running", self.port),
            });
        }

        let stdout_path = self.work_dir.join("stdout.log");
        let stderr_path = self.work_dir.join("stderr.log");
        let stdout_file = std::fs::File::create(&stdout_path)?;
        let stderr_file = std::fs::File::create(&stderr_path)?;

        let mut cmd = Command::new(REDIS_SERVER_BIN);
        cmd.arg(&self.conf_path);
        if self.kind == ServerKind::Sentinel {
            cmd.arg("--sentinel");
        }
        for arg in &self.extra_args {
            cmd.arg(arg);
        }
        cmd.current_dir(&self.work_dir);
        cmd.stdout(stdout_file);
        cmd.stderr(stderr_file);

        info!(port = self.port, kind = ?self.kind, cmd = ?cmd.as_std(), "Spawning redis-server");

        let mut child = cmd.spawn().map_err(|e| Error::Launch {
            executable: REDIS_SERVER_BIN.to_string(),
            reason: e.to_string(),
        })?;

        // Brief wait to catch immediate failures (bad config, port in use).
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Ok(Some(status)) = child.try_wait() {
            let stderr_output = tokio::fs::read_to_string(&stderr_path)
                .await
                .unwrap_or_default();
            let stdout_output = tokio::fs::read_to_string(&stdout_path)
                .await
                .unwrap_or_default();
            error!(port = self.port, status = ?status, stderr = %stderr_output, "redis-server exited immediately");
            return Err(Error::Launch {
                executable: REDIS_SERVER_BIN.to_string(),
                reason: format!(
                    "exited immediately with {status}: {}",
                    if stderr_output.trim().is_empty() {
                        stdout_output
                    } else {
                        stderr_output
                    }
                ),
            });
        }

        if let Err(e) = self.await_ready(&mut child).await {
            let _ = child.kill().await;
            let _ = child.wait().await;
            return Err(e);
        }

        *slot = Some(child);
        info!(port = self.port, kind = ?self.kind, "redis-server ready");
        Ok(())
    }

    async fn await_ready(&self, child: &mut Child) -> Result<()> {
        let host = self.connect_host();
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;
        loop {
            if TcpStream::connect((host, self.port)).await.is_ok() {
                return Ok(());
            }
            if let Ok(Some(status)) = child.try_wait() {
                return Err(Error::Launch {
                    executable: REDIS_SERVER_BIN.to_string(),
                    reason: format!("exited with {status} before accepting connections"),
                });
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::Launch {
                    executable: REDIS_SERVER_BIN.to_string(),
                    reason: format!(
                        "port {} not accepting connections after {READY_TIMEOUT:?}",
                        self.port
                    ),
                });
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn connect_host(&self) -> &str {
        // A wildcard bind is not a connectable address.
        match self.bind.as_str() {
            "0.0.0.0" | "*" => DEFAULT_BIND,
            "::" => "::1",
            bind => bind,
        }
    }

    /// Terminates the process: SIGTERM, bounded wait, then SIGKILL.
    ///
    /// Stopping an already-stopped server is a no-op. The working directory
    /// is removed best-effort either way.
    pub async fn stop(&self) -> Result<()> {
        let mut slot = self.child.lock().await;
        if let Some(mut child) = slot.take() {
            if let Some(pid) = child.id() {
                debug!(port = self.port, pid, "Sending SIGTERM");
                match (self.signal)(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                    Err(e) => {
                        // Cannot signal the process; keep the handle so a
                        // later stop can retry.
                        warn!(port = self.port, pid, error = %e, "Failed to signal process");
                        *slot = Some(child);
                        return Err(Error::Io(std::io::Error::from_raw_os_error(e as i32)));
                    }
                }
                match tokio::time::timeout(STOP_TIMEOUT, child.wait()).await {
                    Ok(Ok(status)) => {
                        debug!(port = self.port, status = ?status, "redis-server exited")
                    }
                    Ok(Err(e)) => warn!(port = self.port, error = %e, "Failed to reap process"),
                    Err(_) => {
                        warn!(
                            port = self.port,
                            "Timeout waiting for graceful shutdown, killing"
                        );
                        child.kill().await?;
                        let _ = child.wait().await;
                    }
                }
            } else {
                // Already reaped.
                let _ = child.wait().await;
            }
            info!(port = self.port, kind = ?self.kind, "Stopped redis-server");
        }
        drop(slot);

        if let Err(e) = tokio::fs::remove_dir_all(&self.work_dir).await {
            debug!(dir = %self.work_dir.display(), error = %e, "Could not remove working directory");
        }
        Ok(())
    }

    /// Stops the server, logging instead of propagating failures.
    pub async fn stop_safely(&self) {
        if let Err(e) = self.stop().await {
            error!(port = self.port, error = %e, "Failed to stop redis-server");
        }
    }
}

/// Builds the configuration for a single data node.
pub struct RedisServerBuilder {
    port: u16,
    bind: String,
    settings: Vec<String>,
    config_file: Option<PathBuf>,
    replica_of: Option<(String, u16)>,
}

impl RedisServerBuilder {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bind: DEFAULT_BIND.to_string(),
            settings: Vec::new(),
            config_file: None,
            replica_of: None,
        }
    }

    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    pub fn bind(&mut self, bind: impl Into<String>) -> &mut Self {
        self.bind = bind.into();
        self
    }

    /// Appends a raw config line, e.g. `appendonly no`.
    pub fn setting(&mut self, line: impl Into<String>) -> &mut Self {
        self.settings.push(line.into());
        self
    }

    /// Uses an existing config file instead of generating one. A `port`
    /// inside the file is ignored; the builder's port wins.
    pub fn config_file(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.config_file = Some(path.into());
        self
    }

    /// Makes the node a replica of the given primary.
    pub fn replica_of(&mut self, host: impl Into<String>, port: u16) -> &mut Self {
        self.replica_of = Some((host.into(), port));
        self
    }

    pub fn port_number(&self) -> u16 {
        self.port
    }

    pub fn bind_address(&self) -> &str {
        &self.bind
    }

    pub fn settings_lines(&self) -> &[String] {
        &self.settings
    }

    /// Writes the working directory and config file, returning the launch
    /// handle. Nothing is spawned yet.
    pub fn build(self) -> Result<RedisServer> {
        let work_dir = create_work_dir()?;
        let (conf_path, extra_args) = match self.config_file {
            Some(user_conf) => {
                // User file is passed straight through; port, bind, dir and
                // any builder settings are overridden on the command line.
                let mut args = vec![
                    "--port".to_string(),
                    self.port.to_string(),
                    "--bind".to_string(),
                    self.bind.clone(),
                    "--dir".to_string(),
                    work_dir.display().to_string(),
                ];
                for line in &self.settings {
                    let mut parts = line.split_whitespace();
                    if let Some(keyword) = parts.next() {
                        args.push(format!("--{keyword}"));
                        args.extend(parts.map(str::to_string));
                    }
                }
                (user_conf, args)
            }
            None => {
                let mut lines = vec![
                    format!("port {}", self.port),
                    format!("bind {}", self.bind),
                    format!("dir {}", work_dir.display()),
                ];
                lines.extend(self.settings.iter().cloned());
                if let Some((host, port)) = &self.replica_of {
                    lines.push(format!("replicaof {host} {port}"));
                }
                let conf_path = work_dir.join(format!("redis-{}.conf", self.port));
                std::fs::write(&conf_path, lines.join("\n") + "\n")?;
                (conf_path, Vec::new())
            }
        };

        Ok(RedisServer {
            kind: ServerKind::Node,
            port: self.port,
            bind: self.bind,
            work_dir,
            conf_path,
            extra_args,
            child: Mutex::new(None),
            signal: send_signal,
        })
    }
}

/// Builds the configuration for a sentinel process.
pub struct RedisSentinelBuilder {
    port: u16,
    bind: String,
    settings: Vec<String>,
}

impl RedisSentinelBuilder {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bind: DEFAULT_BIND.to_string(),
            settings: Vec::new(),
        }
    }

    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    pub fn bind(&mut self, bind: impl Into<String>) -> &mut Self {
        self.bind = bind.into();
        self
    }

    /// Appends a raw sentinel config line, e.g. a monitor directive.
    pub fn setting(&mut self, line: impl Into<String>) -> &mut Self {
        self.settings.push(line.into());
        self
    }

    pub fn port_number(&self) -> u16 {
        self.port
    }

    pub fn settings_lines(&self) -> &[String] {
        &self.settings
    }

    pub fn build(self) -> Result<RedisServer> {
        let work_dir = create_work_dir()?;
        let mut lines = vec![
            format!("port {}", self.port),
            format!("bind {}", self.bind),
            format!("dir {}", work_dir.display()),
        ];
        lines.extend(self.settings.iter().cloned());
        let conf_path = work_dir.join(format!("sentinel-{}.conf", self.port));
        std::fs::write(&conf_path, lines.join("\n") + "\n")?;

        Ok(RedisServer {
            kind: ServerKind::Sentinel,
            port: self.port,
            bind: self.bind,
            work_dir,
            conf_path,
            extra_args: Vec::new(),
            child: Mutex::new(None),
            signal: send_signal,
        })
    }
}

fn create_work_dir() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!("redbed-{}", Uuid::new_v4()));
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::RedisConf;

    #[tokio::test]
    async fn build_writes_generated_config() {
        let mut builder = RedisServerBuilder::new(7001);
        builder.bind("127.0.0.1").setting("appendonly no");
        let server = builder.build().unwrap();

        let conf = RedisConf::parse_file(server.conf_path()).await.unwrap();
        assert_eq!(conf.ports(), [7001]);
        assert_eq!(conf.binds(), ["127.0.0.1"]);
        assert_eq!(conf.directives("appendonly").len(), 1);
        assert_eq!(conf.directives("dir").len(), 1);

        assert!(!server.active().await);
        server.stop().await.unwrap();
        assert!(!server.work_dir().exists());
    }

    #[tokio::test]
    async fn replica_directive_comes_last() {
        let mut builder = RedisServerBuilder::new(7002);
        builder.setting("appendonly no").replica_of("127.0.0.1", 7001);
        let server = builder.build().unwrap();

        let conf = RedisConf::parse_file(server.conf_path()).await.unwrap();
        let last = conf.all().last().unwrap();
        assert_eq!(last.keyword(), "replicaof");
        assert_eq!(last.arguments(), ["127.0.0.1", "7001"]);
        server.stop().await.unwrap();
    }

    #[tokio::test]
    async fn sentinel_config_keeps_monitor_settings_in_order() {
        let mut builder = RedisSentinelBuilder::new(27001);
        builder
            .setting("sentinel monitor Puffin 127.0.0.1 7001 1")
            .setting("sentinel down-after-milliseconds Puffin 60000");
        let sentinel = builder.build().unwrap();

        let conf = RedisConf::parse_file(sentinel.conf_path()).await.unwrap();
        let monitors = conf.directives("sentinel");
        assert_eq!(monitors.len(), 2);
        assert_eq!(
            monitors[0].arguments(),
            ["monitor", "Puffin", "127.0.0.1", "7001", "1"]
        );
        sentinel.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_without_start_is_a_noop() {
        let server = RedisServerBuilder::new(7003).build().unwrap();
        server.stop().await.unwrap();
        server.stop().await.unwrap();
        assert!(!server.active().await);
    }

    #[test]
    fn user_config_file_is_passed_through() {
        let mut builder = RedisServerBuilder::new(7004);
        builder.config_file("/etc/redis/custom.conf");
        let server = builder.build().unwrap();
        assert_eq!(server.conf_path(), Path::new("/etc/redis/custom.conf"));
    }

    #[test]
    fn builder_settings_become_overrides_with_a_user_config() {
        let mut builder = RedisServerBuilder::new(7005);
        builder
            .config_file("/etc/redis/custom.conf")
            .setting("appendonly no");
        let server = builder.build().unwrap();
        let n = server.extra_args.len();
        assert_eq!(
            &server.extra_args[n - 2..],
            ["--appendonly".to_string(), "no".to_string()]
        );
    }

    #[tokio::test]
    async fn failed_signal_keeps_the_handle_for_a_retry() {
        let server =
            test_support::server_with_placeholder_process(7006, |_, _| {
                Err(nix::errno::Errno::EPERM)
            })
            .await;
        assert!(server.stop().await.is_err());
        // The child is still held, so the server reports active and a later
        // stop can retry.
        assert!(server.active().await);
    }

    #[tokio::test]
    async fn placeholder_process_stops_cleanly_with_a_real_signal() {
        let server = test_support::server_with_placeholder_process(7007, |pid, signal| {
            nix::sys::signal::kill(pid, signal)
        })
        .await;
        server.stop().await.unwrap();
        assert!(!server.active().await);
    }
}
